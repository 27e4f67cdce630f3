//! Amazon EC2 implementation of [`Provider`].
//!
//! Helper instances are grouped by security group membership. Describe calls
//! that address a single resource map EC2's `*.NotFound` codes to `None`.

mod convert;
mod error;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{Filter, InstanceType, IpPermission, IpRange, Placement};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::provider::{
    AttachmentState, ImageInfo, InstanceSnapshot, KeyPairInfo, LaunchRequest, Provider,
    ProviderFuture, SecurityGroup, VolumeSnapshot, VolumeStatus, ZoneInfo,
};

pub use error::Ec2ProviderError;

/// Maps `NotFound` errors to `Ok(None)`.
fn absent_if_not_found<T>(
    result: Result<Option<T>, Ec2ProviderError>,
) -> Result<Option<T>, Ec2ProviderError> {
    match result {
        Err(err) if err.is_not_found() => Ok(None),
        other => other,
    }
}

/// Provider backed by the EC2 API of one region.
#[derive(Clone, Debug)]
pub struct Ec2Provider {
    client: Client,
    region: String,
}

impl Ec2Provider {
    /// Loads AWS credentials and settings from the environment for `region`.
    pub async fn for_region(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
            region: region.to_owned(),
        }
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: Client, region: String) -> Self {
        Self { client, region }
    }

    /// Region the provider talks to.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    async fn describe_instances_matching(
        &self,
        filter: Option<Filter>,
        instance_id: Option<&str>,
    ) -> Result<Vec<InstanceSnapshot>, Ec2ProviderError> {
        let output = self
            .client
            .describe_instances()
            .set_filters(filter.map(|value| vec![value]))
            .set_instance_ids(instance_id.map(|id| vec![id.to_owned()]))
            .send()
            .await
            .map_err(|err| Ec2ProviderError::from_sdk("DescribeInstances", &err))?;
        Ok(output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .filter_map(convert::instance_snapshot)
            .collect())
    }
}

impl Provider for Ec2Provider {
    type Error = Ec2ProviderError;

    fn find_security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<SecurityGroup>, Self::Error> {
        Box::pin(async move {
            let output = self
                .client
                .describe_security_groups()
                .filters(Filter::builder().name("group-name").values(name).build())
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DescribeSecurityGroups", &err))?;
            Ok(output.security_groups().iter().find_map(|group| {
                Some(SecurityGroup {
                    id: group.group_id()?.to_owned(),
                    name: group.group_name().unwrap_or(name).to_owned(),
                    description: group.description().unwrap_or_default().to_owned(),
                })
            }))
        })
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, SecurityGroup, Self::Error> {
        Box::pin(async move {
            let output = self
                .client
                .create_security_group()
                .group_name(name)
                .description(description)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("CreateSecurityGroup", &err))?;
            let id = output
                .group_id()
                .ok_or(Ec2ProviderError::MissingField {
                    operation: "CreateSecurityGroup",
                    field: "GroupId",
                })?
                .to_owned();
            Ok(SecurityGroup {
                id,
                name: name.to_owned(),
                description: description.to_owned(),
            })
        })
    }

    fn authorize_ssh_ingress<'a>(
        &'a self,
        group: &'a SecurityGroup,
        port: u16,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let ssh = IpPermission::builder()
                .ip_protocol("tcp")
                .from_port(i32::from(port))
                .to_port(i32::from(port))
                .ip_ranges(
                    IpRange::builder()
                        .cidr_ip("0.0.0.0/0")
                        .description("blockprep ssh")
                        .build(),
                )
                .build();
            self.client
                .authorize_security_group_ingress()
                .group_id(&group.id)
                .ip_permissions(ssh)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("AuthorizeSecurityGroupIngress", &err))?;
            Ok(())
        })
    }

    fn delete_security_group<'a>(
        &'a self,
        group: &'a SecurityGroup,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .delete_security_group()
                .group_id(&group.id)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DeleteSecurityGroup", &err))?;
            Ok(())
        })
    }

    fn list_group_instances<'a>(
        &'a self,
        group: &'a SecurityGroup,
    ) -> ProviderFuture<'a, Vec<InstanceSnapshot>, Self::Error> {
        Box::pin(async move {
            let filter = Filter::builder()
                .name("instance.group-id")
                .values(&group.id)
                .build();
            self.describe_instances_matching(Some(filter), None).await
        })
    }

    fn run_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ProviderFuture<'a, InstanceSnapshot, Self::Error> {
        Box::pin(async move {
            let output = self
                .client
                .run_instances()
                .image_id(&request.image_id)
                .instance_type(InstanceType::from(request.instance_type.as_str()))
                .min_count(1)
                .max_count(1)
                .key_name(&request.key_name)
                .security_group_ids(&request.security_group.id)
                .placement(
                    Placement::builder()
                        .availability_zone(&request.zone)
                        .build(),
                )
                .user_data(STANDARD.encode(request.user_data.as_bytes()))
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("RunInstances", &err))?;
            output
                .instances()
                .first()
                .and_then(convert::instance_snapshot)
                .ok_or(Ec2ProviderError::MissingField {
                    operation: "RunInstances",
                    field: "Instances",
                })
        })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceSnapshot>, Self::Error> {
        Box::pin(async move {
            let found = self
                .describe_instances_matching(None, Some(instance_id))
                .await
                .map(|instances| {
                    instances
                        .into_iter()
                        .find(|instance| instance.id == instance_id)
                });
            absent_if_not_found(found)
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .terminate_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("TerminateInstances", &err))?;
            debug!(instance_id, "termination requested");
            Ok(())
        })
    }

    fn create_volume<'a>(
        &'a self,
        size_gb: u32,
        zone: &'a str,
    ) -> ProviderFuture<'a, VolumeSnapshot, Self::Error> {
        Box::pin(async move {
            let size = i32::try_from(size_gb).map_err(|_| Ec2ProviderError::InvalidInput {
                what: "volume size",
                value: size_gb.to_string(),
            })?;
            let output = self
                .client
                .create_volume()
                .size(size)
                .availability_zone(zone)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("CreateVolume", &err))?;
            let id = output.volume_id().ok_or(Ec2ProviderError::MissingField {
                operation: "CreateVolume",
                field: "VolumeId",
            })?;
            Ok(VolumeSnapshot {
                id: id.to_owned(),
                zone: output.availability_zone().unwrap_or(zone).to_owned(),
                status: output
                    .state()
                    .map_or(VolumeStatus::Creating, |state| VolumeStatus::parse(state.as_str())),
                attachment: AttachmentState::Detached,
            })
        })
    }

    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, Option<VolumeSnapshot>, Self::Error> {
        Box::pin(async move {
            let found = self
                .client
                .describe_volumes()
                .volume_ids(volume_id)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DescribeVolumes", &err))
                .map(|output| output.volumes().iter().find_map(convert::volume_snapshot));
            absent_if_not_found(found)
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .attach_volume()
                .volume_id(volume_id)
                .instance_id(instance_id)
                .device(device)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("AttachVolume", &err))?;
            Ok(())
        })
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.client
                .detach_volume()
                .volume_id(volume_id)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DetachVolume", &err))?;
            Ok(())
        })
    }

    fn describe_image<'a>(
        &'a self,
        image_id: &'a str,
    ) -> ProviderFuture<'a, Option<ImageInfo>, Self::Error> {
        Box::pin(async move {
            let found = self
                .client
                .describe_images()
                .image_ids(image_id)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DescribeImages", &err))
                .map(|output| {
                    output.images().iter().find_map(|image| {
                        image.image_id().map(|id| ImageInfo { id: id.to_owned() })
                    })
                });
            absent_if_not_found(found)
        })
    }

    fn describe_zone<'a>(
        &'a self,
        zone: &'a str,
    ) -> ProviderFuture<'a, Option<ZoneInfo>, Self::Error> {
        Box::pin(async move {
            let output = self
                .client
                .describe_availability_zones()
                .filters(Filter::builder().name("zone-name").values(zone).build())
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DescribeAvailabilityZones", &err))?;
            Ok(output
                .availability_zones()
                .iter()
                .find_map(convert::zone_info))
        })
    }

    fn list_key_pairs(&self) -> ProviderFuture<'_, Vec<KeyPairInfo>, Self::Error> {
        Box::pin(async move {
            let output = self
                .client
                .describe_key_pairs()
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DescribeKeyPairs", &err))?;
            Ok(output
                .key_pairs()
                .iter()
                .filter_map(|pair| {
                    pair.key_name().map(|name| KeyPairInfo {
                        name: name.to_owned(),
                    })
                })
                .collect())
        })
    }

    fn describe_key_pair<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<KeyPairInfo>, Self::Error> {
        Box::pin(async move {
            let found = self
                .client
                .describe_key_pairs()
                .key_names(name)
                .send()
                .await
                .map_err(|err| Ec2ProviderError::from_sdk("DescribeKeyPairs", &err))
                .map(|output| {
                    output.key_pairs().iter().find_map(|pair| {
                        pair.key_name().map(|known| KeyPairInfo {
                            name: known.to_owned(),
                        })
                    })
                });
            absent_if_not_found(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_becomes_absent() {
        let missing: Result<Option<()>, _> = Err(Ec2ProviderError::classify(
            "DescribeVolumes",
            Some("InvalidVolume.NotFound"),
            Some("vol-1 does not exist"),
        ));
        assert_eq!(absent_if_not_found(missing), Ok(None));
    }

    #[test]
    fn other_failures_are_kept() {
        let failed: Result<Option<()>, _> = Err(Ec2ProviderError::classify(
            "DescribeVolumes",
            Some("UnauthorizedOperation"),
            Some("denied"),
        ));
        assert!(absent_if_not_found(failed).is_err());
    }
}
