//! Provider abstraction for the remote compute and storage service.
//!
//! The provisioning workflow only ever talks to the cloud through this trait.
//! [`crate::ec2::Ec2Provider`] implements it against Amazon EC2 and
//! [`crate::test_support::FakeProvider`] implements it in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Security group used as the discovery namespace for helper instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroup {
    /// Provider identifier (for example `sg-0123`).
    pub id: String,
    /// Group name, unique per account and region.
    pub name: String,
    /// Free-form description.
    pub description: String,
}

/// Lifecycle state reported for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Launch accepted, not yet running.
    Pending,
    /// Running.
    Running,
    /// Termination in progress.
    ShuttingDown,
    /// Terminated.
    Terminated,
    /// Stop in progress.
    Stopping,
    /// Stopped.
    Stopped,
    /// Any state this crate does not model.
    Other(String),
}

impl InstanceState {
    /// Parses the provider's textual state name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns `true` for states a helper may be reused from.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns `true` once the instance can no longer come back.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Other(other) => other.as_str(),
        };
        formatter.write_str(text)
    }
}

/// Point-in-time view of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    /// Provider identifier (for example `i-0123`).
    pub id: String,
    /// Availability zone the instance is placed in.
    pub zone: String,
    /// Reported lifecycle state.
    pub state: InstanceState,
    /// Occupied device paths mapped to the volume attached there.
    pub block_devices: BTreeMap<String, String>,
    /// Public DNS name or address, once assigned.
    pub public_address: Option<String>,
}

/// Status of a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeStatus {
    /// Being created.
    Creating,
    /// Ready to be attached.
    Available,
    /// Attached to an instance.
    InUse,
    /// Being deleted.
    Deleting,
    /// Creation failed.
    Error,
    /// Any status this crate does not model.
    Other(String),
}

impl VolumeStatus {
    /// Parses the provider's textual status.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "deleting" => Self::Deleting,
            "error" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::Other(other) => other.as_str(),
        };
        formatter.write_str(text)
    }
}

/// Attachment phase of a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttachmentState {
    /// Not attached to any instance.
    Detached,
    /// Attachment in progress.
    Attaching,
    /// Attached.
    Attached,
    /// Detachment in progress.
    Detaching,
    /// Any phase this crate does not model.
    Other(String),
}

impl AttachmentState {
    /// Parses the provider's textual attachment state.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "detached" => Self::Detached,
            "attaching" => Self::Attaching,
            "attached" => Self::Attached,
            "detaching" => Self::Detaching,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Detached => "detached",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Other(other) => other.as_str(),
        };
        formatter.write_str(text)
    }
}

/// Point-in-time view of a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSnapshot {
    /// Provider identifier (for example `vol-0123`).
    pub id: String,
    /// Availability zone of the volume.
    pub zone: String,
    /// Reported status.
    pub status: VolumeStatus,
    /// Reported attachment phase.
    pub attachment: AttachmentState,
}

/// Availability zone catalogue entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZoneInfo {
    /// Zone name (for example `us-east-1a`).
    pub name: String,
    /// Reported state (for example `available`).
    pub state: String,
}

impl ZoneInfo {
    /// Returns `true` when the zone accepts new resources.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state == "available"
    }
}

/// Image catalogue entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    /// Resolved image identifier.
    pub id: String,
}

/// Remote keypair entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPairInfo {
    /// Keypair name.
    pub name: String,
}

/// Parameters for launching a single helper instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Image to boot.
    pub image_id: String,
    /// Instance type (for example `m1.small`).
    pub instance_type: String,
    /// Target availability zone.
    pub zone: String,
    /// Security group the instance joins.
    pub security_group: SecurityGroup,
    /// Keypair installed on the instance.
    pub key_name: String,
    /// Raw user data passed at boot.
    pub user_data: String,
}

/// Lets callers tell transient provider failures from permanent ones.
pub trait TransientError {
    /// Returns `true` when repeating the same call later may succeed, such as
    /// throttling or a dependency that is still being released.
    fn is_transient(&self) -> bool;
}

/// Remote compute and storage operations required by the workflow.
pub trait Provider {
    /// Provider specific error type.
    type Error: std::error::Error + TransientError + Send + Sync + 'static;

    /// Looks up a security group by name.
    fn find_security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<SecurityGroup>, Self::Error>;

    /// Creates a security group.
    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, SecurityGroup, Self::Error>;

    /// Permits inbound SSH on TCP `port` to members of `group`.
    fn authorize_ssh_ingress<'a>(
        &'a self,
        group: &'a SecurityGroup,
        port: u16,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Deletes a security group.
    fn delete_security_group<'a>(
        &'a self,
        group: &'a SecurityGroup,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Lists the instances that belong to `group`, in provider order.
    fn list_group_instances<'a>(
        &'a self,
        group: &'a SecurityGroup,
    ) -> ProviderFuture<'a, Vec<InstanceSnapshot>, Self::Error>;

    /// Launches exactly one instance.
    fn run_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ProviderFuture<'a, InstanceSnapshot, Self::Error>;

    /// Refreshes an instance snapshot; `None` when the provider no longer
    /// knows the instance.
    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceSnapshot>, Self::Error>;

    /// Requests termination of an instance.
    fn terminate_instance<'a>(&'a self, instance_id: &'a str)
    -> ProviderFuture<'a, (), Self::Error>;

    /// Creates a volume of `size_gb` gigabytes in `zone`.
    fn create_volume<'a>(
        &'a self,
        size_gb: u32,
        zone: &'a str,
    ) -> ProviderFuture<'a, VolumeSnapshot, Self::Error>;

    /// Refreshes a volume snapshot.
    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, Option<VolumeSnapshot>, Self::Error>;

    /// Requests attachment of a volume at `device`.
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Requests detachment of a volume from whatever holds it.
    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Resolves an image identifier.
    fn describe_image<'a>(
        &'a self,
        image_id: &'a str,
    ) -> ProviderFuture<'a, Option<ImageInfo>, Self::Error>;

    /// Resolves an availability zone.
    fn describe_zone<'a>(
        &'a self,
        zone: &'a str,
    ) -> ProviderFuture<'a, Option<ZoneInfo>, Self::Error>;

    /// Lists every keypair registered with the provider.
    fn list_key_pairs(&self) -> ProviderFuture<'_, Vec<KeyPairInfo>, Self::Error>;

    /// Resolves a keypair by name.
    fn describe_key_pair<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<KeyPairInfo>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("pending", InstanceState::Pending, true)]
    #[case("running", InstanceState::Running, true)]
    #[case("stopped", InstanceState::Stopped, false)]
    #[case("shutting-down", InstanceState::ShuttingDown, false)]
    fn instance_state_parses_names(
        #[case] raw: &str,
        #[case] expected: InstanceState,
        #[case] live: bool,
    ) {
        let state = InstanceState::parse(raw);
        assert_eq!(state, expected);
        assert_eq!(state.is_live(), live);
        assert_eq!(state.to_string(), raw);
    }

    #[test]
    fn unknown_states_are_preserved() {
        assert_eq!(
            VolumeStatus::parse("optimizing"),
            VolumeStatus::Other(String::from("optimizing"))
        );
        assert_eq!(AttachmentState::parse("busy").to_string(), "busy");
    }

    #[test]
    fn zone_availability_requires_available_state() {
        let zone = ZoneInfo {
            name: String::from("us-east-1a"),
            state: String::from("impaired"),
        };
        assert!(!zone.is_available());
    }
}
