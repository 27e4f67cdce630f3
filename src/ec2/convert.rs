//! Conversions from EC2 response shapes to provider snapshots.

use std::collections::BTreeMap;

use aws_sdk_ec2::types as ec2;

use crate::provider::{
    AttachmentState, InstanceSnapshot, InstanceState, VolumeSnapshot, VolumeStatus, ZoneInfo,
};

/// Builds an instance snapshot; `None` when EC2 omitted the instance id.
pub(super) fn instance_snapshot(instance: &ec2::Instance) -> Option<InstanceSnapshot> {
    let id = instance.instance_id()?.to_owned();
    let zone = instance
        .placement()
        .and_then(ec2::Placement::availability_zone)
        .unwrap_or_default()
        .to_owned();
    let state = instance
        .state()
        .and_then(ec2::InstanceState::name)
        .map_or_else(
            || InstanceState::Other(String::from("unknown")),
            |name| InstanceState::parse(name.as_str()),
        );
    let block_devices = instance
        .block_device_mappings()
        .iter()
        .filter_map(|mapping| {
            let device = mapping.device_name()?;
            let volume = mapping
                .ebs()
                .and_then(ec2::EbsInstanceBlockDevice::volume_id)
                .unwrap_or_default();
            Some((device.to_owned(), volume.to_owned()))
        })
        .collect::<BTreeMap<_, _>>();

    Some(InstanceSnapshot {
        id,
        zone,
        state,
        block_devices,
        public_address: public_address(instance.public_dns_name(), instance.public_ip_address()),
    })
}

/// Prefers the public DNS name and falls back to the public IP. EC2 reports
/// an empty DNS name until one is assigned.
fn public_address(dns_name: Option<&str>, ip_address: Option<&str>) -> Option<String> {
    dns_name
        .filter(|name| !name.is_empty())
        .or_else(|| ip_address.filter(|ip| !ip.is_empty()))
        .map(str::to_owned)
}

/// Builds a volume snapshot; `None` when EC2 omitted the volume id.
pub(super) fn volume_snapshot(volume: &ec2::Volume) -> Option<VolumeSnapshot> {
    let id = volume.volume_id()?.to_owned();
    let status = volume
        .state()
        .map_or_else(|| VolumeStatus::Other(String::from("unknown")), |state| {
            VolumeStatus::parse(state.as_str())
        });
    let attachment = volume
        .attachments()
        .first()
        .and_then(ec2::VolumeAttachment::state)
        .map_or(AttachmentState::Detached, |state| {
            AttachmentState::parse(state.as_str())
        });

    Some(VolumeSnapshot {
        id,
        zone: volume.availability_zone().unwrap_or_default().to_owned(),
        status,
        attachment,
    })
}

/// Builds a zone entry; `None` when EC2 omitted the zone name.
pub(super) fn zone_info(zone: &ec2::AvailabilityZone) -> Option<ZoneInfo> {
    Some(ZoneInfo {
        name: zone.zone_name()?.to_owned(),
        state: zone
            .state()
            .map_or("unknown", ec2::AvailabilityZoneState::as_str)
            .to_owned(),
    })
}
