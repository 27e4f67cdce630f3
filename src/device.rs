//! Block device path syntax and allocation.

use std::collections::BTreeMap;

/// Device path requested when the caller does not pick one.
pub const DEFAULT_DEVICE: &str = "/dev/sdz";

const DEVICE_PREFIX: &str = "/dev/sd";

/// Returns `true` when `device` is a `/dev/sdX` path with a single lowercase
/// drive letter.
#[must_use]
pub fn is_valid_device(device: &str) -> bool {
    let Some(letter) = device.strip_prefix(DEVICE_PREFIX) else {
        return false;
    };
    let mut chars = letter.chars();
    matches!((chars.next(), chars.next()), (Some(ch), None) if ch.is_ascii_lowercase())
}

/// Returns the highest-lettered `/dev/sdX` path not present in
/// `block_devices`, scanning from `z` down to `a`.
#[must_use]
pub fn next_free_device<V>(block_devices: &BTreeMap<String, V>) -> Option<String> {
    ('a'..='z')
        .rev()
        .map(|letter| format!("{DEVICE_PREFIX}{letter}"))
        .find(|candidate| !block_devices.contains_key(candidate))
}

/// Picks the device to attach at: `requested` when it is free, otherwise the
/// highest free letter.
#[must_use]
pub fn allocate_device<V>(requested: &str, block_devices: &BTreeMap<String, V>) -> Option<String> {
    if block_devices.contains_key(requested) {
        return next_free_device(block_devices);
    }
    Some(requested.to_owned())
}

/// Path of the first partition on `device`.
#[must_use]
pub fn first_partition(device: &str) -> String {
    format!("{device}1")
}
