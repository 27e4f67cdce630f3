//! Tunables for a provisioning run.

use std::time::Duration;

use crate::device::DEFAULT_DEVICE;
use crate::wait::WaitPolicy;

/// Settings consumed by the lifecycle controller and its components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionSettings {
    /// Name of the dedicated helper security group.
    pub security_group_name: String,
    /// Description used when the group is created.
    pub security_group_description: String,
    /// Filesystem passed to `mkfs`.
    pub filesystem: String,
    /// Device used when a request does not name one.
    pub default_device: String,
    /// Wait applied to helper readiness.
    pub instance_wait: WaitPolicy,
    /// Wait applied to volume creation and attachment.
    pub volume_wait: WaitPolicy,
    /// Pause after a detach before instances are terminated.
    pub detach_grace: Duration,
    /// Whether reused helpers survive a failed run.
    pub preserve_reused_on_failure: bool,
    /// SSH port probed for reachability and opened on new helper groups.
    pub ssh_port: u16,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            security_group_name: String::from("blockprep-helpers"),
            security_group_description: String::from("blockprep volume preparation helpers"),
            filesystem: String::from("ext3"),
            default_device: DEFAULT_DEVICE.to_owned(),
            instance_wait: WaitPolicy::unbounded(Duration::from_secs(15)),
            volume_wait: WaitPolicy::unbounded(Duration::from_secs(5)),
            detach_grace: Duration::from_secs(5),
            preserve_reused_on_failure: false,
            ssh_port: 22,
        }
    }
}

impl ProvisionSettings {
    /// Sets the helper security group.
    #[must_use]
    pub fn with_security_group(mut self, name: String, description: String) -> Self {
        self.security_group_name = name;
        self.security_group_description = description;
        self
    }

    /// Sets the filesystem created on the first partition.
    #[must_use]
    pub fn with_filesystem(mut self, filesystem: String) -> Self {
        self.filesystem = filesystem;
        self
    }

    /// Sets the device requested when a run does not name one.
    #[must_use]
    pub fn with_default_device(mut self, device: String) -> Self {
        self.default_device = device;
        self
    }

    /// Sets the wait policy for helper readiness.
    #[must_use]
    pub const fn with_instance_wait(mut self, policy: WaitPolicy) -> Self {
        self.instance_wait = policy;
        self
    }

    /// Sets the wait policy for volume status changes.
    #[must_use]
    pub const fn with_volume_wait(mut self, policy: WaitPolicy) -> Self {
        self.volume_wait = policy;
        self
    }

    /// Sets the post-detach grace period.
    #[must_use]
    pub const fn with_detach_grace(mut self, grace: Duration) -> Self {
        self.detach_grace = grace;
        self
    }

    /// Keeps reused helpers alive when a run fails.
    #[must_use]
    pub const fn with_preserve_reused_on_failure(mut self, preserve: bool) -> Self {
        self.preserve_reused_on_failure = preserve;
        self
    }

    /// Sets the SSH port probed for reachability and opened on new helper
    /// groups.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Collapses every wait and grace period to zero. Used by tests.
    #[must_use]
    pub const fn without_delays(mut self) -> Self {
        self.instance_wait.interval = Duration::ZERO;
        self.volume_wait.interval = Duration::ZERO;
        self.detach_grace = Duration::ZERO;
        self
    }
}
