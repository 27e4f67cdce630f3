//! States of a provisioning run.

use std::fmt;

use serde::Serialize;

/// Where a provisioning run is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    /// Checking user parameters.
    Validating,
    /// Choosing the keypair.
    ResolvingCredentials,
    /// Reusing or launching the helper instance.
    LocatingInstance,
    /// Choosing the attachment device.
    AllocatingDevice,
    /// Creating the volume and waiting for it.
    CreatingVolume,
    /// Attaching the volume and waiting for it.
    Attaching,
    /// Writing the partition table.
    Partitioning,
    /// Creating the filesystem.
    Formatting,
    /// Removing the helper resources after success.
    TearingDown,
    /// Leaving the helper running after success.
    Idle,
    /// Undoing a failed run.
    Aborting,
    /// Finished.
    Done,
}

impl LifecycleState {
    /// Returns `true` when a failure in this state must be rolled back.
    #[must_use]
    pub const fn needs_rollback(self) -> bool {
        matches!(
            self,
            Self::LocatingInstance
                | Self::AllocatingDevice
                | Self::CreatingVolume
                | Self::Attaching
                | Self::Partitioning
                | Self::Formatting
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Validating => "validating",
            Self::ResolvingCredentials => "resolving credentials",
            Self::LocatingInstance => "locating instance",
            Self::AllocatingDevice => "allocating device",
            Self::CreatingVolume => "creating volume",
            Self::Attaching => "attaching",
            Self::Partitioning => "partitioning",
            Self::Formatting => "formatting",
            Self::TearingDown => "tearing down",
            Self::Idle => "idle",
            Self::Aborting => "aborting",
            Self::Done => "done",
        };
        formatter.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(LifecycleState::Validating, false)]
    #[case(LifecycleState::ResolvingCredentials, false)]
    #[case(LifecycleState::LocatingInstance, true)]
    #[case(LifecycleState::Formatting, true)]
    #[case(LifecycleState::TearingDown, false)]
    fn rollback_starts_with_instance_location(#[case] state: LifecycleState, #[case] expected: bool) {
        assert_eq!(state.needs_rollback(), expected);
    }
}
