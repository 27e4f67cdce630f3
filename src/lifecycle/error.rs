//! Error types for the provisioning workflow.

use serde::Serialize;
use thiserror::Error;

use crate::disk::DiskError;
use crate::lease::LeaseError;
use crate::lifecycle::LifecycleState;
use crate::validation::ValidationError;
use crate::wait::WaitError;

/// Errors raised while provisioning a volume.
#[derive(Debug, Error)]
pub enum ProvisionError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Input or credentials were rejected. Never triggers rollback.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A provider call failed.
    #[error("{operation} failed: {source}")]
    Remote {
        /// Provider operation that failed.
        operation: String,
        /// Provider-specific error.
        #[source]
        source: ProviderError,
    },
    /// Partitioning or formatting failed on the helper.
    #[error(transparent)]
    Disk(#[from] DiskError),
    /// A wait exceeded its attempt bound.
    #[error("timed out waiting for {resource} after {attempts} attempts")]
    Timeout {
        /// Resource being waited on.
        resource: String,
        /// Checks performed.
        attempts: u32,
    },
    /// The run was cancelled.
    #[error("wait for {resource} was cancelled")]
    Cancelled {
        /// Resource being waited on when cancellation fired.
        resource: String,
    },
    /// The lease table refused the operation.
    #[error(transparent)]
    Lease(#[from] LeaseError),
    /// Every `/dev/sdX` letter is occupied on the helper.
    #[error("no free /dev/sdX device on instance {instance_id}")]
    NoFreeDevice {
        /// Helper instance.
        instance_id: String,
    },
    /// A resource reached a state it cannot recover from.
    #[error("{resource} is {state}")]
    ResourceState {
        /// Resource description.
        resource: String,
        /// Reported state.
        state: String,
    },
}

impl<ProviderError> ProvisionError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Wraps a provider error with the name of the failed operation.
    pub fn remote(operation: impl Into<String>) -> impl FnOnce(ProviderError) -> Self {
        let operation = operation.into();
        move |source| Self::Remote { operation, source }
    }
}

impl<ProviderError> From<WaitError<Self>> for ProvisionError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    fn from(value: WaitError<Self>) -> Self {
        match value {
            WaitError::Timeout { resource, attempts } => Self::Timeout { resource, attempts },
            WaitError::Cancelled { resource } => Self::Cancelled { resource },
            WaitError::Check(inner) => inner,
        }
    }
}

/// A rollback or teardown action that failed.
#[derive(Clone, Debug, Error, Eq, PartialEq, Serialize)]
#[error("{action} failed: {message}")]
pub struct CleanupError {
    /// What was being cleaned up (for example `terminate instance i-1`).
    pub action: String,
    /// Error text.
    pub message: String,
}

impl CleanupError {
    /// Builds a cleanup error from any displayable failure.
    pub fn new(action: impl Into<String>, err: &impl std::fmt::Display) -> Self {
        Self {
            action: action.into(),
            message: err.to_string(),
        }
    }
}

/// A failed run: where it failed, why, and what cleanup could not be done.
#[derive(Debug, Error)]
#[error("provisioning failed while {stage}: {cause}{}", cleanup_suffix(.cleanup_errors))]
pub struct ProvisionFailure<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// State the run was in when the failure occurred.
    pub stage: LifecycleState,
    /// Primary failure.
    #[source]
    pub cause: ProvisionError<ProviderError>,
    /// Rollback actions that failed, in the order they were attempted.
    pub cleanup_errors: Vec<CleanupError>,
}

fn cleanup_suffix(errors: &[CleanupError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(" (cleanup: {joined})")
}
