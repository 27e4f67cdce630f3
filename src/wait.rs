//! Fixed-interval polling with an optional attempt bound and cancellation.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long and how often to poll a remote resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitPolicy {
    /// Sleep between consecutive checks.
    pub interval: Duration,
    /// Maximum number of checks; `None` polls until the condition holds or
    /// the wait is cancelled.
    pub max_attempts: Option<u32>,
}

impl WaitPolicy {
    /// Polls every `interval` without an attempt bound.
    #[must_use]
    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Polls every `interval`, giving up after `max_attempts` checks.
    #[must_use]
    pub const fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    const fn exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }
}

/// Reasons a wait ends without the condition holding.
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The attempt bound was reached.
    #[error("timed out waiting for {resource} after {attempts} attempts")]
    Timeout {
        /// Resource being waited on.
        resource: String,
        /// Checks performed.
        attempts: u32,
    },
    /// The cancellation token fired.
    #[error("wait for {resource} was cancelled")]
    Cancelled {
        /// Resource being waited on.
        resource: String,
    },
    /// The check itself failed.
    #[error(transparent)]
    Check(E),
}

/// Calls `check` until it yields `Some`, sleeping `policy.interval` between
/// calls.
///
/// # Errors
///
/// Returns [`WaitError::Timeout`] once `policy.max_attempts` checks have
/// yielded `None`, [`WaitError::Cancelled`] when `cancel` fires, and
/// [`WaitError::Check`] as soon as a check fails.
pub async fn poll_until<T, E, F, Fut>(
    policy: &WaitPolicy,
    cancel: &CancellationToken,
    resource: &str,
    mut check: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut attempts = 0_u32;
    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled {
                resource: resource.to_owned(),
            });
        }

        attempts = attempts.saturating_add(1);
        if let Some(ready) = check().await.map_err(WaitError::Check)? {
            debug!(resource, attempts, "resource ready");
            return Ok(ready);
        }

        if policy.exhausted(attempts) {
            return Err(WaitError::Timeout {
                resource: resource.to_owned(),
                attempts,
            });
        }

        tokio::select! {
            () = sleep(policy.interval) => {}
            () = cancel.cancelled() => {
                return Err(WaitError::Cancelled {
                    resource: resource.to_owned(),
                });
            }
        }
    }
}
