//! Structured logging setup for the CLI.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter.
pub const LOG_ENV_VAR: &str = "BLOCKPREP_LOG";

/// Noisy AWS SDK targets kept at `warn` unless the filter names them.
const QUIET_TARGETS: &[&str] = &["aws_config", "aws_smithy_runtime", "aws_sdk_ec2"];

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter expression could not be parsed.
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter {
        /// Filter expression as given.
        filter: String,
        /// Parser message.
        message: String,
    },
    /// A global subscriber is already installed.
    #[error("logging already initialised: {0}")]
    AlreadyInitialised(String),
}

/// Builds the filter expression from an explicit override and the verbosity
/// flag.
#[must_use]
pub fn filter_directives(override_filter: Option<&str>, verbose: bool) -> String {
    if let Some(explicit) = override_filter.filter(|value| !value.trim().is_empty()) {
        return explicit.to_owned();
    }
    let level = if verbose { "debug" } else { "info" };
    let mut directives = vec![level.to_owned()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

/// Installs a `fmt` subscriber writing to stderr. `BLOCKPREP_LOG` replaces
/// the default filter.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is malformed or a subscriber is
/// already installed.
pub fn init_logging(verbose: bool) -> Result<(), LoggingError> {
    let override_filter = std::env::var(LOG_ENV_VAR).ok();
    let filter = filter_directives(override_filter.as_deref(), verbose);
    let env_filter =
        EnvFilter::try_new(&filter).map_err(|err| LoggingError::InvalidFilter {
            filter: filter.clone(),
            message: err.to_string(),
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LoggingError::AlreadyInitialised(err.to_string()))
}
