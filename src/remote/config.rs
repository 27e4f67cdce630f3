//! SSH client configuration and remote execution errors.
//!
//! [`SshConfig`] is loaded via `ortho-config`, merging defaults,
//! `blockprep.toml`, and `BLOCKPREP_SSH_*` environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default SSH port used to reach helper instances.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH client settings used for every remote command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BLOCKPREP_SSH",
    discovery(
        app_name = "blockprep",
        env_var = "BLOCKPREP_CONFIG_PATH",
        config_file_name = "blockprep.toml",
        dotfile_name = ".blockprep.toml",
        project_file_name = "blockprep.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as. Partitioning needs root.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// TCP port of the SSH daemon on helper instances.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,
    /// Whether to force batch mode to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; helpers are disposable, so this
    /// defaults to off.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
}

/// Errors raised when loading [`SshConfig`] from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SshConfigLoadError {
    /// Parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when a required field is empty
    /// or the port is zero.
    pub fn validate(&self) -> Result<(), RemoteError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        if self.ssh_port == 0 {
            return Err(RemoteError::InvalidConfig {
                field: String::from("ssh_port"),
            });
        }
        Ok(())
    }

    fn require_value(value: &str, field: &str) -> Result<(), RemoteError> {
        if value.trim().is_empty() {
            return Err(RemoteError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }

    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("blockprep")])
            .map_err(|err| SshConfigLoadError::Parse(err.to_string()))
    }
}

/// Errors surfaced while executing remote commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// A required configuration value is missing.
    #[error("missing {field}: set BLOCKPREP_SSH_{env_suffix} or add {field} to blockprep.toml", env_suffix = .field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// The local process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}
