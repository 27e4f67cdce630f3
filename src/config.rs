//! Configuration loading via `ortho-config`.
//!
//! Every struct merges defaults, `blockprep.toml`, and environment variables
//! in that order of precedence. CLI flags are applied later by the binary.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::device::{DEFAULT_DEVICE, is_valid_device};
use crate::settings::ProvisionSettings;
use crate::wait::WaitPolicy;

/// AWS account defaults used when the CLI does not override them.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BLOCKPREP_AWS",
    discovery(
        app_name = "blockprep",
        env_var = "BLOCKPREP_CONFIG_PATH",
        config_file_name = "blockprep.toml",
        dotfile_name = ".blockprep.toml",
        project_file_name = "blockprep.toml"
    )
)]
pub struct AwsConfig {
    /// Region hosting the helper instances and volumes.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Availability zone used when `--zone` is omitted.
    #[ortho_config(default = "us-east-1a".to_owned())]
    pub default_zone: String,
    /// Image launched for new helper instances when `--image` is omitted.
    pub default_image_id: Option<String>,
    /// Instance type for new helper instances.
    #[ortho_config(default = "t3.micro".to_owned())]
    pub default_instance_type: String,
}

/// Behaviour of the helper instance and the waits around it.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BLOCKPREP_HELPER",
    discovery(
        app_name = "blockprep",
        env_var = "BLOCKPREP_CONFIG_PATH",
        config_file_name = "blockprep.toml",
        dotfile_name = ".blockprep.toml",
        project_file_name = "blockprep.toml"
    )
)]
pub struct HelperConfig {
    /// Security group that tags helper instances for reuse.
    #[ortho_config(default = "blockprep-helpers".to_owned())]
    pub security_group_name: String,
    /// Description applied when the group is created.
    #[ortho_config(default = "blockprep volume preparation helpers".to_owned())]
    pub security_group_description: String,
    /// Device path requested when `--device` is omitted.
    #[ortho_config(default = DEFAULT_DEVICE.to_owned())]
    pub default_device: String,
    /// Filesystem passed to `mkfs.<filesystem>`.
    #[ortho_config(default = "ext3".to_owned())]
    pub filesystem: String,
    /// Seconds between instance readiness polls.
    #[ortho_config(default = 15)]
    pub instance_poll_secs: u64,
    /// Seconds between volume status polls.
    #[ortho_config(default = 5)]
    pub volume_poll_secs: u64,
    /// Seconds to wait after detaching before terminating.
    #[ortho_config(default = 5)]
    pub detach_grace_secs: u64,
    /// Upper bound on polls per wait. Unset waits indefinitely.
    pub max_wait_attempts: Option<u32>,
    /// Keep reused helpers running when a run fails.
    #[ortho_config(default = false)]
    pub preserve_reused_on_failure: bool,
    /// Lifetime of an in-process helper lease.
    #[ortho_config(default = 3600)]
    pub lease_ttl_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to blockprep.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

impl AwsConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("blockprep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.region,
            &FieldMetadata::new("AWS region", "BLOCKPREP_AWS_REGION", "region"),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "BLOCKPREP_AWS_DEFAULT_ZONE",
                "default_zone",
            ),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "BLOCKPREP_AWS_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
            ),
        )?;
        Ok(())
    }

    /// Returns the image to launch, preferring `requested` over the
    /// configured default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when neither is set.
    pub fn image_id(&self, requested: Option<&str>) -> Result<String, ConfigError> {
        requested
            .or(self.default_image_id.as_deref())
            .filter(|image| !image.trim().is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                FieldMetadata::new(
                    "helper image",
                    "BLOCKPREP_AWS_DEFAULT_IMAGE_ID",
                    "default_image_id",
                )
                .missing()
            })
    }
}

impl HelperConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("blockprep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty names and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.security_group_name,
            &FieldMetadata::new(
                "helper security group",
                "BLOCKPREP_HELPER_SECURITY_GROUP_NAME",
                "security_group_name",
            ),
        )?;
        require_field(
            &self.filesystem,
            &FieldMetadata::new(
                "filesystem",
                "BLOCKPREP_HELPER_FILESYSTEM",
                "filesystem",
            ),
        )?;
        if !is_valid_device(&self.default_device) {
            return Err(ConfigError::Invalid(format!(
                "default_device {} is not a /dev/sdX path",
                self.default_device
            )));
        }
        if self.instance_poll_secs == 0 || self.volume_poll_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll intervals must be at least one second",
            )));
        }
        if self.max_wait_attempts == Some(0) {
            return Err(ConfigError::Invalid(String::from(
                "max_wait_attempts must be at least 1 when set",
            )));
        }
        Ok(())
    }

    /// Converts the validated configuration into controller settings.
    ///
    /// # Errors
    ///
    /// Returns any error from [`HelperConfig::validate`].
    pub fn to_settings(&self) -> Result<ProvisionSettings, ConfigError> {
        self.validate()?;
        let policy = |secs: u64| WaitPolicy {
            interval: Duration::from_secs(secs),
            max_attempts: self.max_wait_attempts,
        };
        Ok(ProvisionSettings::default()
            .with_security_group(
                self.security_group_name.clone(),
                self.security_group_description.clone(),
            )
            .with_filesystem(self.filesystem.clone())
            .with_default_device(self.default_device.clone())
            .with_instance_wait(policy(self.instance_poll_secs))
            .with_volume_wait(policy(self.volume_poll_secs))
            .with_detach_grace(Duration::from_secs(self.detach_grace_secs))
            .with_preserve_reused_on_failure(self.preserve_reused_on_failure))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
