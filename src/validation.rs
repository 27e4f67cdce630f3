//! Input checks performed before any resource is created.

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{error, warn};

use crate::config_store::{ConfigStoreError, VolumeRecorder};
use crate::device::{DEFAULT_DEVICE, is_valid_device};
use crate::provider::Provider;

/// Raw provisioning parameters as supplied by the user.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionParams {
    /// Requested size in gigabytes, unparsed.
    pub size: String,
    /// Target availability zone.
    pub zone: String,
    /// Requested device path; the configured default when `None`.
    pub device: Option<String>,
    /// Image booted on a newly launched helper.
    pub image_id: String,
    /// Instance type of a newly launched helper.
    pub instance_type: String,
    /// Keypair to use; discovered from configuration when `None`.
    pub keypair: Option<String>,
    /// Tear the helper resources down after a successful run.
    pub shutdown_after: bool,
    /// Alias under which the new volume id is recorded.
    pub record_as: Option<String>,
    /// Replace an alias that is already recorded.
    pub force: bool,
}

/// Parameters that passed validation. Only produced by [`ValidationGate`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionRequest {
    /// Volume size in gigabytes, at least one.
    pub size_gb: u32,
    /// Availability zone known to the provider.
    pub zone: String,
    /// Device path in `/dev/sdX` form.
    pub device: String,
    /// Image the provider resolved to exactly this id.
    pub image_id: String,
    /// Instance type for a launched helper.
    pub instance_type: String,
    /// Explicit keypair name, if any.
    pub keypair: Option<String>,
    /// Tear down helper resources on success.
    pub shutdown_after: bool,
    /// Alias to record the volume under.
    pub record_as: Option<String>,
    /// Replace an existing alias.
    pub force: bool,
}

/// Reasons a run is refused before any resource is touched.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// The size is not an integer of at least one.
    #[error("volume size must be a whole number of gigabytes of at least 1, got {value:?}")]
    InvalidSize {
        /// Rejected input.
        value: String,
    },
    /// The zone is not in the provider's catalogue.
    #[error("availability zone {zone} does not exist")]
    UnknownZone {
        /// Rejected zone.
        zone: String,
    },
    /// The device path is not `/dev/sdX`.
    #[error("device {device} is not a valid /dev/sdX path")]
    InvalidDevice {
        /// Rejected device.
        device: String,
    },
    /// The provider does not know the image.
    #[error("image {image_id} does not exist")]
    UnknownImage {
        /// Requested image.
        image_id: String,
    },
    /// The provider resolved the image to a different id.
    #[error("image {requested} resolved to {resolved}")]
    ImageMismatch {
        /// Requested image.
        requested: String,
        /// Identifier returned by the provider.
        resolved: String,
    },
    /// A provider call made during validation failed.
    #[error("failed to look up {what}: {message}")]
    Lookup {
        /// What was being looked up.
        what: String,
        /// Provider error text.
        message: String,
    },
    /// The named keypair is not registered with the provider.
    #[error("keypair {name} does not exist")]
    KeyPairNotFound {
        /// Requested keypair.
        name: String,
    },
    /// The keypair has no `key_location` in configuration.
    #[error("keypair {name} has no key_location: add [keys.{name}] to blockprep.toml")]
    KeyNotConfigured {
        /// Keypair without local key material.
        name: String,
    },
    /// None of the provider's keypairs are configured locally.
    #[error("no keypair registered with the provider is configured in blockprep.toml")]
    NoUsableKeyPair,
    /// The configured key path does not exist.
    #[error("key file {path} for keypair {name} does not exist")]
    KeyFileMissing {
        /// Keypair name.
        name: String,
        /// Configured path after `~` expansion.
        path: Utf8PathBuf,
    },
    /// The configured key path is not a regular file.
    #[error("key file {path} for keypair {name} is not a file")]
    KeyFileNotFile {
        /// Keypair name.
        name: String,
        /// Configured path after `~` expansion.
        path: Utf8PathBuf,
    },
    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),
    /// The alias already records a volume and `force` is not set.
    #[error("volume alias {alias} already records {volume_id}; rerun with --force to replace it")]
    AliasAlreadyRecorded {
        /// Alias requested.
        alias: String,
        /// Volume recorded under it.
        volume_id: String,
    },
}

impl From<ConfigStoreError> for ValidationError {
    fn from(value: ConfigStoreError) -> Self {
        Self::Config(value.to_string())
    }
}

/// Parses a volume size, rejecting anything that is not an integer of at
/// least one.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSize`] for non-integers and values
/// below one.
pub fn parse_size(value: &str) -> Result<u32, ValidationError> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|size| *size >= 1)
        .ok_or_else(|| ValidationError::InvalidSize {
            value: value.to_owned(),
        })
}

/// Checks user parameters against local rules and the provider catalogue.
#[derive(Debug)]
pub struct ValidationGate<'a, P: Provider> {
    provider: &'a P,
    default_device: String,
}

impl<'a, P: Provider> ValidationGate<'a, P> {
    /// Creates a gate that consults `provider` for zones and images.
    pub fn new(provider: &'a P) -> Self {
        Self {
            provider,
            default_device: DEFAULT_DEVICE.to_owned(),
        }
    }

    /// Overrides the device used when parameters omit one.
    #[must_use]
    pub fn with_default_device(mut self, device: impl Into<String>) -> Self {
        self.default_device = device.into();
        self
    }

    /// Validates `params`, stopping at the first failed rule. Size, zone,
    /// device and image are checked in that order.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] for the first failed rule.
    pub async fn validate(
        &self,
        params: &ProvisionParams,
    ) -> Result<ProvisionRequest, ValidationError> {
        let size_gb = parse_size(&params.size)?;
        self.check_zone(&params.zone).await?;

        let device = params
            .device
            .clone()
            .unwrap_or_else(|| self.default_device.clone());
        if !is_valid_device(&device) {
            return Err(ValidationError::InvalidDevice { device });
        }

        self.check_image(&params.image_id).await?;

        Ok(ProvisionRequest {
            size_gb,
            zone: params.zone.clone(),
            device,
            image_id: params.image_id.clone(),
            instance_type: params.instance_type.clone(),
            keypair: params.keypair.clone(),
            shutdown_after: params.shutdown_after,
            record_as: params.record_as.clone(),
            force: params.force,
        })
    }

    /// Runs [`ValidationGate::validate`], logging any failure.
    pub async fn is_valid(&self, params: &ProvisionParams) -> bool {
        match self.validate(params).await {
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, "invalid provisioning parameters");
                false
            }
        }
    }

    async fn check_zone(&self, zone: &str) -> Result<(), ValidationError> {
        let info = self
            .provider
            .describe_zone(zone)
            .await
            .map_err(|err| ValidationError::Lookup {
                what: format!("zone {zone}"),
                message: err.to_string(),
            })?
            .ok_or_else(|| ValidationError::UnknownZone {
                zone: zone.to_owned(),
            })?;
        if !info.is_available() {
            warn!(zone, state = %info.state, "availability zone is not available");
        }
        Ok(())
    }

    async fn check_image(&self, image_id: &str) -> Result<(), ValidationError> {
        let image = self
            .provider
            .describe_image(image_id)
            .await
            .map_err(|err| ValidationError::Lookup {
                what: format!("image {image_id}"),
                message: err.to_string(),
            })?
            .ok_or_else(|| ValidationError::UnknownImage {
                image_id: image_id.to_owned(),
            })?;
        if image.id != image_id {
            return Err(ValidationError::ImageMismatch {
                requested: image_id.to_owned(),
                resolved: image.id,
            });
        }
        Ok(())
    }
}

/// Refuses to proceed when `request` would overwrite a recorded alias.
///
/// # Errors
///
/// Returns [`ValidationError::AliasAlreadyRecorded`] when the alias is taken
/// and `force` is not set.
pub fn ensure_alias_available<R>(
    recorder: &R,
    request: &ProvisionRequest,
) -> Result<(), ValidationError>
where
    R: VolumeRecorder + ?Sized,
{
    let Some(alias) = request.record_as.as_deref() else {
        return Ok(());
    };
    if request.force {
        return Ok(());
    }
    match recorder.recorded_volume_id(alias)? {
        Some(volume_id) => Err(ValidationError::AliasAlreadyRecorded {
            alias: alias.to_owned(),
            volume_id,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeProvider, MemoryConfigStore, ProviderCall};
    use rstest::{fixture, rstest};

    #[fixture]
    fn params() -> ProvisionParams {
        ProvisionParams {
            size: String::from("10"),
            zone: String::from("us-east-1a"),
            device: Some(String::from("/dev/sdz")),
            image_id: String::from("ami-1234"),
            instance_type: String::from("m1.small"),
            ..ProvisionParams::default()
        }
    }

    #[fixture]
    fn provider() -> FakeProvider {
        FakeProvider::new()
            .with_zone("us-east-1a", "available")
            .with_zone("us-east-1b", "impaired")
            .with_image("ami-1234")
    }

    #[rstest]
    #[case("1", 1)]
    #[case("10", 10)]
    #[case(" 25 ", 25)]
    fn sizes_parse(#[case] raw: &str, #[case] expected: u32) {
        assert_eq!(parse_size(raw), Ok(expected));
    }

    #[rstest]
    #[case("abc")]
    #[case("1.5")]
    #[case("0")]
    #[case("-3")]
    #[case("")]
    fn bad_sizes_are_rejected(#[case] raw: &str) {
        assert!(matches!(
            parse_size(raw),
            Err(ValidationError::InvalidSize { .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn bad_size_fails_before_any_remote_call(params: ProvisionParams, provider: FakeProvider) {
        let params = ProvisionParams {
            size: String::from("0"),
            ..params
        };
        let result = ValidationGate::new(&provider).validate(&params).await;

        assert!(matches!(result, Err(ValidationError::InvalidSize { .. })));
        assert!(provider.calls().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn valid_params_produce_a_request(params: ProvisionParams, provider: FakeProvider) {
        let request = ValidationGate::new(&provider)
            .validate(&params)
            .await
            .unwrap_or_else(|err| panic!("validate: {err}"));

        assert_eq!(request.size_gb, 10);
        assert_eq!(request.device, "/dev/sdz");
        assert_eq!(request.image_id, "ami-1234");
    }

    #[rstest]
    #[tokio::test]
    async fn missing_device_uses_the_default(params: ProvisionParams, provider: FakeProvider) {
        let params = ProvisionParams {
            device: None,
            ..params
        };
        let request = ValidationGate::new(&provider)
            .with_default_device("/dev/sdf")
            .validate(&params)
            .await
            .unwrap_or_else(|err| panic!("validate: {err}"));

        assert_eq!(request.device, "/dev/sdf");
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_zone_is_rejected(params: ProvisionParams, provider: FakeProvider) {
        let params = ProvisionParams {
            zone: String::from("mars-1a"),
            ..params
        };
        let result = ValidationGate::new(&provider).validate(&params).await;
        assert_eq!(
            result,
            Err(ValidationError::UnknownZone {
                zone: String::from("mars-1a")
            })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unavailable_zone_only_warns(params: ProvisionParams, provider: FakeProvider) {
        let params = ProvisionParams {
            zone: String::from("us-east-1b"),
            ..params
        };
        assert!(ValidationGate::new(&provider).is_valid(&params).await);
    }

    #[rstest]
    #[case("/dev/sdZ")]
    #[case("/dev/xvdf")]
    #[case("/dev/sdaa")]
    #[tokio::test]
    async fn bad_devices_are_rejected(
        params: ProvisionParams,
        provider: FakeProvider,
        #[case] device: &str,
    ) {
        let params = ProvisionParams {
            device: Some(device.to_owned()),
            ..params
        };
        let result = ValidationGate::new(&provider).validate(&params).await;
        assert!(matches!(result, Err(ValidationError::InvalidDevice { .. })));
        assert!(
            !provider
                .calls()
                .iter()
                .any(|call| matches!(call, ProviderCall::DescribeImage(_))),
            "image lookup should not run after a device failure"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_image_is_rejected(params: ProvisionParams, provider: FakeProvider) {
        let params = ProvisionParams {
            image_id: String::from("ami-missing"),
            ..params
        };
        let gate = ValidationGate::new(&provider);
        assert!(matches!(
            gate.validate(&params).await,
            Err(ValidationError::UnknownImage { .. })
        ));
        assert!(!gate.is_valid(&params).await);
    }

    #[rstest]
    #[tokio::test]
    async fn image_must_resolve_to_the_requested_id(params: ProvisionParams, provider: FakeProvider) {
        let provider = provider.with_image_alias("ami-latest", "ami-5678");
        let params = ProvisionParams {
            image_id: String::from("ami-latest"),
            ..params
        };
        let result = ValidationGate::new(&provider).validate(&params).await;
        assert_eq!(
            result,
            Err(ValidationError::ImageMismatch {
                requested: String::from("ami-latest"),
                resolved: String::from("ami-5678"),
            })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn valid_params_pass_the_boolean_check(params: ProvisionParams, provider: FakeProvider) {
        assert!(ValidationGate::new(&provider).is_valid(&params).await);
    }

    #[rstest]
    #[tokio::test]
    async fn lookup_failures_are_reported(params: ProvisionParams, provider: FakeProvider) {
        provider.fail_on("describe_zone");
        let result = ValidationGate::new(&provider).validate(&params).await;
        assert!(matches!(result, Err(ValidationError::Lookup { .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn recorded_alias_requires_force(params: ProvisionParams, provider: FakeProvider) {
        let store = MemoryConfigStore::new();
        store
            .record_volume_id("data", "vol-old", false)
            .unwrap_or_else(|err| panic!("seed: {err}"));
        let params = ProvisionParams {
            record_as: Some(String::from("data")),
            ..params
        };
        let request = ValidationGate::new(&provider)
            .validate(&params)
            .await
            .unwrap_or_else(|err| panic!("validate: {err}"));

        assert!(matches!(
            ensure_alias_available(&store, &request),
            Err(ValidationError::AliasAlreadyRecorded { .. })
        ));
        let forced = ProvisionRequest {
            force: true,
            ..request
        };
        assert!(ensure_alias_available(&store, &forced).is_ok());
    }
}
