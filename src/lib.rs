//! Core library for `blockprep`, which creates block-storage volumes and
//! prepares them for use.
//!
//! A run validates its parameters, picks a keypair, reuses or launches a
//! helper instance, creates and attaches a volume, then partitions and
//! formats it over SSH. Failures are rolled back; on success the helper is
//! either kept for the next run or torn down with its security group.
//!
//! [`LifecycleController`] drives the workflow against any [`Provider`];
//! [`Ec2Provider`] is the Amazon EC2 implementation.

pub mod config;
pub mod config_store;
pub mod credentials;
pub mod device;
pub mod disk;
pub mod ec2;
pub mod lease;
pub mod lifecycle;
pub mod locator;
pub mod logging;
pub mod probe;
pub mod progress;
pub mod provider;
pub mod remote;
pub mod settings;
pub mod test_support;
pub mod validation;
pub mod volumes;
pub mod wait;

pub use config::{AwsConfig, ConfigError, HelperConfig};
pub use config_store::{ConfigStore, ConfigStoreError, KeyStore, VolumeRecorder};
pub use credentials::{CredentialResolver, KeyMaterial};
pub use device::{DEFAULT_DEVICE, allocate_device, is_valid_device, next_free_device};
pub use disk::{DiskError, RemoteDiskInitializer};
pub use ec2::{Ec2Provider, Ec2ProviderError};
pub use lease::{Lease, LeaseError, LeaseOrigin, LeaseTable};
pub use lifecycle::{
    CleanupError, LifecycleController, LifecycleState, ProvisionError, ProvisionFailure,
    ProvisionOutcome,
};
pub use locator::{HelperInstance, ReleaseReport, ResourceLocator};
pub use logging::{LoggingError, init_logging};
pub use probe::{ReachabilityProbe, TcpProbe};
pub use progress::{SilentIndicator, SpinnerIndicator, WaitIndicator};
pub use provider::{Provider, TransientError};
pub use remote::{
    CommandRunner, ProcessCommandRunner, RemoteError, RemoteShell, RemoteTarget, SshConfig,
};
pub use settings::ProvisionSettings;
pub use validation::{ProvisionParams, ProvisionRequest, ValidationError, ValidationGate};
pub use volumes::VolumeProvisioner;
pub use wait::{WaitError, WaitPolicy, poll_until};
