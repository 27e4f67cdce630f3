//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeProvider`] keeps provider state in memory and records every call,
//! [`ScriptedRunner`] replays canned SSH results, [`ScriptedProbe`] answers
//! reachability checks, and [`MemoryConfigStore`] stands in for
//! `blockprep.toml`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::config_store::{ConfigStoreError, KeyStore, VolumeRecorder};
use crate::probe::{ProbeFuture, ReachabilityProbe};
use crate::provider::{
    AttachmentState, ImageInfo, InstanceSnapshot, InstanceState, KeyPairInfo, LaunchRequest,
    Provider, ProviderFuture, SecurityGroup, TransientError, VolumeSnapshot, VolumeStatus,
    ZoneInfo,
};
use crate::remote::{CommandOutput, CommandRunner, RemoteError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| RemoteError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Error returned by [`FakeProvider`] when a failure is injected.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("fake provider rejected {operation}")]
pub struct FakeProviderError {
    /// Operation that was configured to fail.
    pub operation: String,
    /// `true` when the failure was injected with
    /// [`FakeProvider::fail_transiently_on`].
    pub transient: bool,
}

impl TransientError for FakeProviderError {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

/// A call received by [`FakeProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `find_security_group(name)`.
    FindSecurityGroup(String),
    /// `create_security_group(name, ..)`.
    CreateSecurityGroup(String),
    /// `authorize_ssh_ingress(group, port)`.
    AuthorizeSshIngress {
        /// Group being opened.
        group_id: String,
        /// TCP port allowed in.
        port: u16,
    },
    /// `delete_security_group(group id)`.
    DeleteSecurityGroup(String),
    /// `list_group_instances(group id)`.
    ListGroupInstances(String),
    /// `run_instance(request)`.
    RunInstance(LaunchRequest),
    /// `describe_instance(id)`.
    DescribeInstance(String),
    /// `terminate_instance(id)`.
    TerminateInstance(String),
    /// `create_volume(size, zone)`.
    CreateVolume {
        /// Requested size in gigabytes.
        size_gb: u32,
        /// Requested zone.
        zone: String,
    },
    /// `describe_volume(id)`.
    DescribeVolume(String),
    /// `attach_volume(volume, instance, device)`.
    AttachVolume {
        /// Volume attached.
        volume_id: String,
        /// Target instance.
        instance_id: String,
        /// Device path.
        device: String,
    },
    /// `detach_volume(id)`.
    DetachVolume(String),
    /// `describe_image(id)`.
    DescribeImage(String),
    /// `describe_zone(name)`.
    DescribeZone(String),
    /// `list_key_pairs()`.
    ListKeyPairs,
    /// `describe_key_pair(name)`.
    DescribeKeyPair(String),
}

impl ProviderCall {
    /// Name of the provider operation, as accepted by
    /// [`FakeProvider::fail_on`].
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::FindSecurityGroup(_) => "find_security_group",
            Self::CreateSecurityGroup(_) => "create_security_group",
            Self::AuthorizeSshIngress { .. } => "authorize_ssh_ingress",
            Self::DeleteSecurityGroup(_) => "delete_security_group",
            Self::ListGroupInstances(_) => "list_group_instances",
            Self::RunInstance(_) => "run_instance",
            Self::DescribeInstance(_) => "describe_instance",
            Self::TerminateInstance(_) => "terminate_instance",
            Self::CreateVolume { .. } => "create_volume",
            Self::DescribeVolume(_) => "describe_volume",
            Self::AttachVolume { .. } => "attach_volume",
            Self::DetachVolume(_) => "detach_volume",
            Self::DescribeImage(_) => "describe_image",
            Self::DescribeZone(_) => "describe_zone",
            Self::ListKeyPairs => "list_key_pairs",
            Self::DescribeKeyPair(_) => "describe_key_pair",
        }
    }

    /// Identifier the call addresses, when it addresses a single resource.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::DeleteSecurityGroup(id)
            | Self::ListGroupInstances(id)
            | Self::DescribeInstance(id)
            | Self::TerminateInstance(id)
            | Self::DescribeVolume(id)
            | Self::DetachVolume(id) => Some(id.as_str()),
            Self::AuthorizeSshIngress { group_id, .. } => Some(group_id.as_str()),
            Self::AttachVolume { volume_id, .. } => Some(volume_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct FakeInstance {
    snapshot: InstanceSnapshot,
    group_id: String,
    pending_polls: u32,
}

#[derive(Clone, Debug)]
struct FakeVolume {
    snapshot: VolumeSnapshot,
    creating_polls: u32,
    attaching_polls: u32,
    instance_id: Option<String>,
    device: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    zones: Vec<ZoneInfo>,
    images: BTreeMap<String, String>,
    key_pairs: Vec<String>,
    groups: Vec<SecurityGroup>,
    instances: Vec<FakeInstance>,
    volumes: BTreeMap<String, FakeVolume>,
    failures: BTreeSet<String>,
    targeted_failures: BTreeSet<(String, String)>,
    transient_failures: BTreeMap<String, u32>,
    calls: Vec<ProviderCall>,
    next_id: u32,
    instance_pending_polls: u32,
    volume_creating_polls: u32,
    volume_attaching_polls: u32,
    volume_error: bool,
    boot_fails: bool,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-fake{}", self.next_id)
    }

    fn record(&mut self, call: ProviderCall) -> Result<(), FakeProviderError> {
        let operation = call.operation();
        let targeted = call.target().is_some_and(|target| {
            self.targeted_failures
                .contains(&(operation.to_owned(), target.to_owned()))
        });
        self.calls.push(call);
        if let Some(remaining) = self.transient_failures.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(FakeProviderError {
                operation: operation.to_owned(),
                transient: true,
            });
        }
        if targeted || self.failures.contains(operation) {
            return Err(FakeProviderError {
                operation: operation.to_owned(),
                transient: false,
            });
        }
        Ok(())
    }

    fn instance_mut(&mut self, instance_id: &str) -> Option<&mut FakeInstance> {
        self.instances
            .iter_mut()
            .find(|instance| instance.snapshot.id == instance_id)
    }
}

/// In-memory [`Provider`] that records every call in order.
///
/// Instances launch as `pending` and become `running` after a configurable
/// number of describe calls. Volumes stay `creating` and `attaching` for a
/// configurable number of polls. Any operation can be made to fail.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    /// Creates an empty provider with no zones, images, keypairs, groups or
    /// instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("fake provider lock poisoned: {err}"))
    }

    /// Adds a zone with the given state.
    #[must_use]
    pub fn with_zone(self, name: &str, state: &str) -> Self {
        self.lock().zones.push(ZoneInfo {
            name: name.to_owned(),
            state: state.to_owned(),
        });
        self
    }

    /// Adds an image that resolves to itself.
    #[must_use]
    pub fn with_image(self, image_id: &str) -> Self {
        self.with_image_alias(image_id, image_id)
    }

    /// Adds an image whose lookup resolves to a different id.
    #[must_use]
    pub fn with_image_alias(self, requested: &str, resolved: &str) -> Self {
        self.lock()
            .images
            .insert(requested.to_owned(), resolved.to_owned());
        self
    }

    /// Registers a keypair.
    #[must_use]
    pub fn with_key_pair(self, name: &str) -> Self {
        self.lock().key_pairs.push(name.to_owned());
        self
    }

    /// Adds an existing security group.
    #[must_use]
    pub fn with_security_group(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            let id = state.next_id("sg");
            state.groups.push(SecurityGroup {
                id,
                name: name.to_owned(),
                description: String::from("existing"),
            });
        }
        self
    }

    /// Adds an instance to the named group, creating the group if needed.
    #[must_use]
    pub fn with_group_instance(self, group: &str, instance_id: &str, zone: &str, state: &str) -> Self {
        let provider = if self.group_id(group).is_none() {
            self.with_security_group(group)
        } else {
            self
        };
        {
            let group_id = provider.group_id(group).unwrap_or_default();
            let mut fake = provider.lock();
            fake.instances.push(FakeInstance {
                snapshot: InstanceSnapshot {
                    id: instance_id.to_owned(),
                    zone: zone.to_owned(),
                    state: InstanceState::parse(state),
                    block_devices: BTreeMap::from([(
                        String::from("/dev/sda1"),
                        format!("vol-root-{instance_id}"),
                    )]),
                    public_address: Some(format!("{instance_id}.fake.internal")),
                },
                group_id,
                pending_polls: 0,
            });
        }
        provider
    }

    /// Marks `device` as occupied on an existing instance.
    #[must_use]
    pub fn with_occupied_device(self, instance_id: &str, device: &str) -> Self {
        if let Some(instance) = self.lock().instance_mut(instance_id) {
            instance
                .snapshot
                .block_devices
                .insert(device.to_owned(), String::from("vol-existing"));
        }
        self
    }

    /// Number of describe calls a launched instance stays `pending` for.
    #[must_use]
    pub fn with_instance_pending_polls(self, polls: u32) -> Self {
        self.lock().instance_pending_polls = polls;
        self
    }

    /// Number of describe calls a new volume stays `creating` for.
    #[must_use]
    pub fn with_volume_creating_polls(self, polls: u32) -> Self {
        self.lock().volume_creating_polls = polls;
        self
    }

    /// Number of describe calls an attachment stays `attaching` for.
    #[must_use]
    pub fn with_attaching_polls(self, polls: u32) -> Self {
        self.lock().volume_attaching_polls = polls;
        self
    }

    /// Makes new volumes finish creation in the `error` state.
    #[must_use]
    pub fn with_volume_error(self) -> Self {
        self.lock().volume_error = true;
        self
    }

    /// Makes launched instances go from `pending` to `terminated` instead of
    /// `running`.
    #[must_use]
    pub fn with_failing_boot(self) -> Self {
        self.lock().boot_fails = true;
        self
    }

    /// Makes every call to `operation` fail.
    pub fn fail_on(&self, operation: &str) {
        self.lock().failures.insert(operation.to_owned());
    }

    /// Makes calls to `operation` that address `target` fail, leaving calls
    /// for other resources untouched.
    pub fn fail_on_target(&self, operation: &str, target: &str) {
        self.lock()
            .targeted_failures
            .insert((operation.to_owned(), target.to_owned()));
    }

    /// Makes the next `times` calls to `operation` fail with a transient
    /// error.
    pub fn fail_transiently_on(&self, operation: &str, times: u32) {
        self.lock()
            .transient_failures
            .insert(operation.to_owned(), times);
    }

    /// Returns every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns the calls whose operation name equals `operation`.
    #[must_use]
    pub fn calls_to(&self, operation: &str) -> Vec<ProviderCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation() == operation)
            .cloned()
            .collect()
    }

    /// Returns the id of the named group, if it exists.
    #[must_use]
    pub fn group_id(&self, name: &str) -> Option<String> {
        self.lock()
            .groups
            .iter()
            .find(|group| group.name == name)
            .map(|group| group.id.clone())
    }

    /// Returns the state of an instance, if known.
    #[must_use]
    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.lock()
            .instances
            .iter()
            .find(|instance| instance.snapshot.id == instance_id)
            .map(|instance| instance.snapshot.state.clone())
    }

    /// Returns the ids of every volume created so far.
    #[must_use]
    pub fn volume_ids(&self) -> Vec<String> {
        self.lock().volumes.keys().cloned().collect()
    }

    fn respond<T: Send + 'static>(
        &self,
        call: ProviderCall,
        action: impl FnOnce(&mut FakeState) -> T,
    ) -> ProviderFuture<'static, T, FakeProviderError> {
        let mut state = self.lock();
        let result = state.record(call).map(|()| action(&mut state));
        Box::pin(ready(result))
    }
}

impl Provider for FakeProvider {
    type Error = FakeProviderError;

    fn find_security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<SecurityGroup>, Self::Error> {
        self.respond(ProviderCall::FindSecurityGroup(name.to_owned()), |state| {
            state.groups.iter().find(|group| group.name == name).cloned()
        })
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, SecurityGroup, Self::Error> {
        self.respond(ProviderCall::CreateSecurityGroup(name.to_owned()), |state| {
            let group = SecurityGroup {
                id: state.next_id("sg"),
                name: name.to_owned(),
                description: description.to_owned(),
            };
            state.groups.push(group.clone());
            group
        })
    }

    fn authorize_ssh_ingress<'a>(
        &'a self,
        group: &'a SecurityGroup,
        port: u16,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.respond(
            ProviderCall::AuthorizeSshIngress {
                group_id: group.id.clone(),
                port,
            },
            |_| (),
        )
    }

    fn delete_security_group<'a>(
        &'a self,
        group: &'a SecurityGroup,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.respond(ProviderCall::DeleteSecurityGroup(group.id.clone()), |state| {
            state.groups.retain(|existing| existing.id != group.id);
        })
    }

    fn list_group_instances<'a>(
        &'a self,
        group: &'a SecurityGroup,
    ) -> ProviderFuture<'a, Vec<InstanceSnapshot>, Self::Error> {
        self.respond(ProviderCall::ListGroupInstances(group.id.clone()), |state| {
            state
                .instances
                .iter()
                .filter(|instance| instance.group_id == group.id)
                .map(|instance| instance.snapshot.clone())
                .collect()
        })
    }

    fn run_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ProviderFuture<'a, InstanceSnapshot, Self::Error> {
        self.respond(ProviderCall::RunInstance(request.clone()), |state| {
            let id = state.next_id("i");
            let snapshot = InstanceSnapshot {
                id: id.clone(),
                zone: request.zone.clone(),
                state: InstanceState::Pending,
                block_devices: BTreeMap::from([(
                    String::from("/dev/sda1"),
                    format!("vol-root-{id}"),
                )]),
                public_address: None,
            };
            let pending_polls = state.instance_pending_polls;
            state.instances.push(FakeInstance {
                snapshot: snapshot.clone(),
                group_id: request.security_group.id.clone(),
                pending_polls,
            });
            snapshot
        })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceSnapshot>, Self::Error> {
        self.respond(
            ProviderCall::DescribeInstance(instance_id.to_owned()),
            |state| {
                let boot_fails = state.boot_fails;
                let instance = state.instance_mut(instance_id)?;
                match instance.snapshot.state {
                    InstanceState::Pending if instance.pending_polls > 0 => {
                        instance.pending_polls -= 1;
                    }
                    InstanceState::Pending if boot_fails => {
                        instance.snapshot.state = InstanceState::Terminated;
                    }
                    InstanceState::Pending => {
                        instance.snapshot.state = InstanceState::Running;
                        instance.snapshot.public_address =
                            Some(format!("{instance_id}.fake.internal"));
                    }
                    InstanceState::ShuttingDown => {
                        instance.snapshot.state = InstanceState::Terminated;
                    }
                    _ => {}
                }
                Some(instance.snapshot.clone())
            },
        )
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.respond(
            ProviderCall::TerminateInstance(instance_id.to_owned()),
            |state| {
                if let Some(instance) = state.instance_mut(instance_id)
                    && instance.snapshot.state != InstanceState::Terminated
                {
                    instance.snapshot.state = InstanceState::ShuttingDown;
                }
            },
        )
    }

    fn create_volume<'a>(
        &'a self,
        size_gb: u32,
        zone: &'a str,
    ) -> ProviderFuture<'a, VolumeSnapshot, Self::Error> {
        self.respond(
            ProviderCall::CreateVolume {
                size_gb,
                zone: zone.to_owned(),
            },
            |state| {
                let id = state.next_id("vol");
                let snapshot = VolumeSnapshot {
                    id: id.clone(),
                    zone: zone.to_owned(),
                    status: VolumeStatus::Creating,
                    attachment: AttachmentState::Detached,
                };
                let creating_polls = state.volume_creating_polls;
                state.volumes.insert(
                    id,
                    FakeVolume {
                        snapshot: snapshot.clone(),
                        creating_polls,
                        attaching_polls: 0,
                        instance_id: None,
                        device: None,
                    },
                );
                snapshot
            },
        )
    }

    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, Option<VolumeSnapshot>, Self::Error> {
        self.respond(ProviderCall::DescribeVolume(volume_id.to_owned()), |state| {
            let volume_error = state.volume_error;
            let volume = state.volumes.get_mut(volume_id)?;
            if volume.snapshot.status == VolumeStatus::Creating {
                if volume.creating_polls > 0 {
                    volume.creating_polls -= 1;
                } else if volume_error {
                    volume.snapshot.status = VolumeStatus::Error;
                } else {
                    volume.snapshot.status = VolumeStatus::Available;
                }
            }
            if volume.snapshot.attachment == AttachmentState::Attaching {
                if volume.attaching_polls > 0 {
                    volume.attaching_polls -= 1;
                } else {
                    volume.snapshot.attachment = AttachmentState::Attached;
                }
            }
            Some(volume.snapshot.clone())
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.respond(
            ProviderCall::AttachVolume {
                volume_id: volume_id.to_owned(),
                instance_id: instance_id.to_owned(),
                device: device.to_owned(),
            },
            |state| {
                let attaching_polls = state.volume_attaching_polls;
                if let Some(volume) = state.volumes.get_mut(volume_id) {
                    volume.snapshot.status = VolumeStatus::InUse;
                    volume.snapshot.attachment = AttachmentState::Attaching;
                    volume.attaching_polls = attaching_polls;
                    volume.instance_id = Some(instance_id.to_owned());
                    volume.device = Some(device.to_owned());
                }
                if let Some(instance) = state.instance_mut(instance_id) {
                    instance
                        .snapshot
                        .block_devices
                        .insert(device.to_owned(), volume_id.to_owned());
                }
            },
        )
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        self.respond(ProviderCall::DetachVolume(volume_id.to_owned()), |state| {
            let Some(volume) = state.volumes.get_mut(volume_id) else {
                return;
            };
            volume.snapshot.status = VolumeStatus::Available;
            volume.snapshot.attachment = AttachmentState::Detached;
            let instance_id = volume.instance_id.take();
            let device = volume.device.take();
            if let (Some(instance_id), Some(device)) = (instance_id, device)
                && let Some(instance) = state.instance_mut(&instance_id)
            {
                instance.snapshot.block_devices.remove(&device);
            }
        })
    }

    fn describe_image<'a>(
        &'a self,
        image_id: &'a str,
    ) -> ProviderFuture<'a, Option<ImageInfo>, Self::Error> {
        self.respond(ProviderCall::DescribeImage(image_id.to_owned()), |state| {
            state
                .images
                .get(image_id)
                .map(|resolved| ImageInfo {
                    id: resolved.clone(),
                })
        })
    }

    fn describe_zone<'a>(
        &'a self,
        zone: &'a str,
    ) -> ProviderFuture<'a, Option<ZoneInfo>, Self::Error> {
        self.respond(ProviderCall::DescribeZone(zone.to_owned()), |state| {
            state.zones.iter().find(|info| info.name == zone).cloned()
        })
    }

    fn list_key_pairs(&self) -> ProviderFuture<'_, Vec<KeyPairInfo>, Self::Error> {
        self.respond(ProviderCall::ListKeyPairs, |state| {
            state
                .key_pairs
                .iter()
                .map(|name| KeyPairInfo { name: name.clone() })
                .collect()
        })
    }

    fn describe_key_pair<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<KeyPairInfo>, Self::Error> {
        self.respond(ProviderCall::DescribeKeyPair(name.to_owned()), |state| {
            state
                .key_pairs
                .iter()
                .find(|known| known.as_str() == name)
                .map(|known| KeyPairInfo {
                    name: known.clone(),
                })
        })
    }
}

/// Reachability probe that answers from a script, then reports reachable.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    answers: Arc<Mutex<VecDeque<bool>>>,
    probes: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProbe {
    /// Creates a probe that always reports reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports unreachable for the next `count` probes.
    #[must_use]
    pub fn unreachable_for(self, count: usize) -> Self {
        self.answers
            .lock()
            .unwrap_or_else(|err| panic!("probe lock poisoned: {err}"))
            .extend(std::iter::repeat_n(false, count));
        self
    }

    /// Hosts probed so far, in order.
    #[must_use]
    pub fn probed_hosts(&self) -> Vec<String> {
        self.probes
            .lock()
            .unwrap_or_else(|err| panic!("probe lock poisoned: {err}"))
            .clone()
    }
}

impl ReachabilityProbe for ScriptedProbe {
    fn is_reachable<'a>(&'a self, host: &'a str, _port: u16) -> ProbeFuture<'a> {
        self.probes
            .lock()
            .unwrap_or_else(|err| panic!("probe lock poisoned: {err}"))
            .push(host.to_owned());
        let answer = self
            .answers
            .lock()
            .unwrap_or_else(|err| panic!("probe lock poisoned: {err}"))
            .pop_front()
            .unwrap_or(true);
        Box::pin(ready(answer))
    }
}

#[derive(Debug, Default)]
struct MemoryConfig {
    keys: Vec<(String, String)>,
    volumes: BTreeMap<String, String>,
    fail_writes: bool,
}

/// In-memory key and volume configuration.
#[derive(Clone, Debug, Default)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<MemoryConfig>>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryConfig> {
        self.inner
            .lock()
            .unwrap_or_else(|err| panic!("config store lock poisoned: {err}"))
    }

    /// Configures `name` with the private key at `location`.
    #[must_use]
    pub fn with_key(self, name: &str, location: &str) -> Self {
        self.lock()
            .keys
            .push((name.to_owned(), location.to_owned()));
        self
    }

    /// Makes every write fail.
    #[must_use]
    pub fn with_failing_writes(self) -> Self {
        self.lock().fail_writes = true;
        self
    }

    /// Recorded aliases and their volume ids.
    #[must_use]
    pub fn recorded(&self) -> BTreeMap<String, String> {
        self.lock().volumes.clone()
    }
}

impl KeyStore for MemoryConfigStore {
    fn key_names(&self) -> Result<Vec<String>, ConfigStoreError> {
        Ok(self.lock().keys.iter().map(|(name, _)| name.clone()).collect())
    }

    fn key_location(&self, name: &str) -> Result<Option<String>, ConfigStoreError> {
        Ok(self
            .lock()
            .keys
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, location)| location.clone()))
    }
}

impl VolumeRecorder for MemoryConfigStore {
    fn recorded_volume_id(&self, alias: &str) -> Result<Option<String>, ConfigStoreError> {
        Ok(self.lock().volumes.get(alias).cloned())
    }

    fn record_volume_id(
        &self,
        alias: &str,
        volume_id: &str,
        force: bool,
    ) -> Result<Utf8PathBuf, ConfigStoreError> {
        let path = Utf8PathBuf::from("blockprep.toml");
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(ConfigStoreError::Io {
                path,
                message: String::from("read-only store"),
            });
        }
        if let Some(existing) = inner.volumes.get(alias)
            && !force
        {
            return Err(ConfigStoreError::VolumeAlreadyRecorded {
                alias: alias.to_owned(),
                volume_id: existing.clone(),
            });
        }
        inner.volumes.insert(alias.to_owned(), volume_id.to_owned());
        Ok(path)
    }
}
