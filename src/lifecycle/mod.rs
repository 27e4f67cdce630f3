//! Provisioning workflow: validate, resolve credentials, acquire a helper,
//! create and attach the volume, partition and format it, then tear down or
//! leave the helper running.
//!
//! Failures after a helper is located are rolled back: an attached volume is
//! detached and the helper is terminated (or, for reused helpers with
//! `preserve_reused_on_failure`, released). Every cleanup step is attempted
//! and its errors collected.

use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config_store::{KeyStore, VolumeRecorder};
use crate::credentials::{CredentialResolver, KeyMaterial};
use crate::device::allocate_device;
use crate::disk::RemoteDiskInitializer;
use crate::lease::LeaseTable;
use crate::locator::{HelperInstance, ReleaseReport, ResourceLocator};
use crate::probe::ReachabilityProbe;
use crate::progress::{SilentIndicator, WaitIndicator};
use crate::provider::Provider;
use crate::remote::{CommandRunner, RemoteShell, RemoteTarget};
use crate::settings::ProvisionSettings;
use crate::validation::{
    ProvisionParams, ProvisionRequest, ValidationError, ValidationGate, ensure_alias_available,
};
use crate::volumes::VolumeProvisioner;

mod error;
mod state;

pub use error::{CleanupError, ProvisionError, ProvisionFailure};
pub use state::LifecycleState;

/// Result of a successful run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProvisionOutcome {
    /// Identifier of the new volume.
    pub volume_id: String,
    /// Helper instance the volume was prepared on.
    pub instance_id: String,
    /// Device the volume was attached at.
    pub device: String,
    /// `true` when the helper was left running for reuse.
    pub helper_retained: bool,
    /// Configuration file the volume id was recorded in, if any.
    pub recorded_in: Option<String>,
    /// Teardown or recording steps that failed after the volume was ready.
    pub warnings: Vec<CleanupError>,
}

#[derive(Debug)]
struct RunState {
    state: LifecycleState,
    helper: Option<HelperInstance>,
    volume_id: Option<String>,
    attach_requested: bool,
}

impl RunState {
    const fn new() -> Self {
        Self {
            state: LifecycleState::Validating,
            helper: None,
            volume_id: None,
            attach_requested: false,
        }
    }

    fn enter(&mut self, next: LifecycleState) {
        info!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
    }
}

#[derive(Debug)]
struct Prepared {
    volume_id: String,
    instance_id: String,
    device: String,
}

/// Drives a provisioning run from validation to teardown.
pub struct LifecycleController<P, R, K, Q>
where
    P: Provider,
    R: CommandRunner,
    K: KeyStore + VolumeRecorder,
    Q: ReachabilityProbe,
{
    provider: P,
    shell: RemoteShell<R>,
    store: K,
    probe: Q,
    settings: ProvisionSettings,
    leases: LeaseTable,
    indicator: Box<dyn WaitIndicator>,
    cancel: CancellationToken,
}

impl<P, R, K, Q> LifecycleController<P, R, K, Q>
where
    P: Provider,
    R: CommandRunner,
    K: KeyStore + VolumeRecorder,
    Q: ReachabilityProbe,
{
    /// Creates a controller with a private lease table, no progress output
    /// and a fresh cancellation token.
    pub fn new(
        provider: P,
        shell: RemoteShell<R>,
        store: K,
        probe: Q,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            provider,
            shell,
            store,
            probe,
            settings,
            leases: LeaseTable::default(),
            indicator: Box::new(SilentIndicator),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the progress indicator shown during helper waits.
    #[must_use]
    pub fn with_indicator(mut self, indicator: Box<dyn WaitIndicator>) -> Self {
        self.indicator = indicator;
        self
    }

    /// Shares a lease table with other controllers in the process.
    #[must_use]
    pub fn with_leases(mut self, leases: LeaseTable) -> Self {
        self.leases = leases;
        self
    }

    /// Uses `cancel` to interrupt waits.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the full workflow.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionFailure`] naming the state that failed, the cause,
    /// and any rollback steps that could not be completed. Validation and
    /// credential failures are never rolled back.
    pub async fn run(
        &self,
        params: &ProvisionParams,
    ) -> Result<ProvisionOutcome, ProvisionFailure<P::Error>> {
        let started = Instant::now();
        let result = self.run_stages(params).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(outcome) => info!(
                volume_id = %outcome.volume_id,
                elapsed_secs = elapsed.as_secs_f64(),
                "creating volume took {elapsed:.1?}"
            ),
            Err(failure) => info!(
                stage = %failure.stage,
                elapsed_secs = elapsed.as_secs_f64(),
                "creating volume failed after {elapsed:.1?}"
            ),
        }
        result
    }

    async fn run_stages(
        &self,
        params: &ProvisionParams,
    ) -> Result<ProvisionOutcome, ProvisionFailure<P::Error>> {
        let mut run = RunState::new();
        info!(state = %run.state, "starting provisioning run");

        let request = self.validate(params).await.map_err(|err| ProvisionFailure {
            stage: LifecycleState::Validating,
            cause: err.into(),
            cleanup_errors: Vec::new(),
        })?;

        run.enter(LifecycleState::ResolvingCredentials);
        let key = CredentialResolver::new(&self.provider, &self.store)
            .resolve(request.keypair.as_deref())
            .await
            .map_err(|err| ProvisionFailure {
                stage: LifecycleState::ResolvingCredentials,
                cause: err.into(),
                cleanup_errors: Vec::new(),
            })?;

        match self.prepare(&request, &key, &mut run).await {
            Ok(prepared) => Ok(self.finish(&request, prepared, &mut run).await),
            Err(cause) => {
                let stage = run.state;
                let cleanup_errors = if stage.needs_rollback() {
                    error!(%stage, error = %cause, "provisioning failed; rolling back");
                    run.enter(LifecycleState::Aborting);
                    self.rollback(&mut run).await
                } else {
                    error!(%stage, error = %cause, "provisioning failed");
                    Vec::new()
                };
                Err(ProvisionFailure {
                    stage,
                    cause,
                    cleanup_errors,
                })
            }
        }
    }

    /// Runs the workflow and returns the new volume id, logging any failure
    /// instead of returning it.
    pub async fn create(&self, params: &ProvisionParams) -> Option<String> {
        match self.run(params).await {
            Ok(outcome) => Some(outcome.volume_id),
            Err(failure) => {
                error!(
                    stage = %failure.stage,
                    cleanup_failures = failure.cleanup_errors.len(),
                    "{failure}"
                );
                None
            }
        }
    }

    /// Returns `true` when `params` pass validation, logging the reason
    /// otherwise.
    pub async fn is_valid(&self, params: &ProvisionParams) -> bool {
        match self.validate(params).await {
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, "invalid provisioning parameters");
                false
            }
        }
    }

    /// Terminates every helper instance and deletes the helper group.
    ///
    /// Every step is attempted; steps that fail are listed in the report.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the helper group or its members
    /// cannot be listed.
    pub async fn stop_helpers(&self) -> Result<ReleaseReport, ProvisionError<P::Error>> {
        self.locator().release_all().await
    }

    fn locator(&self) -> ResourceLocator<'_, P, Q> {
        ResourceLocator::new(
            &self.provider,
            &self.probe,
            &self.leases,
            self.indicator.as_ref(),
            &self.settings,
            &self.cancel,
        )
    }

    fn volumes(&self) -> VolumeProvisioner<'_, P> {
        VolumeProvisioner::new(&self.provider, self.settings.volume_wait, &self.cancel)
    }

    async fn validate(
        &self,
        params: &ProvisionParams,
    ) -> Result<ProvisionRequest, ValidationError> {
        let request = ValidationGate::new(&self.provider)
            .with_default_device(self.settings.default_device.clone())
            .validate(params)
            .await?;
        ensure_alias_available(&self.store, &request)?;
        Ok(request)
    }

    async fn prepare(
        &self,
        request: &ProvisionRequest,
        key: &KeyMaterial,
        run: &mut RunState,
    ) -> Result<Prepared, ProvisionError<P::Error>> {
        run.enter(LifecycleState::LocatingInstance);
        let helper = self
            .locator()
            .acquire_instance(
                &request.zone,
                &request.image_id,
                &request.instance_type,
                key,
                |located| run.helper = Some(located.clone()),
            )
            .await?;
        let snapshot = run.helper.insert(helper).snapshot.clone();
        let instance_id = snapshot.id;
        let host = snapshot
            .public_address
            .ok_or_else(|| ProvisionError::ResourceState {
                resource: format!("instance {instance_id}"),
                state: String::from("without a public address"),
            })?;

        run.enter(LifecycleState::AllocatingDevice);
        let device = allocate_device(&request.device, &snapshot.block_devices).ok_or_else(|| {
            ProvisionError::NoFreeDevice {
                instance_id: instance_id.clone(),
            }
        })?;
        if device != request.device {
            warn!(requested = %request.device, %device, %instance_id, "requested device is in use");
        }

        run.enter(LifecycleState::CreatingVolume);
        let volumes = self.volumes();
        let volume = volumes
            .create_volume(request.size_gb, &request.zone, |created| {
                run.volume_id = Some(created.id.clone());
            })
            .await?;

        run.enter(LifecycleState::Attaching);
        volumes
            .attach(&volume.id, &instance_id, &device, || run.attach_requested = true)
            .await?;

        let disk = RemoteDiskInitializer::new(
            &self.shell,
            RemoteTarget {
                host,
                identity_file: key.local_path.clone(),
            },
            self.settings.filesystem.clone(),
        );
        run.enter(LifecycleState::Partitioning);
        disk.partition(&device)?;
        run.enter(LifecycleState::Formatting);
        disk.format_partition(&device)?;

        info!(volume_id = %volume.id, %instance_id, %device, "volume prepared");
        Ok(Prepared {
            volume_id: volume.id,
            instance_id,
            device,
        })
    }

    async fn finish(
        &self,
        request: &ProvisionRequest,
        prepared: Prepared,
        run: &mut RunState,
    ) -> ProvisionOutcome {
        let mut warnings = Vec::new();
        let helper_retained = if request.shutdown_after {
            run.enter(LifecycleState::TearingDown);
            self.tear_down(&prepared.volume_id, &mut warnings).await;
            false
        } else {
            run.enter(LifecycleState::Idle);
            if let Some(helper) = run.helper.take()
                && let Err(err) = self.leases.release(&helper.lease)
            {
                warnings.push(CleanupError::new(
                    format!("release lease on {}", helper.id()),
                    &err,
                ));
            }
            info!(
                instance_id = %prepared.instance_id,
                "helper left running for reuse; run `blockprep stop` to remove it"
            );
            true
        };

        let recorded_in = request.record_as.as_deref().and_then(|alias| {
            match self
                .store
                .record_volume_id(alias, &prepared.volume_id, request.force)
            {
                Ok(path) => {
                    info!(alias, volume_id = %prepared.volume_id, %path, "recorded volume");
                    Some(path.into_string())
                }
                Err(err) => {
                    warnings.push(CleanupError::new(format!("record volume as {alias}"), &err));
                    None
                }
            }
        });

        for warning in &warnings {
            warn!(
                action = %warning.action,
                error = %warning.message,
                "post-provisioning step failed"
            );
        }
        run.enter(LifecycleState::Done);
        ProvisionOutcome {
            volume_id: prepared.volume_id,
            instance_id: prepared.instance_id,
            device: prepared.device,
            helper_retained,
            recorded_in,
            warnings,
        }
    }

    async fn tear_down(&self, volume_id: &str, warnings: &mut Vec<CleanupError>) {
        let volumes = self.volumes();
        if let Err(err) = volumes.detach(volume_id).await {
            warnings.push(CleanupError::new(format!("detach volume {volume_id}"), &err));
        }
        tokio::time::sleep(self.settings.detach_grace).await;
        match self.locator().release_all().await {
            Ok(report) => warnings.extend(report.failures),
            Err(err) => warnings.push(CleanupError::new("release helper resources", &err)),
        }
    }

    async fn rollback(&self, run: &mut RunState) -> Vec<CleanupError> {
        let mut errors = Vec::new();

        if let Some(volume_id) = run.volume_id.as_deref() {
            if run.attach_requested {
                match self.provider.detach_volume(volume_id).await {
                    Ok(()) => info!(volume_id, "detached volume during rollback"),
                    Err(err) => errors.push(CleanupError::new(
                        format!("detach volume {volume_id}"),
                        &err,
                    )),
                }
                tokio::time::sleep(self.settings.detach_grace).await;
            }
            warn!(volume_id, "volume was created and is left in place");
        }

        if let Some(helper) = run.helper.take() {
            if helper.is_reused() && self.settings.preserve_reused_on_failure {
                if let Err(err) = self.leases.release(&helper.lease) {
                    errors.push(CleanupError::new(
                        format!("release lease on {}", helper.id()),
                        &err,
                    ));
                }
                info!(instance_id = %helper.id(), "kept reused helper running");
            } else {
                match self.provider.terminate_instance(helper.id()).await {
                    Ok(()) => {
                        info!(instance_id = %helper.id(), "terminated helper during rollback");
                    }
                    Err(err) => errors.push(CleanupError::new(
                        format!("terminate instance {}", helper.id()),
                        &err,
                    )),
                }
                if let Err(err) = self.leases.invalidate(helper.id()) {
                    errors.push(CleanupError::new(format!("drop lease on {}", helper.id()), &err));
                }
            }
        }

        for cleanup in &errors {
            error!(action = %cleanup.action, error = %cleanup.message, "rollback step failed");
        }
        errors
    }
}
