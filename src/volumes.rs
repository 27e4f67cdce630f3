//! Volume creation, attachment and detachment.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::lifecycle::ProvisionError;
use crate::provider::{AttachmentState, Provider, TransientError, VolumeSnapshot, VolumeStatus};
use crate::wait::{WaitPolicy, poll_until};

/// Creates and attaches volumes, waiting for each change to settle.
pub struct VolumeProvisioner<'a, P: Provider> {
    provider: &'a P,
    policy: WaitPolicy,
    cancel: &'a CancellationToken,
}

impl<'a, P: Provider> VolumeProvisioner<'a, P> {
    /// Creates a provisioner polling with `policy`.
    pub const fn new(provider: &'a P, policy: WaitPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            provider,
            policy,
            cancel,
        }
    }

    /// Creates a volume and waits until it is available.
    ///
    /// The snapshot returned by the creation call is passed to `on_created`
    /// before the wait starts so callers can track the volume for rollback.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when a provider call fails,
    /// [`ProvisionError::ResourceState`] when the volume reports `error` or
    /// disappears, and the wait errors from [`poll_until`].
    pub async fn create_volume(
        &self,
        size_gb: u32,
        zone: &str,
        on_created: impl FnOnce(&VolumeSnapshot),
    ) -> Result<VolumeSnapshot, ProvisionError<P::Error>> {
        let created = self
            .provider
            .create_volume(size_gb, zone)
            .await
            .map_err(ProvisionError::remote("create volume"))?;
        info!(volume_id = %created.id, size_gb, zone, "volume requested");
        on_created(&created);

        let resource = format!("volume {}", created.id);
        let volume = poll_until::<_, ProvisionError<P::Error>, _, _>(
            &self.policy,
            self.cancel,
            &resource,
            || async {
                let Some(snapshot) = self.poll(&created.id).await? else {
                    return Ok(None);
                };
                match snapshot.status {
                    VolumeStatus::Available => Ok(Some(snapshot)),
                    VolumeStatus::Error => Err(ProvisionError::ResourceState {
                        resource: resource.clone(),
                        state: snapshot.status.to_string(),
                    }),
                    _ => Ok(None),
                }
            },
        )
        .await?;
        info!(volume_id = %volume.id, "volume available");
        Ok(volume)
    }

    async fn begin_attach(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), ProvisionError<P::Error>> {
        self.provider
            .attach_volume(volume_id, instance_id, device)
            .await
            .map_err(ProvisionError::remote("attach volume"))?;
        info!(volume_id, instance_id, device, "attachment requested");
        Ok(())
    }

    async fn wait_until_attached(
        &self,
        volume_id: &str,
    ) -> Result<VolumeSnapshot, ProvisionError<P::Error>> {
        let resource = format!("attachment of volume {volume_id}");
        let volume = poll_until::<_, ProvisionError<P::Error>, _, _>(
            &self.policy,
            self.cancel,
            &resource,
            || async {
                let Some(snapshot) = self.poll(volume_id).await? else {
                    return Ok(None);
                };
                Ok((snapshot.attachment == AttachmentState::Attached).then_some(snapshot))
            },
        )
        .await?;
        info!(volume_id, "volume attached");
        Ok(volume)
    }

    /// Attaches the volume at `device` and waits until it reports
    /// `attached`. `on_requested` runs once the provider accepts the attach
    /// call, so callers know a detach is owed if the wait fails.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when a provider call fails,
    /// [`ProvisionError::ResourceState`] when the volume disappears, and the
    /// wait errors from [`poll_until`].
    pub async fn attach(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        on_requested: impl FnOnce(),
    ) -> Result<VolumeSnapshot, ProvisionError<P::Error>> {
        self.begin_attach(volume_id, instance_id, device).await?;
        on_requested();
        self.wait_until_attached(volume_id).await
    }

    /// Requests detachment of the volume.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when the provider rejects the call.
    pub async fn detach(&self, volume_id: &str) -> Result<(), ProvisionError<P::Error>> {
        self.provider
            .detach_volume(volume_id)
            .await
            .map_err(ProvisionError::remote("detach volume"))?;
        info!(volume_id, "detachment requested");
        Ok(())
    }

    /// Describes the volume for a poll. Transient provider errors yield
    /// `None` so the poll tries again.
    async fn poll(&self, volume_id: &str) -> Result<Option<VolumeSnapshot>, ProvisionError<P::Error>> {
        match self.describe(volume_id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(ProvisionError::Remote { source, .. }) if source.is_transient() => {
                debug!(volume_id, error = %source, "transient describe failure; polling again");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn describe(&self, volume_id: &str) -> Result<VolumeSnapshot, ProvisionError<P::Error>> {
        self.provider
            .describe_volume(volume_id)
            .await
            .map_err(ProvisionError::remote("describe volume"))?
            .ok_or_else(|| ProvisionError::ResourceState {
                resource: format!("volume {volume_id}"),
                state: String::from("missing"),
            })
    }
}
