//! Discovery, reuse and launch of helper instances.
//!
//! Helpers are tagged by membership of a dedicated security group. A run
//! reuses the first live helper in its zone that no other run holds, and
//! launches exactly one new instance otherwise.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::KeyMaterial;
use crate::lease::{Lease, LeaseError, LeaseOrigin, LeaseTable};
use crate::lifecycle::{CleanupError, ProvisionError};
use crate::probe::ReachabilityProbe;
use crate::progress::WaitIndicator;
use crate::provider::{
    InstanceSnapshot, InstanceState, LaunchRequest, Provider, SecurityGroup, TransientError,
};
use crate::settings::ProvisionSettings;
use crate::wait::{WaitPolicy, poll_until};

/// User data passed to launched helpers so they can identify their role.
pub const STARTUP_ROLE_MARKER: &str = "blockprep-helper";

/// Attempts made to delete the helper group while EC2 still reports it in
/// use by terminating instances.
const GROUP_DELETE_ATTEMPTS: u32 = 12;

/// What [`ResourceLocator::release_all`] managed to clean up.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReleaseReport {
    /// Instances whose termination was accepted, in listing order.
    pub terminated: Vec<String>,
    /// Whether the helper group was deleted.
    pub group_deleted: bool,
    /// Steps that failed, in the order they were attempted.
    pub failures: Vec<CleanupError>,
}

/// Result of a single instance lookup made while polling.
enum Described {
    Found(InstanceSnapshot),
    Missing,
    Unavailable,
}

impl ReleaseReport {
    /// Returns `true` when every step succeeded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A helper instance held by the current run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HelperInstance {
    /// Latest snapshot of the instance.
    pub snapshot: InstanceSnapshot,
    /// Lease held on the instance.
    pub lease: Lease,
}

impl HelperInstance {
    /// Provider identifier of the instance.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    /// Returns `true` when the instance existed before this run.
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.lease.origin == LeaseOrigin::Reused
    }
}

/// Picks the first live instance in `zone` that `is_free` accepts.
pub fn select_reusable<'s>(
    instances: &'s [InstanceSnapshot],
    zone: &str,
    mut is_free: impl FnMut(&InstanceSnapshot) -> bool,
) -> Option<&'s InstanceSnapshot> {
    instances
        .iter()
        .filter(|instance| instance.state.is_live() && instance.zone == zone)
        .find(|instance| is_free(instance))
}

/// Finds, launches and releases helper instances.
pub struct ResourceLocator<'a, P: Provider, Q: ReachabilityProbe + ?Sized> {
    provider: &'a P,
    probe: &'a Q,
    leases: &'a LeaseTable,
    indicator: &'a dyn WaitIndicator,
    settings: &'a ProvisionSettings,
    cancel: &'a CancellationToken,
    group: Option<SecurityGroup>,
}

impl<'a, P: Provider, Q: ReachabilityProbe + ?Sized> ResourceLocator<'a, P, Q> {
    /// Creates a locator. The security group is resolved lazily and cached.
    pub const fn new(
        provider: &'a P,
        probe: &'a Q,
        leases: &'a LeaseTable,
        indicator: &'a dyn WaitIndicator,
        settings: &'a ProvisionSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            provider,
            probe,
            leases,
            indicator,
            settings,
            cancel,
            group: None,
        }
    }

    /// Returns the helper security group, creating and opening it to SSH
    /// when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when a provider call fails.
    pub async fn security_group(&mut self) -> Result<SecurityGroup, ProvisionError<P::Error>> {
        if let Some(group) = &self.group {
            return Ok(group.clone());
        }
        let group = match self.existing_group().await? {
            Some(group) => group,
            None => {
                let group = self
                    .provider
                    .create_security_group(
                        &self.settings.security_group_name,
                        &self.settings.security_group_description,
                    )
                    .await
                    .map_err(ProvisionError::remote("create security group"))?;
                self.provider
                    .authorize_ssh_ingress(&group, self.settings.ssh_port)
                    .await
                    .map_err(ProvisionError::remote("authorize ssh ingress"))?;
                info!(
                    group_id = %group.id,
                    name = %group.name,
                    ssh_port = self.settings.ssh_port,
                    "created helper security group"
                );
                group
            }
        };
        self.group = Some(group.clone());
        Ok(group)
    }

    /// Looks up the helper security group without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when the lookup fails.
    pub async fn existing_group(&self) -> Result<Option<SecurityGroup>, ProvisionError<P::Error>> {
        if let Some(group) = &self.group {
            return Ok(Some(group.clone()));
        }
        self.provider
            .find_security_group(&self.settings.security_group_name)
            .await
            .map_err(ProvisionError::remote("find security group"))
    }

    /// Reuses a live helper in `zone` or launches a new one, and leases it.
    /// Does not wait for the helper to become reachable.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] when a provider call fails and
    /// [`ProvisionError::Lease`] when the lease table is unusable.
    pub async fn locate_or_launch(
        &mut self,
        zone: &str,
        image_id: &str,
        instance_type: &str,
        key: &KeyMaterial,
    ) -> Result<HelperInstance, ProvisionError<P::Error>> {
        let group = self.security_group().await?;
        let instances = self
            .provider
            .list_group_instances(&group)
            .await
            .map_err(ProvisionError::remote("list helper instances"))?;

        let mut lease_failure = None;
        let reusable = select_reusable(&instances, zone, |instance| {
            match self.leases.is_held(&instance.id) {
                Ok(held) => !held,
                Err(err) => {
                    lease_failure.get_or_insert(err);
                    false
                }
            }
        })
        .cloned();
        if let Some(err) = lease_failure {
            return Err(err.into());
        }

        if let Some(snapshot) = reusable {
            match self.leases.acquire(&snapshot.id, LeaseOrigin::Reused) {
                Ok(lease) => {
                    info!(instance_id = %snapshot.id, state = %snapshot.state, "reusing helper instance");
                    return Ok(HelperInstance { snapshot, lease });
                }
                Err(LeaseError::Held { instance_id }) => {
                    debug!(%instance_id, "helper was leased concurrently; launching instead");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let request = LaunchRequest {
            image_id: image_id.to_owned(),
            instance_type: instance_type.to_owned(),
            zone: zone.to_owned(),
            security_group: group,
            key_name: key.keypair_name.clone(),
            user_data: STARTUP_ROLE_MARKER.to_owned(),
        };
        let snapshot = self
            .provider
            .run_instance(&request)
            .await
            .map_err(ProvisionError::remote("launch helper instance"))?;
        info!(instance_id = %snapshot.id, zone, image_id, instance_type, "launched helper instance");
        match self.leases.acquire(&snapshot.id, LeaseOrigin::Launched) {
            Ok(lease) => Ok(HelperInstance { snapshot, lease }),
            Err(err) => {
                warn!(instance_id = %snapshot.id, error = %err, "could not lease launched helper; terminating it");
                if let Err(terminate_err) = self.provider.terminate_instance(&snapshot.id).await {
                    warn!(
                        instance_id = %snapshot.id,
                        error = %terminate_err,
                        "failed to terminate unleased helper"
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Waits until the helper is running, has a public address and accepts
    /// SSH connections. Refreshes the helper's snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ResourceState`] when the instance stops or
    /// disappears, [`ProvisionError::Remote`] when a describe call fails,
    /// and the wait errors from [`poll_until`].
    pub async fn wait_until_reachable(
        &self,
        helper: &mut HelperInstance,
    ) -> Result<(), ProvisionError<P::Error>> {
        let instance_id = helper.id().to_owned();
        let resource = format!("instance {instance_id}");
        self.indicator
            .start(&format!("Waiting for helper {instance_id} to accept SSH"));
        let result = poll_until::<_, ProvisionError<P::Error>, _, _>(
            &self.settings.instance_wait,
            self.cancel,
            &resource,
            || async {
                let snapshot = match self.describe_instance(&instance_id).await? {
                    Described::Found(snapshot) => snapshot,
                    Described::Unavailable => return Ok(None),
                    Described::Missing => {
                        return Err(ProvisionError::ResourceState {
                            resource: resource.clone(),
                            state: String::from("missing"),
                        });
                    }
                };
                if snapshot.state.is_gone() {
                    return Err(ProvisionError::ResourceState {
                        resource: resource.clone(),
                        state: snapshot.state.to_string(),
                    });
                }
                if snapshot.state != InstanceState::Running {
                    return Ok(None);
                }
                let Some(host) = snapshot.public_address.as_deref() else {
                    return Ok(None);
                };
                let reachable = self.probe.is_reachable(host, self.settings.ssh_port).await;
                Ok(reachable.then_some(snapshot))
            },
        )
        .await;

        match result {
            Ok(snapshot) => {
                self.indicator.finish(&format!("Helper {instance_id} is up"));
                info!(%instance_id, "helper instance reachable");
                helper.snapshot = snapshot;
                Ok(())
            }
            Err(err) => {
                self.indicator
                    .fail(&format!("Gave up waiting for helper {instance_id}"));
                Err(err.into())
            }
        }
    }

    /// Locates or launches a helper and waits until it is reachable.
    ///
    /// The leased helper is passed to `on_located` before the wait starts so
    /// callers can still clean it up when the wait fails.
    ///
    /// # Errors
    ///
    /// See [`ResourceLocator::locate_or_launch`] and
    /// [`ResourceLocator::wait_until_reachable`].
    pub async fn acquire_instance(
        &mut self,
        zone: &str,
        image_id: &str,
        instance_type: &str,
        key: &KeyMaterial,
        on_located: impl FnOnce(&HelperInstance),
    ) -> Result<HelperInstance, ProvisionError<P::Error>> {
        let mut helper = self
            .locate_or_launch(zone, image_id, instance_type, key)
            .await?;
        on_located(&helper);
        self.wait_until_reachable(&mut helper).await?;
        Ok(helper)
    }

    /// Terminates every instance in the helper group, waits for them to
    /// terminate, then deletes the group.
    ///
    /// Every step is attempted even when an earlier one fails; failures are
    /// collected in the returned [`ReleaseReport`]. Does nothing when the
    /// group does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Remote`] only when the group or its members
    /// cannot be listed.
    pub async fn release_all(&mut self) -> Result<ReleaseReport, ProvisionError<P::Error>> {
        let mut report = ReleaseReport::default();
        let Some(group) = self.existing_group().await? else {
            info!(name = %self.settings.security_group_name, "no helper security group to release");
            return Ok(report);
        };

        let instances = self
            .provider
            .list_group_instances(&group)
            .await
            .map_err(ProvisionError::remote("list helper instances"))?;
        for instance in instances
            .iter()
            .filter(|instance| instance.state != InstanceState::Terminated)
        {
            if let Err(err) = self.provider.terminate_instance(&instance.id).await {
                report.failures.push(CleanupError::new(
                    format!("terminate instance {}", instance.id),
                    &err,
                ));
                continue;
            }
            if let Err(err) = self.leases.invalidate(&instance.id) {
                warn!(instance_id = %instance.id, error = %err, "failed to drop helper lease");
            }
            info!(instance_id = %instance.id, "terminating helper instance");
            report.terminated.push(instance.id.clone());
        }

        for instance_id in &report.terminated {
            if let Err(err) = self.wait_until_terminated(instance_id).await {
                report.failures.push(CleanupError::new(
                    format!("wait for instance {instance_id} to terminate"),
                    &err,
                ));
            }
        }

        match self.delete_group(&group).await {
            Ok(()) => {
                info!(group_id = %group.id, "deleted helper security group");
                self.group = None;
                report.group_deleted = true;
            }
            Err(err) => report.failures.push(CleanupError::new(
                format!("delete security group {}", group.id),
                &err,
            )),
        }

        for failure in &report.failures {
            warn!(action = %failure.action, error = %failure.message, "helper cleanup step failed");
        }
        Ok(report)
    }

    /// Describes an instance. Transient provider errors become
    /// [`Described::Unavailable`] so polls try again on their next attempt.
    async fn describe_instance(&self, instance_id: &str) -> Result<Described, ProvisionError<P::Error>> {
        match self.provider.describe_instance(instance_id).await {
            Ok(Some(snapshot)) => Ok(Described::Found(snapshot)),
            Ok(None) => Ok(Described::Missing),
            Err(err) if err.is_transient() => {
                debug!(instance_id, error = %err, "transient describe failure; polling again");
                Ok(Described::Unavailable)
            }
            Err(err) => Err(ProvisionError::remote("describe instance")(err)),
        }
    }

    async fn wait_until_terminated(&self, instance_id: &str) -> Result<(), ProvisionError<P::Error>> {
        let resource = format!("termination of instance {instance_id}");
        poll_until::<_, ProvisionError<P::Error>, _, _>(
            &self.settings.instance_wait,
            self.cancel,
            &resource,
            || async {
                let done = match self.describe_instance(instance_id).await? {
                    Described::Found(snapshot) => snapshot.state == InstanceState::Terminated,
                    Described::Missing => true,
                    Described::Unavailable => false,
                };
                Ok(done.then_some(()))
            },
        )
        .await?;
        Ok(())
    }

    /// Deletes `group`, retrying while the provider reports it still in use.
    async fn delete_group(&self, group: &SecurityGroup) -> Result<(), ProvisionError<P::Error>> {
        let policy = WaitPolicy::bounded(self.settings.instance_wait.interval, GROUP_DELETE_ATTEMPTS);
        let resource = format!("deletion of security group {}", group.id);
        poll_until::<_, ProvisionError<P::Error>, _, _>(&policy, self.cancel, &resource, || async {
            match self.provider.delete_security_group(group).await {
                Ok(()) => Ok(Some(())),
                Err(err) if err.is_transient() => {
                    debug!(group_id = %group.id, error = %err, "security group still in use; retrying");
                    Ok(None)
                }
                Err(err) => Err(ProvisionError::remote("delete security group")(err)),
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentIndicator;
    use crate::test_support::{FakeProvider, FakeProviderError, ProviderCall, ScriptedProbe};
    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use std::collections::BTreeMap;

    const GROUP: &str = "blockprep-helpers";
    const ZONE: &str = "us-east-1a";

    struct Harness {
        provider: FakeProvider,
        probe: ScriptedProbe,
        leases: LeaseTable,
        settings: ProvisionSettings,
        cancel: CancellationToken,
    }

    impl Harness {
        fn with_provider(self, provider: FakeProvider) -> Self {
            Self { provider, ..self }
        }

        fn with_probe(self, probe: ScriptedProbe) -> Self {
            Self { probe, ..self }
        }

        fn with_settings(self, settings: ProvisionSettings) -> Self {
            Self { settings, ..self }
        }

        fn locator(&self) -> ResourceLocator<'_, FakeProvider, ScriptedProbe> {
            ResourceLocator::new(
                &self.provider,
                &self.probe,
                &self.leases,
                &SilentIndicator,
                &self.settings,
                &self.cancel,
            )
        }

        async fn acquire(
            &self,
            tracked: &mut Option<String>,
        ) -> Result<HelperInstance, ProvisionError<FakeProviderError>> {
            self.locator()
                .acquire_instance(ZONE, "ami-1234", "t3.micro", &key(), |helper| {
                    *tracked = Some(helper.id().to_owned());
                })
                .await
        }
    }

    #[fixture]
    fn harness() -> Harness {
        Harness {
            provider: FakeProvider::new(),
            probe: ScriptedProbe::new(),
            leases: LeaseTable::default(),
            settings: ProvisionSettings::default().without_delays(),
            cancel: CancellationToken::new(),
        }
    }

    fn key() -> KeyMaterial {
        KeyMaterial {
            keypair_name: String::from("deploy"),
            local_path: Utf8PathBuf::from("/keys/deploy.pem"),
        }
    }

    fn instance(id: &str, zone: &str, state: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            id: id.to_owned(),
            zone: zone.to_owned(),
            state: InstanceState::parse(state),
            block_devices: BTreeMap::new(),
            public_address: None,
        }
    }

    #[test]
    fn first_live_instance_in_zone_is_selected() {
        let instances = vec![
            instance("i-stopped", "us-east-1a", "stopped"),
            instance("i-other-zone", "us-east-1b", "running"),
            instance("i-pending", "us-east-1a", "pending"),
            instance("i-running", "us-east-1a", "running"),
        ];
        let selected = select_reusable(&instances, "us-east-1a", |_| true);
        assert_eq!(selected.map(|i| i.id.as_str()), Some("i-pending"));
    }

    #[test]
    fn leased_instances_are_skipped() {
        let instances = vec![
            instance("i-1", "us-east-1a", "running"),
            instance("i-2", "us-east-1a", "running"),
        ];
        let selected = select_reusable(&instances, "us-east-1a", |i| i.id != "i-1");
        assert_eq!(selected.map(|i| i.id.as_str()), Some("i-2"));
    }

    #[test]
    fn no_candidate_yields_none() {
        let instances = vec![instance("i-1", "us-east-1a", "terminated")];
        assert!(select_reusable(&instances, "us-east-1a", |_| true).is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn pending_helper_is_polled_until_running(harness: Harness) {
        let harness = harness.with_provider(FakeProvider::new().with_instance_pending_polls(3));
        let mut tracked = None;

        let helper = harness
            .acquire(&mut tracked)
            .await
            .unwrap_or_else(|err| panic!("acquire: {err}"));

        assert_eq!(helper.snapshot.state, InstanceState::Running);
        assert_eq!(tracked.as_deref(), Some(helper.id()));
        assert_eq!(harness.provider.calls_to("describe_instance").len(), 4);
        assert_eq!(
            harness.probe.probed_hosts(),
            vec![format!("{}.fake.internal", helper.id())]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn closed_ssh_port_is_checked_again(harness: Harness) {
        let harness = harness.with_probe(ScriptedProbe::new().unreachable_for(2));
        let mut tracked = None;

        let helper = harness
            .acquire(&mut tracked)
            .await
            .unwrap_or_else(|err| panic!("acquire: {err}"));

        assert_eq!(harness.probe.probed_hosts().len(), 3);
        assert_eq!(harness.provider.calls_to("describe_instance").len(), 3);
        assert!(helper.snapshot.public_address.is_some());
    }

    #[rstest]
    #[tokio::test]
    async fn helper_lost_while_booting_fails_the_wait(harness: Harness) {
        let harness = harness.with_provider(
            FakeProvider::new()
                .with_instance_pending_polls(1)
                .with_failing_boot(),
        );
        let mut tracked = None;

        let result = harness.acquire(&mut tracked).await;

        let Err(ProvisionError::ResourceState { state, .. }) = &result else {
            panic!("expected a resource state error, got {result:?}");
        };
        assert_eq!(state, "terminated");
        assert!(tracked.is_some(), "helper should be reported before the wait");
        assert!(harness.probe.probed_hosts().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn throttled_describes_do_not_fail_the_wait(harness: Harness) {
        harness.provider.fail_transiently_on("describe_instance", 2);
        let mut tracked = None;

        harness
            .acquire(&mut tracked)
            .await
            .unwrap_or_else(|err| panic!("acquire: {err}"));

        assert_eq!(harness.provider.calls_to("describe_instance").len(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn existing_group_is_looked_up_once(harness: Harness) {
        let harness = harness.with_provider(FakeProvider::new().with_security_group(GROUP));
        let mut locator = harness.locator();

        let first = locator
            .security_group()
            .await
            .unwrap_or_else(|err| panic!("group: {err}"));
        let second = locator
            .security_group()
            .await
            .unwrap_or_else(|err| panic!("group: {err}"));

        assert_eq!(first, second);
        assert_eq!(harness.provider.calls_to("find_security_group").len(), 1);
        assert!(harness.provider.calls_to("create_security_group").is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_group_is_created_and_opened_once(harness: Harness) {
        let mut locator = harness.locator();
        for _ in 0..2 {
            locator
                .security_group()
                .await
                .unwrap_or_else(|err| panic!("group: {err}"));
        }

        assert_eq!(
            harness.provider.calls_to("create_security_group"),
            vec![ProviderCall::CreateSecurityGroup(String::from(GROUP))]
        );
        assert_eq!(
            harness.provider.calls_to("authorize_ssh_ingress"),
            vec![ProviderCall::AuthorizeSshIngress {
                group_id: String::from("sg-fake1"),
                port: 22,
            }]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn new_group_opens_the_configured_ssh_port(harness: Harness) {
        let settings = harness.settings.clone().with_ssh_port(2222);
        let harness = harness.with_settings(settings);

        harness
            .locator()
            .security_group()
            .await
            .unwrap_or_else(|err| panic!("group: {err}"));

        let opened: Vec<_> = harness
            .provider
            .calls_to("authorize_ssh_ingress")
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::AuthorizeSshIngress { port, .. } => Some(port),
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec![2222]);
    }

    #[rstest]
    #[tokio::test]
    async fn launched_helper_is_terminated_when_it_cannot_be_leased(harness: Harness) {
        // The fake provider numbers ids in creation order: the group is
        // sg-fake1, so the first launch is i-fake2.
        harness
            .leases
            .acquire("i-fake2", LeaseOrigin::Reused)
            .unwrap_or_else(|err| panic!("seed lease: {err}"));

        let result = harness
            .locator()
            .locate_or_launch(ZONE, "ami-1234", "t3.micro", &key())
            .await;

        assert!(
            matches!(result, Err(ProvisionError::Lease(LeaseError::Held { .. }))),
            "unexpected result: {result:?}"
        );
        assert_eq!(
            harness.provider.calls_to("terminate_instance"),
            vec![ProviderCall::TerminateInstance(String::from("i-fake2"))]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn release_continues_past_a_failed_terminate(harness: Harness) {
        let harness = harness.with_provider(
            FakeProvider::new()
                .with_group_instance(GROUP, "i-a", ZONE, "running")
                .with_group_instance(GROUP, "i-b", ZONE, "running"),
        );
        harness.provider.fail_on_target("terminate_instance", "i-a");

        let report = harness
            .locator()
            .release_all()
            .await
            .unwrap_or_else(|err| panic!("release: {err}"));

        assert_eq!(report.terminated, vec![String::from("i-b")]);
        let [failure] = report.failures.as_slice() else {
            panic!("expected one failure, got {:?}", report.failures);
        };
        assert_eq!(failure.action, "terminate instance i-a");
        assert!(report.group_deleted);
        assert!(!report.is_complete());
        assert_eq!(harness.provider.calls_to("terminate_instance").len(), 2);
        assert_eq!(harness.provider.calls_to("delete_security_group").len(), 1);
        assert_eq!(harness.provider.instance_state("i-b"), Some(InstanceState::Terminated));
    }

    #[rstest]
    #[tokio::test]
    async fn group_deletion_is_retried_while_in_use(harness: Harness) {
        let harness = harness.with_provider(
            FakeProvider::new().with_group_instance(GROUP, "i-a", ZONE, "running"),
        );
        harness.provider.fail_transiently_on("delete_security_group", 2);

        let report = harness
            .locator()
            .release_all()
            .await
            .unwrap_or_else(|err| panic!("release: {err}"));

        assert!(report.is_complete(), "{:?}", report.failures);
        assert!(report.group_deleted);
        assert_eq!(harness.provider.calls_to("delete_security_group").len(), 3);
        assert!(harness.provider.group_id(GROUP).is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn failed_group_deletion_is_reported(harness: Harness) {
        let harness = harness.with_provider(
            FakeProvider::new().with_group_instance(GROUP, "i-a", ZONE, "running"),
        );
        harness.provider.fail_on("delete_security_group");

        let report = harness
            .locator()
            .release_all()
            .await
            .unwrap_or_else(|err| panic!("release: {err}"));

        assert_eq!(report.terminated, vec![String::from("i-a")]);
        assert!(!report.group_deleted);
        let [failure] = report.failures.as_slice() else {
            panic!("expected one failure, got {:?}", report.failures);
        };
        assert!(failure.action.starts_with("delete security group"), "{failure:?}");
    }
}
