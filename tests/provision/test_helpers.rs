//! Shared fixtures for provisioning BDD scenarios.

use std::cell::RefCell;

use blockprep::test_support::{FakeProvider, MemoryConfigStore, ScriptedProbe, ScriptedRunner};
use blockprep::{
    LeaseTable, LifecycleController, LifecycleState, ProvisionOutcome, ProvisionParams,
    ProvisionSettings, RemoteShell, SshConfig,
};
use rstest::fixture;
use tempfile::TempDir;

use crate::test_constants::{IMAGE_ID, KEYPAIR, ZONE};

pub type Controller =
    LifecycleController<FakeProvider, ScriptedRunner, MemoryConfigStore, ScriptedProbe>;

#[derive(Clone, Debug)]
pub enum RunResult {
    Success(ProvisionOutcome),
    Failure {
        stage: LifecycleState,
        message: String,
    },
}

pub struct ProvisionContext {
    pub provider: RefCell<FakeProvider>,
    pub runner: ScriptedRunner,
    pub store: MemoryConfigStore,
    pub leases: LeaseTable,
    pub zone: RefCell<String>,
    pub image_id: RefCell<String>,
    pub shutdown_after: RefCell<bool>,
    pub result: RefCell<Option<RunResult>>,
    _keys: TempDir,
}

impl ProvisionContext {
    pub fn controller(&self) -> Controller {
        let shell = RemoteShell::new(ssh_config(), self.runner.clone())
            .unwrap_or_else(|err| panic!("ssh config should validate: {err}"));
        LifecycleController::new(
            self.provider.borrow().clone(),
            shell,
            self.store.clone(),
            ScriptedProbe::new(),
            ProvisionSettings::default().without_delays(),
        )
        .with_leases(self.leases.clone())
    }

    pub fn params(&self, size: &str, device: &str) -> ProvisionParams {
        ProvisionParams {
            size: size.to_owned(),
            zone: self.zone.borrow().clone(),
            device: Some(device.to_owned()),
            image_id: self.image_id.borrow().clone(),
            instance_type: String::from("t3.micro"),
            shutdown_after: *self.shutdown_after.borrow(),
            ..ProvisionParams::default()
        }
    }

    pub fn provider(&self) -> FakeProvider {
        self.provider.borrow().clone()
    }
}

fn ssh_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("root"),
        ssh_port: 22,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
    }
}

#[fixture]
pub fn provision_context() -> ProvisionContext {
    let keys = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let key_path = keys.path().join("deploy.pem");
    std::fs::write(&key_path, "PRIVATE KEY").unwrap_or_else(|err| panic!("write key: {err}"));
    let location = key_path
        .to_str()
        .unwrap_or_else(|| panic!("temp path should be UTF-8"))
        .to_owned();

    ProvisionContext {
        provider: RefCell::new(FakeProvider::new().with_key_pair(KEYPAIR)),
        runner: ScriptedRunner::new(),
        store: MemoryConfigStore::new().with_key(KEYPAIR, &location),
        leases: LeaseTable::default(),
        zone: RefCell::new(String::from(ZONE)),
        image_id: RefCell::new(String::from(IMAGE_ID)),
        shutdown_after: RefCell::new(false),
        result: RefCell::new(None),
        _keys: keys,
    }
}
