//! Tests for configuration store helpers.

use super::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct ConfigFixture {
    _tmp: TempDir,
    path: Utf8PathBuf,
    store: ConfigStore,
}

impl ConfigFixture {
    fn seed(&self, contents: &str) {
        std::fs::write(&self.path, contents).unwrap_or_else(|err| panic!("seed config: {err}"));
    }

    fn contents(&self) -> String {
        read_config(&self.path).unwrap_or_else(|err| panic!("read config: {err}"))
    }
}

#[fixture]
fn config_fixture() -> ConfigFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join(CONFIG_FILE_NAME))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    let store = ConfigStore::with_discovery(discovery_for_path(&path));
    ConfigFixture {
        _tmp: tmp,
        path,
        store,
    }
}

fn discovery_for_path(path: &Utf8Path) -> ConfigDiscovery {
    let root = path
        .parent()
        .unwrap_or_else(|| panic!("temp path should have a parent directory"));
    ConfigDiscovery::builder(APP_NAME)
        .env_var(CONFIG_ENV_VAR)
        .config_file_name(CONFIG_FILE_NAME)
        .dotfile_name(DOTFILE_NAME)
        .project_file_name(PROJECT_FILE_NAME)
        .clear_project_roots()
        .add_project_root(root)
        .build()
}

#[rstest]
fn missing_file_has_no_keys(config_fixture: ConfigFixture) {
    let names = config_fixture
        .store
        .key_names()
        .unwrap_or_else(|err| panic!("key names: {err}"));
    assert!(names.is_empty());
}

#[rstest]
fn key_locations_are_read_per_name(config_fixture: ConfigFixture) {
    config_fixture.seed(
        r#"
[keys.alpha]
key_location = "~/.ssh/alpha.pem"

[keys.beta]
key_location = " /keys/beta.pem "

[keys.gamma]
comment = "no location"
"#,
    );

    let names = config_fixture
        .store
        .key_names()
        .unwrap_or_else(|err| panic!("key names: {err}"));
    assert_eq!(names, vec![String::from("alpha"), String::from("beta")]);

    let beta = config_fixture
        .store
        .key_location("beta")
        .unwrap_or_else(|err| panic!("key location: {err}"));
    assert_eq!(beta.as_deref(), Some("/keys/beta.pem"));
    assert_eq!(
        config_fixture.store.key_location("missing").ok().flatten(),
        None
    );
}

#[rstest]
fn malformed_key_section_is_reported(config_fixture: ConfigFixture) {
    config_fixture.seed("keys = \"not a table\"\n");

    let err = config_fixture
        .store
        .key_names()
        .expect_err("scalar keys section should fail");
    assert!(matches!(err, ConfigStoreError::InvalidStructure { .. }));
}

#[rstest]
fn record_creates_config_file(config_fixture: ConfigFixture) {
    let written = config_fixture
        .store
        .record_volume_id("data", "vol-123", false)
        .unwrap_or_else(|err| panic!("record volume: {err}"));

    assert_eq!(written, config_fixture.path);
    assert!(config_fixture.contents().contains("vol-123"));
    assert_eq!(
        config_fixture
            .store
            .recorded_volume_id("data")
            .ok()
            .flatten()
            .as_deref(),
        Some("vol-123")
    );
}

#[rstest]
fn record_preserves_key_entries(config_fixture: ConfigFixture) {
    config_fixture.seed("[keys.alpha]\nkey_location = \"/keys/alpha.pem\"\n");

    config_fixture
        .store
        .record_volume_id("data", "vol-123", false)
        .unwrap_or_else(|err| panic!("record volume: {err}"));

    assert_eq!(
        config_fixture
            .store
            .key_location("alpha")
            .ok()
            .flatten()
            .as_deref(),
        Some("/keys/alpha.pem")
    );
}

#[rstest]
fn record_rejects_existing_alias_without_force(config_fixture: ConfigFixture) {
    config_fixture
        .store
        .record_volume_id("data", "vol-123", false)
        .unwrap_or_else(|err| panic!("seed config: {err}"));

    let Err(err) = config_fixture
        .store
        .record_volume_id("data", "vol-456", false)
    else {
        panic!("overwrite should fail without force");
    };

    let ConfigStoreError::VolumeAlreadyRecorded { alias, volume_id } = err else {
        panic!("expected VolumeAlreadyRecorded error");
    };
    assert_eq!(alias, "data");
    assert_eq!(volume_id, "vol-123");
}

#[rstest]
fn record_overwrites_when_forced(config_fixture: ConfigFixture) {
    config_fixture
        .store
        .record_volume_id("data", "vol-123", false)
        .unwrap_or_else(|err| panic!("seed config: {err}"));
    config_fixture
        .store
        .record_volume_id("data", "vol-456", true)
        .unwrap_or_else(|err| panic!("overwrite config: {err}"));

    assert_eq!(
        config_fixture
            .store
            .recorded_volume_id("data")
            .ok()
            .flatten()
            .as_deref(),
        Some("vol-456")
    );
}

#[rstest]
fn other_aliases_do_not_conflict(config_fixture: ConfigFixture) {
    config_fixture
        .store
        .record_volume_id("data", "vol-123", false)
        .unwrap_or_else(|err| panic!("seed config: {err}"));
    config_fixture
        .store
        .record_volume_id("scratch", "vol-456", false)
        .unwrap_or_else(|err| panic!("second alias: {err}"));

    assert_eq!(
        config_fixture
            .store
            .recorded_volume_id("data")
            .ok()
            .flatten()
            .as_deref(),
        Some("vol-123")
    );
}
