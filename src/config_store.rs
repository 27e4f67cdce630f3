//! Key locations and recorded volume identifiers in `blockprep.toml`.
//!
//! The file is discovered with `OrthoConfig`'s search order. Keys live under
//! `[keys.<name>]` with a `key_location` entry, and recorded volumes under
//! `[volumes.<alias>]` with a `volume_id` entry.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use thiserror::Error;

use ortho_config::toml;

const APP_NAME: &str = "blockprep";
const CONFIG_ENV_VAR: &str = "BLOCKPREP_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "blockprep.toml";
const DOTFILE_NAME: &str = ".blockprep.toml";
const PROJECT_FILE_NAME: &str = "blockprep.toml";
const KEYS_SECTION: &str = "keys";
const KEY_LOCATION: &str = "key_location";
const VOLUMES_SECTION: &str = "volumes";
const VOLUME_ID: &str = "volume_id";

/// Errors raised while reading or updating `blockprep.toml`.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// Discovery produced no candidate paths at all.
    #[error("no configuration file candidates were discovered")]
    NoCandidates,
    /// The file or its directory could not be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying I/O error text.
        message: String,
    },
    /// The file is not valid TOML, or could not be rendered back.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Offending file.
        path: Utf8PathBuf,
        /// Parser error text.
        message: String,
    },
    /// The TOML parses but a section or entry has the wrong shape.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Offending file.
        path: Utf8PathBuf,
        /// Which section or entry was malformed.
        message: String,
    },
    /// Raised when an alias is already recorded and overwrite is disabled.
    #[error("volume alias {alias} already records {volume_id}; rerun with --force to replace it")]
    VolumeAlreadyRecorded {
        /// Alias that is taken.
        alias: String,
        /// Volume identifier already recorded under the alias.
        volume_id: String,
    },
}

/// Read access to locally configured key pairs.
pub trait KeyStore {
    /// Names of every key with a configured location, in table order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the file cannot be read or parsed.
    fn key_names(&self) -> Result<Vec<String>, ConfigStoreError>;

    /// Configured private key path for `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the file cannot be read or parsed.
    fn key_location(&self, name: &str) -> Result<Option<String>, ConfigStoreError>;
}

/// Records created volumes under user-chosen aliases.
pub trait VolumeRecorder {
    /// Volume id currently recorded under `alias`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the file cannot be read or parsed.
    fn recorded_volume_id(&self, alias: &str) -> Result<Option<String>, ConfigStoreError>;

    /// Records `volume_id` under `alias`, returning the file written.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::VolumeAlreadyRecorded`] when `alias` is
    /// taken and `force` is false, or another variant when the file cannot
    /// be updated.
    fn record_volume_id(
        &self,
        alias: &str,
        volume_id: &str,
        force: bool,
    ) -> Result<Utf8PathBuf, ConfigStoreError>;
}

/// Reads and updates `blockprep.toml` using `OrthoConfig`'s discovery order.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    discovery: ConfigDiscovery,
}

impl ConfigStore {
    /// Builds a config store using the standard discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
        }
    }

    /// Builds a config store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    fn resolve_target(&self) -> Result<ConfigTarget, ConfigStoreError> {
        let candidates = self.discovery.utf8_candidates();
        if candidates.is_empty() {
            return Err(ConfigStoreError::NoCandidates);
        }

        for candidate in &candidates {
            if path_exists(candidate)? {
                return Ok(ConfigTarget {
                    path: candidate.clone(),
                    exists: true,
                });
            }
        }

        let fallback = candidates
            .last()
            .cloned()
            .ok_or(ConfigStoreError::NoCandidates)?;
        Ok(ConfigTarget {
            path: fallback,
            exists: false,
        })
    }

    fn load(&self) -> Result<(Utf8PathBuf, toml::Value), ConfigStoreError> {
        let target = self.resolve_target()?;
        let contents = if target.exists {
            read_config(&target.path)?
        } else {
            String::new()
        };
        let value = parse_toml(&target.path, &contents)?;
        Ok((target.path, value))
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for ConfigStore {
    fn key_names(&self) -> Result<Vec<String>, ConfigStoreError> {
        let (path, value) = self.load()?;
        let Some(keys) = section(&path, &value, KEYS_SECTION)? else {
            return Ok(Vec::new());
        };
        let mut names = Vec::with_capacity(keys.len());
        for name in keys.keys() {
            if entry_string(&path, keys, KEYS_SECTION, name, KEY_LOCATION)?.is_some() {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    fn key_location(&self, name: &str) -> Result<Option<String>, ConfigStoreError> {
        let (path, value) = self.load()?;
        let Some(keys) = section(&path, &value, KEYS_SECTION)? else {
            return Ok(None);
        };
        entry_string(&path, keys, KEYS_SECTION, name, KEY_LOCATION)
    }
}

impl VolumeRecorder for ConfigStore {
    fn recorded_volume_id(&self, alias: &str) -> Result<Option<String>, ConfigStoreError> {
        let (path, value) = self.load()?;
        let Some(volumes) = section(&path, &value, VOLUMES_SECTION)? else {
            return Ok(None);
        };
        entry_string(&path, volumes, VOLUMES_SECTION, alias, VOLUME_ID)
    }

    fn record_volume_id(
        &self,
        alias: &str,
        volume_id: &str,
        force: bool,
    ) -> Result<Utf8PathBuf, ConfigStoreError> {
        let (path, mut value) = self.load()?;
        if let Some(volumes) = section(&path, &value, VOLUMES_SECTION)?
            && let Some(existing) = entry_string(&path, volumes, VOLUMES_SECTION, alias, VOLUME_ID)?
            && !force
        {
            return Err(ConfigStoreError::VolumeAlreadyRecorded {
                alias: alias.to_owned(),
                volume_id: existing,
            });
        }

        write_volume_entry(&path, &mut value, alias, volume_id)?;
        write_config(&path, &value)?;
        Ok(path)
    }
}

#[derive(Clone, Debug)]
struct ConfigTarget {
    path: Utf8PathBuf,
    exists: bool,
}

fn io_error(path: &Utf8Path) -> impl FnOnce(io::Error) -> ConfigStoreError + '_ {
    move |err| ConfigStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn invalid(path: &Utf8Path, message: String) -> ConfigStoreError {
    ConfigStoreError::InvalidStructure {
        path: path.to_path_buf(),
        message,
    }
}

/// Splits `path` into the directory to open and the file name inside it.
fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), ConfigStoreError> {
    let file_name = path.file_name().ok_or_else(|| {
        invalid(
            path,
            String::from("configuration file path is missing a filename"),
        )
    })?;
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, file_name))
}

fn open_parent(parent: &Utf8Path) -> Result<Dir, ConfigStoreError> {
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error(parent))
}

fn path_exists(path: &Utf8Path) -> Result<bool, ConfigStoreError> {
    let (parent, file_name) = split_path(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(io_error(parent)(err)),
    };
    dir.try_exists(file_name).map_err(io_error(path))
}

fn read_config(path: &Utf8Path) -> Result<String, ConfigStoreError> {
    let (parent, file_name) = split_path(path)?;
    open_parent(parent)?
        .read_to_string(file_name)
        .map_err(io_error(path))
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, ConfigStoreError> {
    if contents.trim().is_empty() {
        return Ok(empty_table());
    }
    toml::from_str(contents).map_err(|err| ConfigStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::value::Table::new())
}

fn section<'v>(
    path: &Utf8Path,
    value: &'v toml::Value,
    name: &str,
) -> Result<Option<&'v toml::value::Table>, ConfigStoreError> {
    let root = value
        .as_table()
        .ok_or_else(|| invalid(path, String::from("configuration root is not a table")))?;
    match root.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .as_table()
            .map(Some)
            .ok_or_else(|| invalid(path, format!("[{name}] must be a table"))),
    }
}

/// Reads `[section_name.entry].key` as a trimmed string.
fn entry_string(
    path: &Utf8Path,
    section: &toml::value::Table,
    section_name: &str,
    entry: &str,
    key: &str,
) -> Result<Option<String>, ConfigStoreError> {
    let Some(raw) = section.get(entry) else {
        return Ok(None);
    };
    let table = raw
        .as_table()
        .ok_or_else(|| invalid(path, format!("[{section_name}.{entry}] must be a table")))?;
    let Some(field) = table.get(key) else {
        return Ok(None);
    };
    field
        .as_str()
        .map(|text| Some(text.trim().to_owned()))
        .ok_or_else(|| invalid(path, format!("{section_name}.{entry}.{key} must be a string")))
}

fn table_entry<'t>(
    path: &Utf8Path,
    table: &'t mut toml::value::Table,
    key: &str,
    label: &str,
) -> Result<&'t mut toml::value::Table, ConfigStoreError> {
    table
        .entry(key.to_owned())
        .or_insert_with(empty_table)
        .as_table_mut()
        .ok_or_else(|| invalid(path, format!("[{label}] must be a table")))
}

fn write_volume_entry(
    path: &Utf8Path,
    value: &mut toml::Value,
    alias: &str,
    volume_id: &str,
) -> Result<(), ConfigStoreError> {
    let root = value
        .as_table_mut()
        .ok_or_else(|| invalid(path, String::from("configuration root is not a table")))?;
    let volumes = table_entry(path, root, VOLUMES_SECTION, VOLUMES_SECTION)?;
    let entry = table_entry(path, volumes, alias, &format!("{VOLUMES_SECTION}.{alias}"))?;
    entry.insert(
        String::from(VOLUME_ID),
        toml::Value::String(volume_id.trim().to_owned()),
    );
    Ok(())
}

fn write_config(path: &Utf8Path, value: &toml::Value) -> Result<(), ConfigStoreError> {
    let (parent, file_name) = split_path(path)?;
    let rendered = toml::to_string_pretty(value).map_err(|err| ConfigStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(io_error(parent))?;
    open_parent(parent)?
        .write(file_name, rendered)
        .map_err(io_error(path))
}

#[cfg(test)]
mod tests;
