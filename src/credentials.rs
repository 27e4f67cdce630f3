//! Selection of the keypair used to reach helper instances.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{debug, info};

use crate::config_store::KeyStore;
use crate::provider::Provider;
use crate::remote::expand_tilde;
use crate::validation::ValidationError;

/// A keypair paired with the local private key file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyMaterial {
    /// Keypair name registered with the provider.
    pub keypair_name: String,
    /// Private key path after `~` expansion.
    pub local_path: Utf8PathBuf,
}

#[derive(Debug, Eq, PartialEq)]
enum KeyFileKind {
    Missing,
    File,
    Other,
}

fn inspect_key_file(path: &Utf8Path) -> io::Result<KeyFileKind> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let Some(file_name) = path.file_name() else {
        return Ok(KeyFileKind::Other);
    };
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(KeyFileKind::Missing),
        Err(err) => return Err(err),
    };
    if !dir.try_exists(file_name)? {
        return Ok(KeyFileKind::Missing);
    }
    let kind = if dir.metadata(file_name)?.is_file() {
        KeyFileKind::File
    } else {
        KeyFileKind::Other
    };
    Ok(kind)
}

/// Resolves an optional keypair name to usable [`KeyMaterial`].
pub struct CredentialResolver<'a, P: Provider, K: KeyStore + ?Sized> {
    provider: &'a P,
    keys: &'a K,
}

impl<'a, P: Provider, K: KeyStore + ?Sized> CredentialResolver<'a, P, K> {
    /// Creates a resolver over the provider's keypairs and local key
    /// configuration.
    pub const fn new(provider: &'a P, keys: &'a K) -> Self {
        Self { provider, keys }
    }

    /// Picks the keypair to use and checks its key file.
    ///
    /// With `keypair` set, that keypair must exist remotely and be
    /// configured locally. Without it, the first remote keypair, in provider
    /// order, that is also configured locally is used. Its key file is
    /// checked either way, so a broken entry is reported rather than
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::KeyPairNotFound`],
    /// [`ValidationError::KeyNotConfigured`],
    /// [`ValidationError::NoUsableKeyPair`],
    /// [`ValidationError::KeyFileMissing`] or
    /// [`ValidationError::KeyFileNotFile`].
    pub async fn resolve(&self, keypair: Option<&str>) -> Result<KeyMaterial, ValidationError> {
        let material = match keypair {
            Some(name) => self.named(name).await?,
            None => self.discovered().await?,
        };
        Self::check_file(&material)?;
        info!(
            keypair = %material.keypair_name,
            path = %material.local_path,
            "using keypair"
        );
        Ok(material)
    }

    async fn named(&self, name: &str) -> Result<KeyMaterial, ValidationError> {
        self.provider
            .describe_key_pair(name)
            .await
            .map_err(|err| ValidationError::Lookup {
                what: format!("keypair {name}"),
                message: err.to_string(),
            })?
            .ok_or_else(|| ValidationError::KeyPairNotFound {
                name: name.to_owned(),
            })?;

        let location =
            self.keys
                .key_location(name)?
                .ok_or_else(|| ValidationError::KeyNotConfigured {
                    name: name.to_owned(),
                })?;
        Ok(KeyMaterial {
            keypair_name: name.to_owned(),
            local_path: expand_tilde(&location),
        })
    }

    async fn discovered(&self) -> Result<KeyMaterial, ValidationError> {
        let remote = self
            .provider
            .list_key_pairs()
            .await
            .map_err(|err| ValidationError::Lookup {
                what: String::from("keypairs"),
                message: err.to_string(),
            })?;

        let configured = self.keys.key_names()?;
        let Some(pair) = remote
            .into_iter()
            .find(|pair| configured.contains(&pair.name))
        else {
            debug!(?configured, "no provider keypair is configured locally");
            return Err(ValidationError::NoUsableKeyPair);
        };
        let location = self
            .keys
            .key_location(&pair.name)?
            .ok_or_else(|| ValidationError::KeyNotConfigured {
                name: pair.name.clone(),
            })?;
        Ok(KeyMaterial {
            keypair_name: pair.name,
            local_path: expand_tilde(&location),
        })
    }

    fn check_file(material: &KeyMaterial) -> Result<(), ValidationError> {
        let missing = || ValidationError::KeyFileMissing {
            name: material.keypair_name.clone(),
            path: material.local_path.clone(),
        };
        match inspect_key_file(&material.local_path) {
            Ok(KeyFileKind::File) => Ok(()),
            Ok(KeyFileKind::Other) => Err(ValidationError::KeyFileNotFile {
                name: material.keypair_name.clone(),
                path: material.local_path.clone(),
            }),
            Ok(KeyFileKind::Missing) | Err(_) => Err(missing()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeProvider, MemoryConfigStore};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct KeyDir {
        tmp: TempDir,
    }

    impl KeyDir {
        fn file(&self, name: &str) -> String {
            let path = self.tmp.path().join(name);
            std::fs::write(&path, "PRIVATE KEY").unwrap_or_else(|err| panic!("write key: {err}"));
            path.to_string_lossy().into_owned()
        }

        fn dir(&self, name: &str) -> String {
            let path = self.tmp.path().join(name);
            std::fs::create_dir(&path).unwrap_or_else(|err| panic!("mkdir: {err}"));
            path.to_string_lossy().into_owned()
        }

        fn absent(&self, name: &str) -> String {
            self.tmp.path().join(name).to_string_lossy().into_owned()
        }
    }

    #[fixture]
    fn keys() -> KeyDir {
        KeyDir {
            tmp: TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}")),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn named_keypair_resolves_to_its_file(keys: KeyDir) {
        let provider = FakeProvider::new().with_key_pair("alpha");
        let store = MemoryConfigStore::new().with_key("alpha", &keys.file("alpha.pem"));

        let material = CredentialResolver::new(&provider, &store)
            .resolve(Some("alpha"))
            .await
            .unwrap_or_else(|err| panic!("resolve: {err}"));

        assert_eq!(material.keypair_name, "alpha");
        assert!(material.local_path.as_str().ends_with("alpha.pem"));
    }

    #[rstest]
    #[tokio::test]
    async fn named_keypair_must_exist_remotely(keys: KeyDir) {
        let provider = FakeProvider::new();
        let store = MemoryConfigStore::new().with_key("alpha", &keys.file("alpha.pem"));

        let result = CredentialResolver::new(&provider, &store)
            .resolve(Some("alpha"))
            .await;
        assert_eq!(
            result,
            Err(ValidationError::KeyPairNotFound {
                name: String::from("alpha")
            })
        );
    }

    #[tokio::test]
    async fn named_keypair_must_be_configured() {
        let provider = FakeProvider::new().with_key_pair("alpha");
        let store = MemoryConfigStore::new();

        let result = CredentialResolver::new(&provider, &store)
            .resolve(Some("alpha"))
            .await;
        assert!(matches!(
            result,
            Err(ValidationError::KeyNotConfigured { .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn discovery_takes_first_configured_in_provider_order(keys: KeyDir) {
        let provider = FakeProvider::new()
            .with_key_pair("unconfigured")
            .with_key_pair("second")
            .with_key_pair("third");
        let store = MemoryConfigStore::new()
            .with_key("third", &keys.file("third.pem"))
            .with_key("second", &keys.file("second.pem"));

        let material = CredentialResolver::new(&provider, &store)
            .resolve(None)
            .await
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(material.keypair_name, "second");
        assert!(material.local_path.as_str().ends_with("second.pem"));
    }

    #[rstest]
    #[tokio::test]
    async fn discovery_reports_a_broken_first_choice(keys: KeyDir) {
        let provider = FakeProvider::new()
            .with_key_pair("first")
            .with_key_pair("second");
        let store = MemoryConfigStore::new()
            .with_key("first", &keys.absent("first.pem"))
            .with_key("second", &keys.file("second.pem"));

        let result = CredentialResolver::new(&provider, &store)
            .resolve(None)
            .await;
        let Err(ValidationError::KeyFileMissing { name, .. }) = result else {
            panic!("expected KeyFileMissing, got {result:?}");
        };
        assert_eq!(name, "first");
    }

    #[tokio::test]
    async fn discovery_requires_a_configured_keypair() {
        let provider = FakeProvider::new().with_key_pair("remote-only");
        let store = MemoryConfigStore::new().with_key("local-only", "/keys/local.pem");

        let result = CredentialResolver::new(&provider, &store)
            .resolve(None)
            .await;
        assert_eq!(result, Err(ValidationError::NoUsableKeyPair));
    }

    #[rstest]
    #[tokio::test]
    async fn directories_are_not_key_files(keys: KeyDir) {
        let provider = FakeProvider::new().with_key_pair("alpha");
        let store = MemoryConfigStore::new().with_key("alpha", &keys.dir("alpha.d"));

        let result = CredentialResolver::new(&provider, &store)
            .resolve(Some("alpha"))
            .await;
        assert!(matches!(result, Err(ValidationError::KeyFileNotFile { .. })));
    }
}
