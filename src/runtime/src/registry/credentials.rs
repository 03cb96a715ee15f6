//! Registry credentials.
//!
//! Logins live in `~/.refit/auth/credentials.json` in the `auths` layout of a
//! Docker client config, each entry holding the Base64 `user:password`
//! payload that registries and the engine consume. Callers resolve payloads
//! through a [`CredentialProvider`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use refit_core::error::{RefitError, Result};
use serde::{Deserialize, Serialize};

/// Environment variables consulted before the credential store.
pub const USERNAME_ENV: &str = "REFIT_REGISTRY_USERNAME";
pub const PASSWORD_ENV: &str = "REFIT_REGISTRY_PASSWORD";

/// Base64 `user:password` payload for HTTP basic auth.
pub fn basic_payload(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

/// Resolves the basic-auth payload for a registry host.
///
/// Returns an empty string when nothing is configured, in which case the
/// registry is accessed anonymously.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, registry: &str) -> String;
}

/// Provider returning one fixed payload for every registry.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    payload: String,
}

impl StaticCredentialProvider {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Always anonymous.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, _registry: &str) -> String {
        self.payload.clone()
    }
}

/// Environment first, then the credential store, then anonymous.
pub struct DefaultCredentialProvider {
    store: Option<CredentialStore>,
}

impl DefaultCredentialProvider {
    pub fn new(store: Option<CredentialStore>) -> Self {
        Self { store }
    }

    /// Provider over the store at the default path, if a home directory exists.
    pub fn from_default_store() -> Self {
        Self::new(CredentialStore::default_path().ok())
    }
}

impl CredentialProvider for DefaultCredentialProvider {
    fn resolve(&self, registry: &str) -> String {
        if let (Ok(username), Ok(password)) =
            (std::env::var(USERNAME_ENV), std::env::var(PASSWORD_ENV))
        {
            return basic_payload(&username, &password);
        }

        if let Some(ref store) = self.store {
            match store.payload(registry) {
                Ok(Some(payload)) => return payload,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(registry, error = %e, "Credential store unreadable, using anonymous access");
                }
            }
        }

        String::new()
    }
}

/// Canonical key for Docker Hub in the store.
const DOCKER_HUB_KEY: &str = "docker.io";

/// Names Docker Hub is known by.
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthEntry {
    auth: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

/// File-backed registry logins.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.refit/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            RefitError::Config("no home directory for the credential store".to_string())
        })?;
        Ok(Self::new(home.join(".refit").join("auth").join("credentials.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a login, replacing any earlier one for the registry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.read()?;
        file.auths.insert(
            registry_key(registry),
            AuthEntry {
                auth: basic_payload(username, password),
            },
        );
        self.write(&file)?;
        tracing::debug!(registry, path = %self.path.display(), "Stored registry login");
        Ok(())
    }

    /// Base64 payload stored for `registry`.
    pub fn payload(&self, registry: &str) -> Result<Option<String>> {
        Ok(self
            .read()?
            .auths
            .remove(&registry_key(registry))
            .map(|entry| entry.auth)
            .filter(|auth| !auth.is_empty()))
    }

    /// Forget the login for `registry`. Returns false if there was none.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.read()?;
        if file.auths.remove(&registry_key(registry)).is_none() {
            return Ok(false);
        }
        self.write(&file)?;
        Ok(true)
    }

    fn read(&self) -> Result<AuthFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AuthFile::default()),
            Err(e) => return Err(store_error("read", &self.path, e)),
        };
        serde_json::from_str(&data).map_err(|e| store_error("parse", &self.path, e))
    }

    /// Replace the file in one rename so readers never see a partial write.
    fn write(&self, file: &AuthFile) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| store_error("create", dir, e))?;
        }

        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(file)?)
            .map_err(|e| store_error("write", &staging, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| store_error("restrict", &staging, e))?;
        }
        std::fs::rename(&staging, &self.path).map_err(|e| store_error("replace", &self.path, e))
    }
}

fn store_error(action: &str, path: &Path, err: impl std::fmt::Display) -> RefitError {
    RefitError::Config(format!(
        "credential store: cannot {} {}: {}",
        action,
        path.display(),
        err
    ))
}

/// Store key for a registry: lowercase host, Docker Hub aliases folded
/// into one, scheme and path of legacy server URLs dropped.
fn registry_key(registry: &str) -> String {
    let host = registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DOCKER_HUB_KEY.to_string()
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("auth").join("credentials.json"))
    }

    #[test]
    fn test_basic_payload() {
        assert_eq!(basic_payload("user", "pass"), "dXNlcjpwYXNz");
    }

    #[test]
    fn test_registry_key() {
        assert_eq!(registry_key("GHCR.io"), "ghcr.io");
        assert_eq!(registry_key("index.docker.io"), "docker.io");
        assert_eq!(registry_key("https://index.docker.io/v1/"), "docker.io");
        assert_eq!(registry_key("registry.local:5000"), "registry.local:5000");
    }

    #[test]
    fn test_login_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.payload("ghcr.io").unwrap(), None);

        store.store("ghcr.io", "robot", "s3cret").unwrap();
        assert_eq!(
            store.payload("ghcr.io").unwrap(),
            Some(basic_payload("robot", "s3cret"))
        );
        // Survives reopening
        let reopened = CredentialStore::new(store.path().to_path_buf());
        assert!(reopened.payload("ghcr.io").unwrap().is_some());
    }

    #[test]
    fn test_file_uses_auths_layout() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store("quay.io", "u", "p").unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(doc["auths"]["quay.io"]["auth"], basic_payload("u", "p"));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store("quay.io", "u", "p").unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_docker_hub_aliases_share_one_login() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store("index.docker.io", "user", "pass").unwrap();

        for alias in DOCKER_HUB_ALIASES {
            assert_eq!(
                store.payload(alias).unwrap(),
                Some(basic_payload("user", "pass"))
            );
        }
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store("ghcr.io", "u", "p").unwrap();
        store.store("quay.io", "u", "p").unwrap();

        assert!(store.remove("ghcr.io").unwrap());
        assert!(!store.remove("ghcr.io").unwrap());
        assert_eq!(store.payload("ghcr.io").unwrap(), None);
        assert!(store.payload("quay.io").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{ nope").unwrap();
        assert!(matches!(store.payload("ghcr.io"), Err(RefitError::Config(_))));
    }

    #[test]
    fn test_static_provider() {
        assert_eq!(StaticCredentialProvider::anonymous().resolve("ghcr.io"), "");
        assert_eq!(StaticCredentialProvider::new("abc").resolve("quay.io"), "abc");
    }

    #[test]
    fn test_default_provider_reads_store() {
        if std::env::var(USERNAME_ENV).is_ok() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store("quay.io", "robot", "secret").unwrap();

        let provider = DefaultCredentialProvider::new(Some(store));
        assert_eq!(provider.resolve("quay.io"), basic_payload("robot", "secret"));
        assert_eq!(provider.resolve("ghcr.io"), "");
    }

    #[test]
    fn test_default_provider_without_store_is_anonymous() {
        if std::env::var(USERNAME_ENV).is_ok() {
            return;
        }
        assert_eq!(DefaultCredentialProvider::new(None).resolve("ghcr.io"), "");
    }
}
