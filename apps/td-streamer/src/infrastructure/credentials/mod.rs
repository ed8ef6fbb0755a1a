//! Credential Adapters
//!
//! - [`StaticAuthProvider`]: hands out a fixed credential bundle, which can
//!   be replaced at runtime.
//! - [`StoredAuthProvider`]: reads credentials through a
//!   [`CredentialStore`], caching them until they expire.
//! - [`JsonFileCredentialStore`]: persists the bundle as a JSON file,
//!   by default `$HOME/.td-streamer/credentials.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::application::ports::{AuthProvider, CredentialStore, CredentialsError};
use crate::domain::streaming::SessionCredentials;

/// Directory under `$HOME` holding the default credential file.
pub const DEFAULT_CREDENTIALS_DIR: &str = ".td-streamer";

/// Default credential file name.
pub const DEFAULT_CREDENTIALS_FILE: &str = "credentials.json";

// =============================================================================
// Static Provider
// =============================================================================

/// Provider returning a fixed credential bundle.
#[derive(Debug)]
pub struct StaticAuthProvider {
    credentials: RwLock<SessionCredentials>,
}

impl StaticAuthProvider {
    /// Create a provider.
    #[must_use]
    pub const fn new(credentials: SessionCredentials) -> Self {
        Self {
            credentials: RwLock::new(credentials),
        }
    }

    /// Replace the bundle handed out on the next request.
    pub fn replace(&self, credentials: SessionCredentials) {
        *self.credentials.write() = credentials;
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn current_credentials(&self) -> Result<SessionCredentials, CredentialsError> {
        Ok(self.credentials.read().clone())
    }
}

// =============================================================================
// Stored Provider
// =============================================================================

/// Provider backed by a credential store.
#[derive(Debug)]
pub struct StoredAuthProvider<S> {
    store: S,
    cached: Mutex<Option<SessionCredentials>>,
}

impl<S: CredentialStore> StoredAuthProvider<S> {
    /// Create a provider over `store`.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Persist new credentials and use them from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot save them.
    pub async fn update(&self, credentials: SessionCredentials) -> Result<(), CredentialsError> {
        self.store.save(&credentials).await?;
        *self.cached.lock() = Some(credentials);
        Ok(())
    }

    async fn load(&self) -> Result<SessionCredentials, CredentialsError> {
        let credentials = self.store.load().await?.ok_or(CredentialsError::Missing)?;
        *self.cached.lock() = Some(credentials.clone());
        Ok(credentials)
    }
}

#[async_trait]
impl<S: CredentialStore> AuthProvider for StoredAuthProvider<S> {
    async fn current_credentials(&self) -> Result<SessionCredentials, CredentialsError> {
        let cached = self.cached.lock().clone();
        match cached {
            Some(credentials) if !credentials.is_expired() => Ok(credentials),
            _ => self.load().await,
        }
    }

    async fn refresh_credentials(&self) -> Result<SessionCredentials, CredentialsError> {
        self.cached.lock().take();
        self.load().await
    }
}

// =============================================================================
// JSON File Store
// =============================================================================

/// Stores credentials as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonFileCredentialStore {
    path: PathBuf,
}

impl JsonFileCredentialStore {
    /// Store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.td-streamer/credentials.json`, if `HOME` is set.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(DEFAULT_CREDENTIALS_DIR)
                .join(DEFAULT_CREDENTIALS_FILE)
        })
    }

    /// File being read and written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage_error(err: &std::io::Error) -> CredentialsError {
    CredentialsError::Storage {
        message: err.to_string(),
    }
}

#[async_trait]
impl CredentialStore for JsonFileCredentialStore {
    async fn load(&self) -> Result<Option<SessionCredentials>, CredentialsError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CredentialsError::Invalid {
                message: e.to_string(),
            })
    }

    async fn save(&self, credentials: &SessionCredentials) -> Result<(), CredentialsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(&e))?;
        }
        let text = serde_json::to_string_pretty(credentials).map_err(|e| {
            CredentialsError::Invalid {
                message: e.to_string(),
            }
        })?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| storage_error(&e))?;
        tracing::debug!(path = %self.path.display(), "Saved credentials");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn creds(token: &str, expires_in: Duration) -> SessionCredentials {
        SessionCredentials {
            access_token: token.to_string(),
            streamer_session_id: "app1".to_string(),
            account_id: "123456789".to_string(),
            subscription_key: "subKey".to_string(),
            token_expiry: Utc::now() + expires_in,
        }
    }

    #[tokio::test]
    async fn file_store_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCredentialStore::new(dir.path().join("credentials.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_round_trip_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCredentialStore::new(dir.path().join("a").join("credentials.json"));
        let credentials = creds("tok", Duration::hours(1));

        store.save(&credentials).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(credentials));
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileCredentialStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(CredentialsError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn stored_provider_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            StoredAuthProvider::new(JsonFileCredentialStore::new(dir.path().join("none.json")));
        assert!(matches!(
            provider.current_credentials().await,
            Err(CredentialsError::Missing)
        ));
    }

    #[tokio::test]
    async fn stored_provider_reloads_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCredentialStore::new(dir.path().join("credentials.json"));
        let provider = StoredAuthProvider::new(store.clone());

        provider.update(creds("first", Duration::hours(1))).await.unwrap();
        assert_eq!(provider.current_credentials().await.unwrap().access_token, "first");

        store.save(&creds("second", Duration::hours(1))).await.unwrap();
        assert_eq!(provider.current_credentials().await.unwrap().access_token, "first");
        assert_eq!(provider.refresh_credentials().await.unwrap().access_token, "second");
    }

    #[tokio::test]
    async fn static_provider_replace() {
        let provider = StaticAuthProvider::new(creds("a", Duration::hours(1)));
        provider.replace(creds("b", Duration::hours(1)));
        assert_eq!(provider.current_credentials().await.unwrap().access_token, "b");
    }
}
