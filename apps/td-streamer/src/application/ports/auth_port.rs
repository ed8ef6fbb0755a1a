//! Auth Ports (Driven Ports)
//!
//! Interfaces for obtaining and persisting streamer session credentials.

use async_trait::async_trait;

use crate::domain::streaming::SessionCredentials;

/// Supplies credentials for a connection attempt.
///
/// Called once per connection attempt. After a login rejection the session
/// calls [`AuthProvider::refresh_credentials`] instead, which providers may
/// use to obtain a new token.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current credentials.
    async fn current_credentials(&self) -> Result<SessionCredentials, CredentialsError>;

    /// Fresh credentials after the previous ones were rejected or expired.
    async fn refresh_credentials(&self) -> Result<SessionCredentials, CredentialsError> {
        self.current_credentials().await
    }
}

/// Loads and saves the credential bundle.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load stored credentials, `None` if nothing has been stored yet.
    async fn load(&self) -> Result<Option<SessionCredentials>, CredentialsError>;

    /// Persist credentials.
    async fn save(&self, credentials: &SessionCredentials) -> Result<(), CredentialsError>;
}

/// Credential supply errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialsError {
    /// No credentials have been stored.
    #[error("no stored credentials")]
    Missing,

    /// Stored credentials could not be read or written.
    #[error("credential storage error: {message}")]
    Storage {
        /// Error details.
        message: String,
    },

    /// Stored credentials could not be parsed.
    #[error("invalid credential data: {message}")]
    Invalid {
        /// Error details.
        message: String,
    },
}
