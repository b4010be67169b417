use thiserror::Error;

use crate::storage::StorageError;

/// Failures while completing the login callback.
///
/// The user stays signed out and has to start a new login.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("callback URL is missing the authorization code")]
    MissingCode,
    #[error("callback URL is missing the state parameter")]
    MissingState,
    #[error("no pending login matches state {0}")]
    UnknownState(String),
    #[error("identity provider returned {error}: {}", description.as_deref().unwrap_or("no description"))]
    ProviderError {
        error: String,
        description: Option<String>,
    },
    #[error("code exchange rejected with status {status}: {}", error.as_deref().unwrap_or("unknown error"))]
    ExchangeRejected { status: u16, error: Option<String> },
    #[error("ID token nonce does not match the pending login")]
    NonceMismatch,
}

/// Normalized identity-provider errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A logout landed while the operation was in flight.
    #[error("Signed out before the login completed")]
    SignedOut,
    #[error("Login callback failed: {0}")]
    Callback(#[from] CallbackError),
    #[error("Provider discovery failed: {0}")]
    Discovery(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Navigation failed: {0}")]
    Navigation(String),
}

impl AuthError {
    /// Whether this error came from the callback route checks or exchange.
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<StorageError> for AuthError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error.to_string())
    }
}
