//! Error types for dashlink.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;

/// Primary error type for all dashlink operations.
#[derive(Error, Debug)]
pub enum DashError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The API answered `401 Unauthorized`; the persisted token has been cleared.
    #[error("Unauthorized request to {path}")]
    Unauthorized { path: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DashError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(_) => ErrorCategory::Authentication,
            Self::Unauthorized { .. } => ErrorCategory::Authorization,
            Self::Network(_) => ErrorCategory::Network,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Api { status, .. } => match status {
                401 => ErrorCategory::Authorization,
                403 => ErrorCategory::Authentication,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Server | ErrorCategory::Transport
        )
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Authentication | ErrorCategory::Authorization => {
                RecoverySuggestion::SignInAgain
            }
            ErrorCategory::Network | ErrorCategory::Server | ErrorCategory::Transport => {
                RecoverySuggestion::RetryWithBackoff
            }
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            _ => RecoverySuggestion::ContactSupport,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, DashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_authorization_and_not_retryable() {
        let err = DashError::Unauthorized {
            path: "/projects".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Authorization);
        assert!(!err.is_retryable());
        assert_eq!(err.recovery_suggestion(), RecoverySuggestion::SignInAgain);
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = DashError::api(503, "unavailable");
        assert_eq!(err.category(), ErrorCategory::Server);
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_map_to_api() {
        let err = DashError::api(422, "bad block");
        assert_eq!(err.category(), ErrorCategory::Api);
        assert_eq!(err.recovery_suggestion(), RecoverySuggestion::ContactSupport);
    }
}
