//! Identity provider boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use url::Url;

use super::error::AuthError;

/// Browser-redirect mechanism used to hand the user to the provider.
///
/// A redirect ends the current flow: after `navigate` succeeds the caller
/// must treat the process as suspended until a new one starts at the target.
pub trait Navigator: Send + Sync {
    fn navigate(&self, target: &Url) -> Result<(), AuthError>;
}

/// Identity claims describing the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The provider client's cached view of the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUser {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub profile: UserProfile,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl ProviderUser {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= Utc::now())
            .unwrap_or(false)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

/// Published shortly before the current access token expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenExpiring {
    pub expires_at: DateTime<Utc>,
}

/// Result of a completed login callback.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub user: ProviderUser,
    /// Local route to navigate to now that the user is signed in.
    pub return_to: String,
}

/// Standards-based authorization-code client.
///
/// Implementations own their cached user and expiry timer; the session
/// manager only reacts to what they report.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Start the redirect to the provider. `return_url` is carried through
    /// the flow and honored by [`complete_login_callback`](Self::complete_login_callback).
    async fn initiate_login(&self, return_url: Option<&str>) -> Result<(), AuthError>;

    /// Consume `code` and `state` from the callback URL and exchange them.
    async fn complete_login_callback(&self, callback_url: &Url)
        -> Result<CallbackOutcome, AuthError>;

    /// Obtain a fresh token without user interaction.
    ///
    /// `Ok(None)` means renewal is not possible; errors are reserved for
    /// transport failures.
    async fn try_silent_renewal(&self) -> Result<Option<ProviderUser>, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    async fn get_current_user(&self) -> Result<Option<ProviderUser>, AuthError>;

    async fn forget_user(&self) -> Result<(), AuthError>;

    fn subscribe_expiring(&self) -> broadcast::Receiver<AccessTokenExpiring>;
}
