//! OpenID Connect authorization-code client with PKCE.
//!
//! The login is split across two processes: [`OidcClient::initiate_login`]
//! persists a [`PendingFlow`] keyed by `state` and redirects away;
//! [`OidcClient::complete_login_callback`] runs in a fresh process on the
//! callback route and rehydrates the flow from storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use url::{Origin, Url};

use super::error::{AuthError, CallbackError};
use super::pkce::{generate_pkce, random_hex};
use super::provider::{
    AccessTokenExpiring, CallbackOutcome, IdentityProvider, Navigator, ProviderUser, UserProfile,
};
use super::redirect::{append_return_to, resolve_post_login_target};
use crate::config::{join_path, AppConfig};
use crate::storage::KeyValueStore;

const PENDING_PREFIX: &str = "oidc.pending:";
const USER_PREFIX: &str = "oidc.user:";
const DISCOVERY_PATH: &str = ".well-known/openid-configuration";
const STALE_FLOW_AGE_SECS: i64 = 900;

/// Static settings for an [`OidcClient`].
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub authority: Url,
    pub client_id: String,
    pub redirect_uri: Url,
    pub post_logout_redirect_uri: Url,
    pub scope: String,
    pub app_origin: Origin,
    pub default_route: String,
    pub expiring_notification_lead: Duration,
}

impl OidcSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            authority: config.authority.clone(),
            client_id: config.client_id.clone(),
            redirect_uri: config.post_login_redirect_uri.clone(),
            post_logout_redirect_uri: config.post_logout_redirect_uri.clone(),
            scope: config.scope.clone(),
            app_origin: config.app_origin(),
            default_route: config.default_route.clone(),
            expiring_notification_lead: config.expiring_notification_lead,
        }
    }
}

/// Endpoints advertised by the provider's discovery document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
}

/// A login that has left for the provider and not come back yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFlow {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    /// Exact `redirect_uri` sent in the authorization request.
    pub redirect_uri: String,
    pub return_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// OIDC client backed by durable storage and a [`Navigator`].
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use dashlink::auth::{Navigator, AuthError};
/// use dashlink::auth::oidc::{OidcClient, OidcSettings};
/// use dashlink::config::AppConfig;
/// use dashlink::storage::FileKeyValueStore;
///
/// struct Print;
/// impl Navigator for Print {
///     fn navigate(&self, target: &url::Url) -> Result<(), AuthError> {
///         println!("open {target}");
///         Ok(())
///     }
/// }
///
/// let config = AppConfig::from_env()?;
/// let client = OidcClient::new(
///     OidcSettings::from_config(&config),
///     Arc::new(FileKeyValueStore::new(config.storage_dir.clone())),
///     Arc::new(Print),
/// );
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct OidcClient {
    client: reqwest::Client,
    settings: OidcSettings,
    storage: Arc<dyn KeyValueStore>,
    navigator: Arc<dyn Navigator>,
    metadata: OnceCell<ProviderMetadata>,
    renewal_gate: tokio::sync::Mutex<()>,
    renewal_epoch: AtomicU64,
    last_renewal: Mutex<Option<ProviderUser>>,
    expiring_tx: broadcast::Sender<AccessTokenExpiring>,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl OidcClient {
    pub fn new(
        settings: OidcSettings,
        storage: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let (expiring_tx, _) = broadcast::channel(8);
        Self {
            client: reqwest::Client::new(),
            settings,
            storage,
            navigator,
            metadata: OnceCell::new(),
            renewal_gate: tokio::sync::Mutex::new(()),
            renewal_epoch: AtomicU64::new(0),
            last_renewal: Mutex::new(None),
            expiring_tx,
            expiry_timer: Mutex::new(None),
        }
    }

    /// Skip discovery and use these endpoints.
    pub fn with_metadata(self, metadata: ProviderMetadata) -> Self {
        let _ = self.metadata.set(metadata);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    /// Discovery document, fetched once.
    pub async fn metadata(&self) -> Result<&ProviderMetadata, AuthError> {
        self.metadata
            .get_or_try_init(|| async {
                let url = join_path(&self.settings.authority, DISCOVERY_PATH)
                    .map_err(AuthError::Discovery)?;
                tracing::debug!(url = %url, "fetching OIDC discovery document");
                let resp = self.client.get(url.as_str()).send().await?;
                if !resp.status().is_success() {
                    return Err(AuthError::Discovery(format!(
                        "discovery request failed with status {}",
                        resp.status()
                    )));
                }
                resp.json::<ProviderMetadata>()
                    .await
                    .map_err(|err| AuthError::Discovery(err.to_string()))
            })
            .await
    }

    /// Pending flow stored for `state`, if any.
    pub fn pending_flow(&self, state: &str) -> Result<Option<PendingFlow>, AuthError> {
        match self.storage.get(&pending_key(state))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop pending flows that were never completed.
    pub fn clear_stale_state(&self) -> Result<usize, AuthError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(STALE_FLOW_AGE_SECS);
        let mut removed = 0;
        for key in self.storage.keys_with_prefix(PENDING_PREFIX)? {
            let stale = match self.storage.get(&key)? {
                Some(raw) => serde_json::from_str::<PendingFlow>(&raw)
                    .map(|flow| flow.created_at < cutoff)
                    .unwrap_or(true),
                None => false,
            };
            if stale {
                self.storage.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "cleared stale login flows");
        }
        Ok(removed)
    }

    fn user_key(&self) -> String {
        format!(
            "{USER_PREFIX}{}:{}",
            self.settings.authority.as_str().trim_end_matches('/'),
            self.settings.client_id
        )
    }

    fn load_user(&self) -> Result<Option<ProviderUser>, AuthError> {
        let Some(raw) = self.storage.get(&self.user_key())? else {
            return Ok(None);
        };
        match serde_json::from_str::<ProviderUser>(&raw) {
            Ok(user) => Ok(Some(user)),
            Err(error) => {
                tracing::warn!(%error, "discarding unreadable cached user");
                self.storage.remove(&self.user_key())?;
                Ok(None)
            }
        }
    }

    fn store_user(&self, user: &ProviderUser) -> Result<(), AuthError> {
        let serialized = serde_json::to_string(user)?;
        self.storage.set(&self.user_key(), &serialized)?;
        self.arm_expiry_timer(user);
        Ok(())
    }

    fn take_pending_flow(&self, state: &str) -> Result<Option<PendingFlow>, AuthError> {
        let flow = self.pending_flow(state)?;
        self.storage.remove(&pending_key(state))?;
        Ok(flow)
    }

    /// (Re)start the single "access token expiring" timer for `user`.
    fn arm_expiry_timer(&self, user: &ProviderUser) {
        let mut slot = self
            .expiry_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let Some(expires_at) = user.expires_at else {
            return;
        };
        let lead = chrono::Duration::from_std(self.settings.expiring_notification_lead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let delay = (expires_at - lead - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let tx = self.expiring_tx.clone();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "armed token expiry timer");
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(AccessTokenExpiring { expires_at });
        }));
    }

    fn cancel_expiry_timer(&self) {
        let mut slot = self
            .expiry_timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
    }

    async fn request_tokens(
        &self,
        params: &[(&str, &str)],
    ) -> Result<Result<TokenResponse, TokenErrorResponse>, AuthError> {
        let metadata = self.metadata().await?;
        let resp = self
            .client
            .post(metadata.token_endpoint.as_str())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            let payload: TokenResponse = resp.json().await.map_err(|err| {
                AuthError::InvalidResponse(format!("token response unreadable: {err}"))
            })?;
            return Ok(Ok(payload));
        }
        let body = resp.text().await.unwrap_or_default();
        let mut error: TokenErrorResponse =
            serde_json::from_str(&body).unwrap_or_default();
        error.status = status;
        Ok(Err(error))
    }

    async fn fetch_profile(
        &self,
        access_token: &str,
        id_token: Option<&str>,
    ) -> Result<UserProfile, AuthError> {
        let metadata = self.metadata().await?;
        if let Some(userinfo) = &metadata.userinfo_endpoint {
            let resp = self
                .client
                .get(userinfo.as_str())
                .bearer_auth(access_token)
                .send()
                .await?;
            if resp.status().is_success() {
                return resp.json::<UserProfile>().await.map_err(|err| {
                    AuthError::InvalidResponse(format!("userinfo response unreadable: {err}"))
                });
            }
            tracing::warn!(status = %resp.status(), "userinfo request failed, using ID token claims");
        }
        let id_token = id_token.ok_or_else(|| {
            AuthError::InvalidResponse("no userinfo endpoint and no ID token".into())
        })?;
        let claims = decode_jwt_claims(id_token)?;
        serde_json::from_value(claims)
            .map_err(|err| AuthError::InvalidResponse(format!("ID token claims invalid: {err}")))
    }
}

impl Drop for OidcClient {
    fn drop(&mut self) {
        self.cancel_expiry_timer();
    }
}

#[async_trait]
impl IdentityProvider for OidcClient {
    async fn initiate_login(&self, return_url: Option<&str>) -> Result<(), AuthError> {
        let metadata = self.metadata().await?;
        if let Err(error) = self.clear_stale_state() {
            tracing::warn!(%error, "failed to clear stale login flows");
        }

        let state = random_hex(16);
        let nonce = random_hex(16);
        let pkce = generate_pkce();
        let redirect_uri = match return_url {
            Some(return_url) => append_return_to(&self.settings.redirect_uri, return_url),
            None => self.settings.redirect_uri.clone(),
        };

        let flow = PendingFlow {
            state: state.clone(),
            nonce: nonce.clone(),
            code_verifier: pkce.verifier,
            redirect_uri: redirect_uri.to_string(),
            return_url: return_url.map(str::to_string),
            created_at: Utc::now(),
        };
        self.storage
            .set(&pending_key(&state), &serde_json::to_string(&flow)?)?;

        let mut authorize_url = metadata.authorization_endpoint.clone();
        authorize_url
            .query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("response_type", "code")
            .append_pair("scope", &self.settings.scope)
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        tracing::info!(authority = %self.settings.authority, "redirecting to identity provider");
        self.navigator.navigate(&authorize_url)
    }

    async fn complete_login_callback(
        &self,
        callback_url: &Url,
    ) -> Result<CallbackOutcome, AuthError> {
        let params: HashMap<String, String> = callback_url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        if let Some(error) = params.get("error") {
            if let Some(state) = params.get("state") {
                self.storage.remove(&pending_key(state))?;
            }
            return Err(CallbackError::ProviderError {
                error: error.clone(),
                description: params.get("error_description").cloned(),
            }
            .into());
        }

        let state = params
            .get("state")
            .filter(|value| !value.is_empty())
            .ok_or(CallbackError::MissingState)?;
        let code = params
            .get("code")
            .filter(|value| !value.is_empty())
            .ok_or(CallbackError::MissingCode)?;
        let flow = self
            .take_pending_flow(state)?
            .ok_or_else(|| CallbackError::UnknownState(state.clone()))?;

        let exchange = self
            .request_tokens(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", flow.redirect_uri.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("code_verifier", flow.code_verifier.as_str()),
            ])
            .await?;
        let tokens = exchange.map_err(|rejected| CallbackError::ExchangeRejected {
            status: rejected.status.as_u16(),
            error: rejected.error,
        })?;

        if let Some(id_token) = tokens.id_token.as_deref() {
            let claims = decode_jwt_claims(id_token)?;
            if let Some(nonce) = claims.get("nonce").and_then(|value| value.as_str()) {
                if nonce != flow.nonce {
                    return Err(CallbackError::NonceMismatch.into());
                }
            }
        }

        let profile = self
            .fetch_profile(&tokens.access_token, tokens.id_token.as_deref())
            .await?;
        let user = tokens.into_user(profile, None);
        self.store_user(&user)?;

        let return_to = resolve_post_login_target(
            callback_url,
            flow.return_url.as_deref(),
            &self.settings.app_origin,
            &self.settings.default_route,
        );
        tracing::info!(subject = %user.profile.sub, return_to = %return_to, "login callback completed");
        Ok(CallbackOutcome { user, return_to })
    }

    async fn try_silent_renewal(&self) -> Result<Option<ProviderUser>, AuthError> {
        let observed_epoch = self.renewal_epoch.load(Ordering::SeqCst);
        let _gate = self.renewal_gate.lock().await;
        if self.renewal_epoch.load(Ordering::SeqCst) != observed_epoch {
            tracing::debug!("joining renewal that completed while waiting");
            return Ok(self
                .last_renewal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone());
        }

        let result = self.renew_with_refresh_token().await;
        *self
            .last_renewal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            result.as_ref().ok().cloned().flatten();
        self.renewal_epoch.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let user = self.load_user()?;
        self.forget_user().await?;
        let metadata = self.metadata().await?;
        let target = match &metadata.end_session_endpoint {
            Some(endpoint) => {
                let mut url = endpoint.clone();
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(id_token) = user.as_ref().and_then(|u| u.id_token.as_deref()) {
                        query.append_pair("id_token_hint", id_token);
                    }
                    query
                        .append_pair("client_id", &self.settings.client_id)
                        .append_pair(
                            "post_logout_redirect_uri",
                            self.settings.post_logout_redirect_uri.as_str(),
                        );
                }
                url
            }
            None => {
                tracing::warn!("provider has no end_session_endpoint; returning to app");
                self.settings.post_logout_redirect_uri.clone()
            }
        };
        tracing::info!("signing out at identity provider");
        self.navigator.navigate(&target)
    }

    async fn get_current_user(&self) -> Result<Option<ProviderUser>, AuthError> {
        let user = self.load_user()?;
        if let Some(user) = &user {
            self.arm_expiry_timer(user);
        }
        Ok(user)
    }

    async fn forget_user(&self) -> Result<(), AuthError> {
        self.cancel_expiry_timer();
        self.storage.remove(&self.user_key())?;
        Ok(())
    }

    fn subscribe_expiring(&self) -> broadcast::Receiver<AccessTokenExpiring> {
        self.expiring_tx.subscribe()
    }
}

impl OidcClient {
    async fn renew_with_refresh_token(&self) -> Result<Option<ProviderUser>, AuthError> {
        let Some(current) = self.load_user()? else {
            tracing::debug!("silent renewal skipped: no cached user");
            return Ok(None);
        };
        let Some(refresh_token) = current.refresh_token.clone().filter(|t| !t.is_empty()) else {
            tracing::debug!("silent renewal skipped: no refresh token");
            return Ok(None);
        };

        let exchange = self
            .request_tokens(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("scope", self.settings.scope.as_str()),
            ])
            .await?;
        match exchange {
            Ok(tokens) => {
                let user = tokens.into_user(current.profile.clone(), Some(&current));
                self.store_user(&user)?;
                tracing::info!(expires_at = ?user.expires_at, "access token renewed");
                Ok(Some(user))
            }
            Err(rejected) if rejected.status.is_client_error() => {
                tracing::warn!(
                    status = %rejected.status,
                    error = rejected.error.as_deref().unwrap_or("unknown"),
                    "silent renewal rejected"
                );
                Ok(None)
            }
            Err(rejected) => Err(AuthError::InvalidResponse(format!(
                "token endpoint failed with status {}",
                rejected.status
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// Build the cached user; values missing from a refresh response are
    /// carried over from `previous`.
    fn into_user(self, profile: UserProfile, previous: Option<&ProviderUser>) -> ProviderUser {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        ProviderUser {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            id_token: self
                .id_token
                .or_else(|| previous.and_then(|p| p.id_token.clone())),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: self
                .scope
                .or_else(|| previous.and_then(|p| p.scope.clone())),
            expires_at,
            profile,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(skip, default = "default_error_status")]
    status: StatusCode,
}

impl Default for TokenErrorResponse {
    fn default() -> Self {
        Self {
            error: None,
            status: default_error_status(),
        }
    }
}

fn default_error_status() -> StatusCode {
    StatusCode::BAD_REQUEST
}

fn pending_key(state: &str) -> String {
    format!("{PENDING_PREFIX}{state}")
}

/// Payload claims of a compact JWT. The signature is not verified.
fn decode_jwt_claims(token: &str) -> Result<serde_json::Value, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::InvalidResponse("ID token is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| AuthError::InvalidResponse(format!("ID token payload: {err}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}
