#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashlink::auth::{
    AccessTokenExpiring, AuthError, CallbackError, CallbackOutcome, IdentityProvider, Navigator,
    OidcClient, OidcSettings, ProviderMetadata, ProviderUser, UserProfile,
};
use dashlink::storage::{KeyValueStore, MemoryKeyValueStore, StorageError};
use serde_json::{json, Map};
use tokio::sync::broadcast;
use url::Url;

/// Memory storage that counts removals per key.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryKeyValueStore,
    removals: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn removals(&self, key: &str) -> usize {
        self.removals
            .lock()
            .expect("removals lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner.get(key).expect("memory store never fails")
    }

    /// Place `user` in the client's cached-user slot.
    pub fn seed_user(&self, client: &OidcClient, user: &ProviderUser) {
        let settings = client.settings();
        let key = format!(
            "oidc.user:{}:{}",
            settings.authority.as_str().trim_end_matches('/'),
            settings.client_id
        );
        let raw = serde_json::to_string(user).expect("user serializes");
        self.inner.set(&key, &raw).expect("memory store never fails");
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .keys_with_prefix(prefix)
            .expect("memory store never fails")
    }
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        *self
            .removals
            .lock()
            .expect("removals lock poisoned")
            .entry(key.to_string())
            .or_default() += 1;
        self.inner.remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.keys_with_prefix(prefix)
    }
}

/// Navigator that records every redirect instead of leaving the process.
#[derive(Default)]
pub struct RecordingNavigator {
    visited: Mutex<Vec<Url>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visited(&self) -> Vec<Url> {
        self.visited.lock().expect("navigator lock poisoned").clone()
    }

    pub fn last(&self) -> Option<Url> {
        self.visited().last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, target: &Url) -> Result<(), AuthError> {
        self.visited
            .lock()
            .expect("navigator lock poisoned")
            .push(target.clone());
        Ok(())
    }
}

/// How the scripted provider answers a renewal request.
#[derive(Clone)]
pub enum RenewalScript {
    Renewed(ProviderUser),
    NotPossible,
    Fails,
}

/// Identity provider whose answers are set by the test.
pub struct ScriptedProvider {
    pub current_user: Mutex<Option<ProviderUser>>,
    pub renewal: Mutex<RenewalScript>,
    pub callback: Mutex<Option<Result<CallbackOutcome, CallbackError>>>,
    pub renewal_delay: Mutex<Duration>,
    pub callback_delay: Mutex<Duration>,
    pub login_calls: AtomicUsize,
    pub login_return_urls: Mutex<Vec<Option<String>>>,
    pub renewal_calls: AtomicUsize,
    pub forget_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
    expiring_tx: broadcast::Sender<AccessTokenExpiring>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        let (expiring_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            current_user: Mutex::new(None),
            renewal: Mutex::new(RenewalScript::NotPossible),
            callback: Mutex::new(None),
            renewal_delay: Mutex::new(Duration::ZERO),
            callback_delay: Mutex::new(Duration::ZERO),
            login_calls: AtomicUsize::new(0),
            login_return_urls: Mutex::new(Vec::new()),
            renewal_calls: AtomicUsize::new(0),
            forget_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            expiring_tx,
        })
    }

    pub fn with_user(self: Arc<Self>, user: ProviderUser) -> Arc<Self> {
        *self.current_user.lock().expect("lock") = Some(user);
        self
    }

    pub fn set_renewal(&self, script: RenewalScript) {
        *self.renewal.lock().expect("lock") = script;
    }

    pub fn set_callback(&self, result: Result<CallbackOutcome, CallbackError>) {
        *self.callback.lock().expect("lock") = Some(result);
    }

    pub fn set_renewal_delay(&self, delay: Duration) {
        *self.renewal_delay.lock().expect("lock") = delay;
    }

    pub fn set_callback_delay(&self, delay: Duration) {
        *self.callback_delay.lock().expect("lock") = delay;
    }

    /// Fire the "access token expiring" notification.
    pub fn fire_expiring(&self) {
        let _ = self.expiring_tx.send(AccessTokenExpiring {
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        });
    }

    pub fn logins(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewal_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn initiate_login(&self, return_url: Option<&str>) -> Result<(), AuthError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.login_return_urls
            .lock()
            .expect("lock")
            .push(return_url.map(str::to_string));
        Ok(())
    }

    async fn complete_login_callback(
        &self,
        _callback_url: &Url,
    ) -> Result<CallbackOutcome, AuthError> {
        let delay = *self.callback_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.callback.lock().expect("lock").clone();
        match scripted {
            Some(Ok(outcome)) => {
                *self.current_user.lock().expect("lock") = Some(outcome.user.clone());
                Ok(outcome)
            }
            Some(Err(error)) => Err(error.into()),
            None => Err(CallbackError::MissingState.into()),
        }
    }

    async fn try_silent_renewal(&self) -> Result<Option<ProviderUser>, AuthError> {
        self.renewal_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.renewal_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let script = self.renewal.lock().expect("lock").clone();
        match script {
            RenewalScript::Renewed(user) => {
                *self.current_user.lock().expect("lock") = Some(user.clone());
                Ok(Some(user))
            }
            RenewalScript::NotPossible => Ok(None),
            RenewalScript::Fails => Err(AuthError::Network("token endpoint unreachable".into())),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        *self.current_user.lock().expect("lock") = None;
        Ok(())
    }

    async fn get_current_user(&self) -> Result<Option<ProviderUser>, AuthError> {
        Ok(self.current_user.lock().expect("lock").clone())
    }

    async fn forget_user(&self) -> Result<(), AuthError> {
        self.forget_calls.fetch_add(1, Ordering::SeqCst);
        *self.current_user.lock().expect("lock") = None;
        Ok(())
    }

    fn subscribe_expiring(&self) -> broadcast::Receiver<AccessTokenExpiring> {
        self.expiring_tx.subscribe()
    }
}

pub fn profile(sub: &str) -> UserProfile {
    UserProfile {
        sub: sub.to_string(),
        name: Some("Ada Lovelace".to_string()),
        email: Some("ada@example.com".to_string()),
        preferred_username: Some("ada".to_string()),
        extra: Map::new(),
    }
}

pub fn user(access_token: &str, expires_in_secs: i64) -> ProviderUser {
    ProviderUser {
        access_token: access_token.to_string(),
        refresh_token: Some(format!("refresh-{access_token}")),
        id_token: None,
        token_type: "Bearer".to_string(),
        scope: Some("openid profile".to_string()),
        expires_at: Some(Utc::now() + chrono::Duration::seconds(expires_in_secs)),
        profile: profile("user-1"),
    }
}

pub fn settings(authority: &str) -> OidcSettings {
    let redirect_uri = Url::parse("https://app.example/auth/callback").expect("valid URL");
    OidcSettings {
        authority: Url::parse(authority).expect("valid authority"),
        client_id: "dashboard".to_string(),
        app_origin: redirect_uri.origin(),
        redirect_uri,
        post_logout_redirect_uri: Url::parse("https://app.example/").expect("valid URL"),
        scope: "openid profile email offline_access".to_string(),
        default_route: "/".to_string(),
        expiring_notification_lead: Duration::from_secs(60),
    }
}

pub fn metadata(server_uri: &str) -> ProviderMetadata {
    serde_json::from_value(json!({
        "authorization_endpoint": format!("{server_uri}/authorize"),
        "token_endpoint": format!("{server_uri}/token"),
        "userinfo_endpoint": format!("{server_uri}/userinfo"),
        "end_session_endpoint": format!("{server_uri}/logout"),
    }))
    .expect("metadata should deserialize")
}

pub fn storage() -> Arc<CountingStore> {
    Arc::new(CountingStore::new())
}

pub fn as_kv(store: &Arc<CountingStore>) -> Arc<dyn KeyValueStore> {
    store.clone()
}
