//! Composition root wiring every service exactly once.

use std::sync::Arc;

use crate::auth::{IdentityProvider, Navigator, OidcClient, OidcSettings, TokenStore};
use crate::config::AppConfig;
use crate::error::Result;
use crate::http::ApiClient;
use crate::session::SessionManager;
use crate::storage::{FileKeyValueStore, KeyValueStore};

#[cfg(feature = "realtime")]
use crate::realtime::{ConnectionManager, ReconnectPolicy};

/// Owns the shared services of one running dashboard client.
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use dashlink::{Dashlink, config::AppConfig, auth::Navigator};
/// # async fn demo(navigator: Arc<dyn Navigator>) -> dashlink::error::Result<()> {
/// let config = AppConfig::from_env()?;
/// let app = Dashlink::from_config(config, navigator)?;
/// app.session().start("https://app.example/").await;
/// let runs: serde_json::Value = app.api().get_json("/runs").await?;
/// app.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Dashlink {
    config: AppConfig,
    storage: Arc<dyn KeyValueStore>,
    token_store: Arc<TokenStore>,
    identity: Arc<OidcClient>,
    session: Arc<SessionManager>,
    api: ApiClient,
    #[cfg(feature = "realtime")]
    realtime: Arc<ConnectionManager>,
}

impl Dashlink {
    /// Build with file-backed storage under `config.storage_dir`.
    pub fn from_config(config: AppConfig, navigator: Arc<dyn Navigator>) -> Result<Self> {
        let storage: Arc<dyn KeyValueStore> =
            Arc::new(FileKeyValueStore::new(config.storage_dir.clone()));
        Self::with_storage(config, storage, navigator)
    }

    pub fn with_storage(
        config: AppConfig,
        storage: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        let token_store = Arc::new(TokenStore::new(storage.clone()));
        let identity = Arc::new(OidcClient::new(
            OidcSettings::from_config(&config),
            storage.clone(),
            navigator,
        ));
        let provider: Arc<dyn IdentityProvider> = identity.clone();
        let session = SessionManager::new(provider, token_store.clone());
        let api = ApiClient::from_config(&config, token_store.clone())?;

        tracing::debug!(
            api = %config.api_base_url,
            authority = %config.authority,
            storage = %config.storage_dir.display(),
            "dashlink services constructed"
        );

        Ok(Self {
            config,
            storage,
            token_store,
            identity,
            session,
            api,
            #[cfg(feature = "realtime")]
            realtime: Arc::new(ConnectionManager::new()),
        })
    }

    /// Replace the realtime reconnect policy. Only affects connections opened afterwards.
    #[cfg(feature = "realtime")]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.realtime = Arc::new(ConnectionManager::new().with_reconnect_policy(policy));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStore> {
        &self.storage
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    pub fn identity(&self) -> &Arc<OidcClient> {
        &self.identity
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    #[cfg(feature = "realtime")]
    pub fn realtime(&self) -> &Arc<ConnectionManager> {
        &self.realtime
    }

    /// Stop background work and close every realtime connection.
    pub async fn shutdown(&self) {
        self.session.shutdown();
        #[cfg(feature = "realtime")]
        self.realtime.close_all().await;
        tracing::debug!("dashlink shut down");
    }
}
