//! Request pipeline: the shared API client.
//!
//! Every request picks up the current bearer token from the [`TokenStore`].
//! A `401` on anything but the login endpoint clears the stored token and is
//! returned to the caller; renewal and redirects are the session manager's job.

use std::sync::Arc;

use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::auth::TokenStore;
use crate::config::{join_path, AppConfig};
use crate::error::{DashError, Result};

/// HTTP client bound to the API base URL.
///
/// # Example
/// ```no_run
/// # use dashlink::http::ApiClient;
/// # async fn demo(api: ApiClient) -> dashlink::error::Result<()> {
/// let projects: serde_json::Value = api.get_json("/projects").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
    token_store: Arc<TokenStore>,
    login_path: String,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("login_path", &self.login_path)
            .finish()
    }
}

impl ApiClient {
    pub fn new(base_url: Url, token_store: Arc<TokenStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .user_agent(concat!("dashlink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token_store,
            login_path: "/auth/login".to_string(),
        })
    }

    pub fn from_config(config: &AppConfig, token_store: Arc<TokenStore>) -> Result<Self> {
        Ok(Self::new(config.api_base_url.clone(), token_store)?
            .with_login_path(config.login_path.clone()))
    }

    /// Path (relative to the base URL) whose `401` is a plain login failure.
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        join_path(&self.base_url, path)
            .map_err(|reason| DashError::InvalidArgument(format!("bad API path {path}: {reason}")))
    }

    /// Start a request against `path`; finish it with [`send`](Self::send).
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.url(path)?;
        Ok(self
            .client
            .request(method, url)
            .header(ACCEPT, HeaderValue::from_static("application/json")))
    }

    /// Send a request through the credential and rejection handling.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let mut request = builder.build()?;
        if let Some(token) = self.token_store.read() {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("stored token is not a valid header value; sending unauthenticated"),
            }
        }

        let path = request.url().path().to_string();
        let is_login = self.is_login_path(request.url());
        let method = request.method().clone();

        let resp = self.client.execute(request).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::UNAUTHORIZED && !is_login {
            tracing::warn!(%method, %path, "request rejected as unauthorized; clearing token");
            if let Err(error) = self.token_store.clear() {
                tracing::warn!(%error, "failed to clear persisted token");
            }
            return Err(DashError::Unauthorized { path });
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(%method, %path, status = status.as_u16(), "API request failed");
        Err(status_to_error(status.as_u16(), &body))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send(self.request(Method::GET, path)?).await?;
        Ok(resp.json().await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .send(self.request(Method::POST, path)?.json(body))
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .send(self.request(Method::PUT, path)?.json(body))
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path)?).await?;
        Ok(())
    }

    fn is_login_path(&self, url: &Url) -> bool {
        match self.url(&self.login_path) {
            Ok(login) => login.path().trim_end_matches('/') == url.path().trim_end_matches('/'),
            Err(_) => false,
        }
    }
}

/// Map a non-success status and body to an error.
pub fn status_to_error(status: u16, body: &str) -> DashError {
    DashError::api(status, extract_message(body).unwrap_or_else(|| body.to_string()))
}

fn extract_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    ["detail", "message", "error"].iter().find_map(|key| {
        value.get(*key).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn client(base: &str) -> ApiClient {
        let store = Arc::new(TokenStore::new(Arc::new(MemoryKeyValueStore::new())));
        ApiClient::new(Url::parse(base).unwrap(), store).unwrap()
    }

    #[test]
    fn url_keeps_base_path_prefix() {
        let api = client("https://api.example/v1");
        assert_eq!(
            api.url("/projects/3").unwrap().as_str(),
            "https://api.example/v1/projects/3"
        );
    }

    #[test]
    fn login_path_detection_ignores_trailing_slash() {
        let api = client("https://api.example/v1").with_login_path("/auth/login");
        let login = Url::parse("https://api.example/v1/auth/login/").unwrap();
        let other = Url::parse("https://api.example/v1/projects").unwrap();
        assert!(api.is_login_path(&login));
        assert!(!api.is_login_path(&other));
    }

    #[test]
    fn status_to_error_prefers_detail_field() {
        let err = status_to_error(422, r#"{"detail":"block name taken"}"#);
        match err {
            DashError::Api { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "block name taken");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn status_to_error_falls_back_to_raw_body() {
        let err = status_to_error(500, "upstream exploded");
        assert!(matches!(err, DashError::Api { status: 500, ref message } if message == "upstream exploded"));
    }
}
