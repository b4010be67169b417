//! Startup configuration (layered: code > env > TOML file).
//!
//! Every required setting is validated before any service is constructed.
//! A bad value is a [`ConfigError`] and the process is expected to stop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::{Origin, Url};

const ENV_PREFIX: &str = "DASHLINK_";
const DEFAULT_SCOPE: &str = "openid profile email offline_access";
const DEFAULT_ROUTE: &str = "/";
const DEFAULT_LOGIN_PATH: &str = "/auth/login";
const DEFAULT_EXPIRING_LEAD_SECS: u64 = 60;

/// Fatal configuration problems detected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("{field} is not a valid URL ({value}): {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("{field} uses unsupported scheme {scheme}")]
    UnsupportedScheme { field: &'static str, scheme: String },
    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config file: {0}")]
    Parse(String),
}

/// Validated application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: Url,
    pub push_base_url: Url,
    pub authority: Url,
    pub client_id: String,
    pub post_login_redirect_uri: Url,
    pub post_logout_redirect_uri: Url,
    pub scope: String,
    pub storage_dir: PathBuf,
    pub default_route: String,
    pub login_path: String,
    pub expiring_notification_lead: Duration,
}

/// Unvalidated settings as read from a file or the environment.
///
/// Field names match the TOML keys; environment variables are the upper-cased
/// names with a `DASHLINK_` prefix (see [`RawConfig::ENV_KEYS`]).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub api_base_url: Option<String>,
    pub push_base_url: Option<String>,
    pub oidc_authority: Option<String>,
    pub oidc_client_id: Option<String>,
    pub oidc_redirect_uri: Option<String>,
    pub oidc_post_logout_redirect_uri: Option<String>,
    pub oidc_scope: Option<String>,
    pub storage_dir: Option<String>,
    pub default_route: Option<String>,
    pub login_path: Option<String>,
    pub expiring_lead_secs: Option<u64>,
}

impl RawConfig {
    /// Environment variable suffixes, in field order.
    pub const ENV_KEYS: [&'static str; 11] = [
        "API_BASE_URL",
        "PUSH_BASE_URL",
        "OIDC_AUTHORITY",
        "OIDC_CLIENT_ID",
        "OIDC_REDIRECT_URI",
        "OIDC_POST_LOGOUT_REDIRECT_URI",
        "OIDC_SCOPE",
        "STORAGE_DIR",
        "DEFAULT_ROUTE",
        "LOGIN_PATH",
        "EXPIRING_LEAD_SECS",
    ];

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Read settings through `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|value| !value.trim().is_empty())
        };
        let expiring_lead_secs = match get("EXPIRING_LEAD_SECS") {
            Some(value) => Some(value.trim().parse::<u64>().map_err(|err| {
                ConfigError::Invalid {
                    field: "DASHLINK_EXPIRING_LEAD_SECS",
                    reason: err.to_string(),
                }
            })?),
            None => None,
        };
        Ok(Self {
            api_base_url: get("API_BASE_URL"),
            push_base_url: get("PUSH_BASE_URL"),
            oidc_authority: get("OIDC_AUTHORITY"),
            oidc_client_id: get("OIDC_CLIENT_ID"),
            oidc_redirect_uri: get("OIDC_REDIRECT_URI"),
            oidc_post_logout_redirect_uri: get("OIDC_POST_LOGOUT_REDIRECT_URI"),
            oidc_scope: get("OIDC_SCOPE"),
            storage_dir: get("STORAGE_DIR"),
            default_route: get("DEFAULT_ROUTE"),
            login_path: get("LOGIN_PATH"),
            expiring_lead_secs,
        })
    }

    /// Overlay `other` on top of `self`; values present in `other` win.
    pub fn merge(self, other: RawConfig) -> RawConfig {
        RawConfig {
            api_base_url: other.api_base_url.or(self.api_base_url),
            push_base_url: other.push_base_url.or(self.push_base_url),
            oidc_authority: other.oidc_authority.or(self.oidc_authority),
            oidc_client_id: other.oidc_client_id.or(self.oidc_client_id),
            oidc_redirect_uri: other.oidc_redirect_uri.or(self.oidc_redirect_uri),
            oidc_post_logout_redirect_uri: other
                .oidc_post_logout_redirect_uri
                .or(self.oidc_post_logout_redirect_uri),
            oidc_scope: other.oidc_scope.or(self.oidc_scope),
            storage_dir: other.storage_dir.or(self.storage_dir),
            default_route: other.default_route.or(self.default_route),
            login_path: other.login_path.or(self.login_path),
            expiring_lead_secs: other.expiring_lead_secs.or(self.expiring_lead_secs),
        }
    }

    pub fn validate(self) -> Result<AppConfig, ConfigError> {
        let api_base_url = parse_url(
            "DASHLINK_API_BASE_URL",
            self.api_base_url,
            &["http", "https"],
        )?;
        let push_base_url = parse_url(
            "DASHLINK_PUSH_BASE_URL",
            self.push_base_url,
            &["ws", "wss", "http", "https"],
        )?;
        let authority = parse_url(
            "DASHLINK_OIDC_AUTHORITY",
            self.oidc_authority,
            &["http", "https"],
        )?;
        let client_id = self
            .oidc_client_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::Missing("DASHLINK_OIDC_CLIENT_ID"))?;
        let post_login_redirect_uri = parse_url(
            "DASHLINK_OIDC_REDIRECT_URI",
            self.oidc_redirect_uri,
            &["http", "https"],
        )?;
        let post_logout_redirect_uri = parse_url(
            "DASHLINK_OIDC_POST_LOGOUT_REDIRECT_URI",
            self.oidc_post_logout_redirect_uri,
            &["http", "https"],
        )?;

        let default_route = self
            .default_route
            .unwrap_or_else(|| DEFAULT_ROUTE.to_string());
        require_path("DASHLINK_DEFAULT_ROUTE", &default_route)?;
        let login_path = self
            .login_path
            .unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string());
        require_path("DASHLINK_LOGIN_PATH", &login_path)?;

        Ok(AppConfig {
            api_base_url,
            push_base_url,
            authority,
            client_id,
            post_login_redirect_uri,
            post_logout_redirect_uri,
            scope: self.oidc_scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            storage_dir: self
                .storage_dir
                .map(PathBuf::from)
                .unwrap_or_else(default_storage_dir),
            default_route,
            login_path,
            expiring_notification_lead: Duration::from_secs(
                self.expiring_lead_secs.unwrap_or(DEFAULT_EXPIRING_LEAD_SECS),
            ),
        })
    }
}

impl AppConfig {
    /// Load from the process environment (after reading `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        RawConfig::from_lookup(|key| std::env::var(key).ok())?.validate()
    }

    /// Load a TOML file, then let environment variables override it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let base = match path {
            Some(path) => RawConfig::from_file(path)?,
            None => RawConfig::default(),
        };
        let env = RawConfig::from_lookup(|key| std::env::var(key).ok())?;
        base.merge(env).validate()
    }

    /// Origin of the running application, taken from the post-login redirect URI.
    pub fn app_origin(&self) -> Origin {
        self.post_login_redirect_uri.origin()
    }

    /// Build a realtime endpoint URL below the push base, upgrading http(s) to ws(s).
    pub fn push_url(&self, path: &str) -> Result<Url, ConfigError> {
        let mut url = join_path(&self.push_base_url, path).map_err(|reason| {
            ConfigError::InvalidUrl {
                field: "push path",
                value: path.to_string(),
                reason,
            }
        })?;
        let upgraded = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = upgraded {
            // http -> ws is always a permitted scheme change for special schemes
            let _ = url.set_scheme(scheme);
        }
        Ok(url)
    }
}

/// Join `path` onto `base`, keeping any path prefix the base already carries.
pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url, String> {
    let mut prefix = base.as_str().to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    let base = Url::parse(&prefix).map_err(|err| err.to_string())?;
    base.join(path.trim_start_matches('/'))
        .map_err(|err| err.to_string())
}

fn parse_url(
    field: &'static str,
    value: Option<String>,
    schemes: &[&str],
) -> Result<Url, ConfigError> {
    let value = value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(field))?;
    let url = Url::parse(&value).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: value.clone(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            field,
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value,
            reason: "URL has no host".into(),
        });
    }
    Ok(url)
}

fn require_path(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with('/') && !value.starts_with("//") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} must be an absolute path"),
        })
    }
}

fn default_storage_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".dashlink"))
        .unwrap_or_else(|| PathBuf::from(".dashlink"))
}
