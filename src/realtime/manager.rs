use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use url::Url;

use super::connection::Connection;
use super::policy::ReconnectPolicy;
use super::RealtimeError;

/// Registry of push connections keyed by normalized URL.
///
/// # Example
/// ```no_run
/// # use dashlink::realtime::ConnectionManager;
/// # async fn demo() -> Result<(), dashlink::realtime::RealtimeError> {
/// let manager = ConnectionManager::new();
/// let feed = manager.get_connection("wss://push.example/runs")?;
/// let id = feed.add_listener(|message| println!("{message}"));
/// feed.remove_listener(id);
/// manager.release_if_idle("wss://push.example/runs").await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    policy: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy applied to connections created from now on.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Return the connection for `url`, opening it on first use.
    ///
    /// Every caller asking for the same URL gets the same connection.
    /// Must be called from within a Tokio runtime. The transport starts
    /// immediately; see [`Connection::set_error_handler`] for errors raised
    /// before a handler is attached.
    pub fn get_connection(&self, url: &str) -> Result<Arc<Connection>, RealtimeError> {
        let parsed = parse_push_url(url)?;
        let key = parsed.as_str().to_string();

        let mut connections = self.lock();
        if let Some(existing) = connections.get(&key) {
            return Ok(existing.clone());
        }
        let connection = Connection::open(parsed, self.policy)?;
        connections.insert(key, connection.clone());
        tracing::debug!(url, "realtime connection registered");
        Ok(connection)
    }

    pub fn contains(&self, url: &str) -> bool {
        match parse_push_url(url) {
            Ok(parsed) => self.lock().contains_key(parsed.as_str()),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close and evict the connection for `url`. Returns `false` if none existed.
    pub async fn remove_connection(&self, url: &str) -> bool {
        let Ok(parsed) = parse_push_url(url) else {
            return false;
        };
        let removed = self.lock().remove(parsed.as_str());
        match removed {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Close the connection for `url` only if nobody is listening anymore.
    pub async fn release_if_idle(&self, url: &str) -> bool {
        let Ok(parsed) = parse_push_url(url) else {
            return false;
        };
        let removed = {
            let mut connections = self.lock();
            match connections.get(parsed.as_str()) {
                Some(connection) if connection.listener_count() == 0 => {
                    connections.remove(parsed.as_str())
                }
                _ => None,
            }
        };
        match removed {
            Some(connection) => {
                tracing::debug!(url, "releasing idle realtime connection");
                connection.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = self.lock().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_push_url(url: &str) -> Result<Url, RealtimeError> {
    let parsed = Url::parse(url).map_err(|error| RealtimeError::InvalidUrl {
        url: url.to_string(),
        reason: error.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(RealtimeError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other}, expected ws or wss"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            parse_push_url("https://push.example/feed"),
            Err(RealtimeError::InvalidUrl { .. })
        ));
        assert!(parse_push_url("not a url").is_err());
    }

    #[test]
    fn equivalent_urls_share_a_key() {
        let a = parse_push_url("WSS://Push.Example/feed").unwrap();
        let b = parse_push_url("wss://push.example/feed").unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }

    #[tokio::test]
    async fn same_url_returns_same_connection() {
        let manager = ConnectionManager::new();
        let a = manager.get_connection("ws://127.0.0.1:9/feed").unwrap();
        let b = manager.get_connection("ws://127.0.0.1:9/feed").unwrap();
        let c = manager.get_connection("ws://127.0.0.1:9/other").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.len(), 2);
        manager.close_all().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn release_if_idle_keeps_busy_connections() {
        let manager = ConnectionManager::new();
        let feed = manager.get_connection("ws://127.0.0.1:9/feed").unwrap();
        let id = feed.add_listener(|_| {});
        assert!(!manager.release_if_idle("ws://127.0.0.1:9/feed").await);
        assert!(manager.contains("ws://127.0.0.1:9/feed"));

        feed.remove_listener(id);
        assert!(manager.release_if_idle("ws://127.0.0.1:9/feed").await);
        assert!(!manager.contains("ws://127.0.0.1:9/feed"));
    }

    #[test]
    fn get_connection_outside_runtime_is_an_error() {
        let manager = ConnectionManager::new();
        assert!(matches!(
            manager.get_connection("ws://127.0.0.1:9/feed"),
            Err(RealtimeError::Connect { .. })
        ));
        assert!(manager.is_empty());
    }
}
