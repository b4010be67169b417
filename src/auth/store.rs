use std::sync::Arc;

use chrono::Utc;

use super::error::AuthError;
use super::token::PersistedToken;
use crate::storage::KeyValueStore;

/// Fixed storage key holding the current access credential.
pub const ACCESS_TOKEN_KEY: &str = "dashlink.access_token";

/// Persisted slot for the current access token and its expiry.
///
/// Pure data access: the store never renews or redirects. Reads fail closed,
/// so a corrupt, incomplete or expired entry reads as absent and is removed.
/// Last writer wins; nothing coordinates concurrent processes.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use dashlink::auth::TokenStore;
/// use dashlink::storage::MemoryKeyValueStore;
///
/// let store = TokenStore::new(Arc::new(MemoryKeyValueStore::new()));
/// let expiry = chrono::Utc::now().timestamp_millis() + 60_000;
/// store.save("access", expiry)?;
/// assert_eq!(store.read().as_deref(), Some("access"));
/// store.clear()?;
/// assert!(store.read().is_none());
/// # Ok::<(), dashlink::auth::AuthError>(())
/// ```
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn KeyValueStore>,
    key: String,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").field("key", &self.key).finish()
    }
}

impl TokenStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            key: ACCESS_TOKEN_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn save(&self, token: &str, expiry_epoch_millis: i64) -> Result<(), AuthError> {
        let entry = PersistedToken::new(token, expiry_epoch_millis);
        let serialized = serde_json::to_string(&entry)?;
        self.storage.set(&self.key, &serialized)?;
        Ok(())
    }

    /// Current token, or `None` if nothing valid is stored.
    pub fn read(&self) -> Option<String> {
        self.read_entry().map(|entry| entry.token)
    }

    /// Like [`read`](Self::read) but returns the whole entry.
    pub fn read_entry(&self) -> Option<PersistedToken> {
        let raw = match self.storage.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "token storage unreadable");
                return None;
            }
        };
        let entry = match serde_json::from_str::<PersistedToken>(&raw) {
            Ok(entry) if !entry.token.is_empty() => entry,
            Ok(_) => {
                tracing::debug!(key = %self.key, "discarding empty persisted token");
                self.discard();
                return None;
            }
            Err(error) => {
                tracing::debug!(key = %self.key, %error, "discarding malformed persisted token");
                self.discard();
                return None;
            }
        };
        if entry.is_expired_at(Utc::now().timestamp_millis()) {
            tracing::debug!(key = %self.key, expiry = entry.expiry, "discarding expired token");
            self.discard();
            return None;
        }
        Some(entry)
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        self.storage.remove(&self.key)?;
        Ok(())
    }

    fn discard(&self) {
        if let Err(error) = self.clear() {
            tracing::warn!(key = %self.key, %error, "failed to clear persisted token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn memory_store() -> (Arc<MemoryKeyValueStore>, TokenStore) {
        let storage = Arc::new(MemoryKeyValueStore::new());
        let store = TokenStore::new(storage.clone());
        (storage, store)
    }

    fn in_one_hour() -> i64 {
        Utc::now().timestamp_millis() + 3_600_000
    }

    #[test]
    fn save_writes_token_and_expiry_json() {
        let (storage, store) = memory_store();
        store.save("abc", 42_000).unwrap();
        let raw = storage.get(ACCESS_TOKEN_KEY).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["token"], "abc");
        assert_eq!(json["expiry"], 42_000);
    }

    #[test]
    fn valid_token_is_returned() {
        let (_storage, store) = memory_store();
        store.save("fresh", in_one_hour()).unwrap();
        assert_eq!(store.read().as_deref(), Some("fresh"));
    }

    #[test]
    fn malformed_entry_reads_absent_and_is_removed() {
        let (storage, store) = memory_store();
        storage.set(ACCESS_TOKEN_KEY, "{not json").unwrap();
        assert!(store.read().is_none());
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    }

    #[test]
    fn entry_missing_expiry_reads_absent() {
        let (storage, store) = memory_store();
        storage
            .set(ACCESS_TOKEN_KEY, r#"{"token":"no-expiry"}"#)
            .unwrap();
        assert!(store.read().is_none());
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    }

    #[test]
    fn double_clear_is_fine() {
        let (_storage, store) = memory_store();
        store.clear().unwrap();
        store.clear().unwrap();
    }

    #[test]
    fn custom_key_is_respected() {
        let (storage, store) = memory_store();
        let store = store.with_key("other.slot");
        store.save("x", in_one_hour()).unwrap();
        assert!(storage.get("other.slot").unwrap().is_some());
        assert!(storage.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    }
}
