use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Access credential as written to durable storage.
///
/// Serialized as `{ "token": "...", "expiry": <epoch millis> }`.
///
/// # Example
/// ```
/// use dashlink::auth::PersistedToken;
///
/// let entry = PersistedToken::new("access", 1_700_000_000_000);
/// assert!(entry.is_expired_at(1_700_000_000_000));
/// assert!(!entry.is_expired_at(1_699_999_999_999));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedToken {
    pub token: String,
    pub expiry: i64,
}

impl PersistedToken {
    pub fn new(token: impl Into<String>, expiry: i64) -> Self {
        Self {
            token: token.into(),
            expiry,
        }
    }

    /// An entry whose expiry is at or before `now_millis` is unusable.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis >= self.expiry
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expiry).single()
    }
}
