//! Convenience re-exports for common use.

pub use crate::app::Dashlink;
pub use crate::auth::{AuthError, CallbackError, IdentityProvider, Navigator, TokenStore};
pub use crate::config::AppConfig;
pub use crate::error::{DashError, Result};
pub use crate::http::ApiClient;
pub use crate::session::{Principal, Session, SessionManager, SessionPhase, SessionSnapshot};
pub use crate::storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};

#[cfg(feature = "realtime")]
pub use crate::realtime::{Connection, ConnectionManager, ReconnectPolicy};
