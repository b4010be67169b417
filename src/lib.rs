//! Dashlink: authenticated session and realtime connectivity for the
//! pipeline dashboard client.
//!
//! The crate signs the user in through an OpenID Connect provider, keeps the
//! access token fresh, attaches it to every API request, and shares one
//! push connection per realtime endpoint between all consumers.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dashlink::prelude::*;
//!
//! struct OpenInBrowser;
//! impl Navigator for OpenInBrowser {
//!     fn navigate(&self, target: &url::Url) -> std::result::Result<(), AuthError> {
//!         println!("continue at {target}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> dashlink::error::Result<()> {
//! let app = Dashlink::from_config(AppConfig::from_env()?, Arc::new(OpenInBrowser))?;
//! if app.session().start("https://app.example/").await == SessionPhase::Authenticated {
//!     let me: serde_json::Value = app.api().get_json("/me").await?;
//!     println!("{me}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod prelude;
pub mod session;
pub mod storage;

#[cfg(feature = "realtime")]
pub mod realtime;

#[cfg(feature = "cli")]
pub mod cli;

pub use app::Dashlink;
