//! Identity provider client, token persistence, and login redirect handling.

pub mod error;
pub mod oidc;
pub mod pkce;
pub mod provider;
pub mod redirect;
pub mod store;
pub mod token;

pub use error::{AuthError, CallbackError};
pub use oidc::{OidcClient, OidcSettings, PendingFlow, ProviderMetadata};
pub use provider::{
    AccessTokenExpiring, CallbackOutcome, IdentityProvider, Navigator, ProviderUser, UserProfile,
};
pub use redirect::resolve_post_login_target;
pub use store::{TokenStore, ACCESS_TOKEN_KEY};
pub use token::PersistedToken;
