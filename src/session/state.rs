use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::auth::ProviderUser;

/// Lifecycle phase of the user's authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SessionPhase {
    Unauthenticated,
    Restoring,
    Authenticated,
    Renewing,
    /// Forced re-login: a redirect to the provider has been issued and
    /// nothing else happens in this process.
    LoginRedirect,
}

/// Who is signed in.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub subject: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Every claim the provider returned, untouched.
    pub claims: Value,
}

/// The authenticated identity owned by the session manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub principal: Principal,
    pub access_token: String,
    pub access_token_expiry: DateTime<Utc>,
    pub refresh_capability: bool,
}

impl Session {
    /// Build a session from a provider user, or `None` if the user lacks a
    /// usable token, expiry, or subject.
    pub fn from_user(user: &ProviderUser) -> Option<Self> {
        let expiry = user.expires_at?;
        if user.access_token.is_empty() || user.profile.sub.is_empty() || expiry <= Utc::now() {
            return None;
        }
        let claims = serde_json::to_value(&user.profile).unwrap_or(Value::Null);
        Some(Self {
            principal: Principal {
                subject: user.profile.sub.clone(),
                name: user
                    .profile
                    .name
                    .clone()
                    .or_else(|| user.profile.preferred_username.clone()),
                email: user.profile.email.clone(),
                claims,
            },
            access_token: user.access_token.clone(),
            access_token_expiry: expiry,
            refresh_capability: user.can_refresh(),
        })
    }

    pub fn expiry_millis(&self) -> i64 {
        self.access_token_expiry.timestamp_millis()
    }
}

/// What consumers observe. Rendering code only needs [`is_ready`](Self::is_ready).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session: Option<Session>,
}

impl SessionSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            session: None,
        }
    }

    /// False while restoring or whenever no principal exists.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Authenticated | SessionPhase::Renewing
        ) && self.session.is_some()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.session.as_ref().map(|session| &session.principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn user(expires_in_secs: i64) -> ProviderUser {
        serde_json::from_value(json!({
            "access_token": "tok",
            "refresh_token": "ref",
            "expires_at": Utc::now() + Duration::seconds(expires_in_secs),
            "profile": { "sub": "u-1", "preferred_username": "ada", "team": "etl" }
        }))
        .unwrap()
    }

    #[test]
    fn session_from_valid_user() {
        let session = Session::from_user(&user(300)).unwrap();
        assert_eq!(session.principal.subject, "u-1");
        assert_eq!(session.principal.name.as_deref(), Some("ada"));
        assert_eq!(session.principal.claims["team"], "etl");
        assert!(session.refresh_capability);
    }

    #[test]
    fn expired_user_is_not_a_session() {
        assert!(Session::from_user(&user(-5)).is_none());
    }

    #[test]
    fn user_without_expiry_is_not_a_session() {
        let mut u = user(300);
        u.expires_at = None;
        assert!(Session::from_user(&u).is_none());
    }

    #[test]
    fn snapshot_readiness_requires_principal() {
        let mut snapshot = SessionSnapshot::initial();
        assert!(!snapshot.is_ready());
        snapshot.phase = SessionPhase::Restoring;
        assert!(!snapshot.is_ready());
        snapshot.phase = SessionPhase::Authenticated;
        assert!(!snapshot.is_ready());
        snapshot.session = Session::from_user(&user(300));
        assert!(snapshot.is_ready());
    }

    #[test]
    fn phase_names_are_snake_case() {
        assert_eq!(SessionPhase::LoginRedirect.to_string(), "login_redirect");
        assert_eq!(
            "renewing".parse::<SessionPhase>().unwrap(),
            SessionPhase::Renewing
        );
    }
}
