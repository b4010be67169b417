//! Session manager: the state machine owning the user's authentication.
//!
//! ```text
//! Unauthenticated -> Restoring -> Authenticated -> Renewing -> Authenticated
//!                         \                           \
//!                          +-------> LoginRedirect <---+
//! Authenticated --logout()--> Unauthenticated
//! ```
//!
//! Provider failures never reach consumers as errors; they become
//! transitions. Consumers only see "no session yet" or "session present".

pub mod state;

pub use state::{Principal, Session, SessionPhase, SessionSnapshot};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::{AccessTokenExpiring, AuthError, IdentityProvider, TokenStore};

/// Owns the authentication lifecycle and publishes [`SessionSnapshot`]s.
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use dashlink::session::SessionManager;
/// # async fn demo(manager: Arc<SessionManager>) {
/// manager.start("https://app.example/projects").await;
/// let mut updates = manager.subscribe();
/// while updates.changed().await.is_ok() {
///     if updates.borrow().is_ready() {
///         break;
///     }
/// }
/// # }
/// ```
pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    token_store: Arc<TokenStore>,
    state_tx: watch::Sender<SessionSnapshot>,
    /// Bumped by every logout; in-flight provider calls started under an
    /// older generation are discarded.
    generation: AtomicU64,
    current_url: Mutex<Option<String>>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, token_store: Arc<TokenStore>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionSnapshot::initial());
        Arc::new(Self {
            provider,
            token_store,
            state_tx,
            generation: AtomicU64::new(0),
            current_url: Mutex::new(None),
            expiry_task: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_tx.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state_tx.borrow().phase
    }

    pub fn principal(&self) -> Option<Principal> {
        self.state_tx.borrow().principal().cloned()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state_tx
            .borrow()
            .session
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.state_tx.borrow().is_ready()
    }

    /// Restore a prior session on first mount.
    ///
    /// `current_url` is where the user should land again if a login
    /// redirect turns out to be necessary. Calling `start` outside
    /// `Unauthenticated` is a no-op.
    pub async fn start(self: &Arc<Self>, current_url: &str) -> SessionPhase {
        let mut generation = 0;
        let began = self.state_tx.send_if_modified(|snapshot| {
            if snapshot.phase != SessionPhase::Unauthenticated {
                return false;
            }
            generation = self.generation.load(Ordering::SeqCst);
            snapshot.phase = SessionPhase::Restoring;
            snapshot.session = None;
            true
        });
        if !began {
            return self.phase();
        }
        *self
            .current_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(current_url.to_string());
        tracing::info!(phase = %SessionPhase::Restoring, "restoring session");

        // Subscribe before loading so a timer armed by the load can't be missed.
        let expiring = self.provider.subscribe_expiring();
        let session = match self.provider.get_current_user().await {
            Ok(Some(user)) => Session::from_user(&user),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(%error, "session restore failed");
                None
            }
        };

        match session {
            Some(session) => {
                if self.establish(session, Some(SessionPhase::Restoring), generation) {
                    self.spawn_expiry_loop(expiring);
                }
            }
            None => {
                self.force_login("no restorable session", SessionPhase::Restoring, generation)
                    .await
            }
        }
        self.phase()
    }

    /// Finish a login on the callback route and return the route to show next.
    ///
    /// Callback failures are logged and returned; the state stays
    /// `Unauthenticated` and no redirect is issued. A logout while the
    /// callback is in flight wins and yields [`AuthError::SignedOut`].
    pub async fn complete_login(self: &Arc<Self>, callback_url: &Url) -> Result<String, AuthError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let expiring = self.provider.subscribe_expiring();
        let outcome = match self.provider.complete_login_callback(callback_url).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(%error, "login callback failed");
                return Err(error);
            }
        };
        let session = Session::from_user(&outcome.user).ok_or_else(|| {
            AuthError::InvalidResponse("provider returned an unusable session".into())
        })?;
        if !self.establish(session, None, generation) {
            tracing::info!("discarding login callback result after logout");
            return Err(AuthError::SignedOut);
        }
        self.spawn_expiry_loop(expiring);
        Ok(outcome.return_to)
    }

    /// React to the provider's "access token expiring" notification.
    ///
    /// Ignored unless currently `Authenticated`, so repeated notifications
    /// during a renewal collapse into one attempt. A logout while the
    /// renewal is in flight discards its result.
    pub async fn on_access_token_expiring(&self) {
        let mut generation = 0;
        let entered = self.state_tx.send_if_modified(|snapshot| {
            if snapshot.phase != SessionPhase::Authenticated {
                return false;
            }
            generation = self.generation.load(Ordering::SeqCst);
            snapshot.phase = SessionPhase::Renewing;
            true
        });
        if !entered {
            return;
        }
        tracing::info!(phase = %SessionPhase::Renewing, "renewing access token");

        let renewing = SessionPhase::Renewing;
        match self.provider.try_silent_renewal().await {
            Ok(Some(user)) => match Session::from_user(&user) {
                Some(session) => {
                    if !self.establish(session, Some(renewing), generation) {
                        tracing::info!("discarding renewed session after logout");
                    }
                }
                None => {
                    self.force_login("renewal returned an unusable session", renewing, generation)
                        .await
                }
            },
            Ok(None) => {
                self.force_login("silent renewal not possible", renewing, generation)
                    .await
            }
            Err(error) => {
                tracing::warn!(%error, "silent renewal failed");
                self.force_login("silent renewal failed", renewing, generation)
                    .await;
            }
        }
    }

    /// Sign out explicitly. Unlike a forced re-login, no login redirect follows.
    pub async fn logout(&self) -> Result<(), AuthError> {
        self.stop_expiry_loop();
        // Bumped under the watch lock so a concurrent establish either
        // finishes first (and is cleared below) or sees the new generation.
        self.state_tx.send_modify(|snapshot| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *snapshot = SessionSnapshot {
                phase: SessionPhase::Unauthenticated,
                session: None,
            };
        });
        if let Err(error) = self.token_store.clear() {
            tracing::warn!(%error, "failed to clear persisted token on logout");
        }
        tracing::info!(phase = %SessionPhase::Unauthenticated, "logged out");
        self.provider.sign_out().await
    }

    /// Stop reacting to expiry notifications.
    pub fn shutdown(&self) {
        self.stop_expiry_loop();
    }

    /// Apply `apply` only if no logout happened since `generation` and, when
    /// given, the phase is still `from`.
    fn transition(
        &self,
        from: Option<SessionPhase>,
        generation: u64,
        apply: impl FnOnce(&mut SessionSnapshot),
    ) -> bool {
        self.state_tx.send_if_modified(|snapshot| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            if from.is_some_and(|phase| snapshot.phase != phase) {
                return false;
            }
            apply(snapshot);
            true
        })
    }

    fn establish(&self, session: Session, from: Option<SessionPhase>, generation: u64) -> bool {
        self.transition(from, generation, |snapshot| {
            if let Err(error) = self
                .token_store
                .save(&session.access_token, session.expiry_millis())
            {
                tracing::warn!(%error, "failed to persist access token");
            }
            tracing::info!(
                phase = %SessionPhase::Authenticated,
                subject = %session.principal.subject,
                expires_at = %session.access_token_expiry,
                "session established"
            );
            snapshot.phase = SessionPhase::Authenticated;
            snapshot.session = Some(session);
        })
    }

    /// Enter `LoginRedirect` from `from` and send the user to the provider,
    /// at most once per entry.
    async fn force_login(&self, reason: &str, from: SessionPhase, generation: u64) {
        let entered = self.transition(Some(from), generation, |snapshot| {
            snapshot.phase = SessionPhase::LoginRedirect;
            snapshot.session = None;
        });
        if !entered {
            return;
        }
        // The expiry loop may be the caller; it exits on its own once it
        // observes LoginRedirect.
        tracing::warn!(reason, "forcing interactive login");

        if let Err(error) = self.token_store.clear() {
            tracing::warn!(%error, "failed to clear persisted token");
        }
        if let Err(error) = self.provider.forget_user().await {
            tracing::warn!(%error, "failed to forget provider user");
        }
        let return_url = self
            .current_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Err(error) = self.provider.initiate_login(return_url.as_deref()).await {
            tracing::error!(%error, "failed to start login redirect");
        }
    }

    fn spawn_expiry_loop(self: &Arc<Self>, expiring: broadcast::Receiver<AccessTokenExpiring>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(run_expiry_loop(weak, expiring));
        let mut slot = self
            .expiry_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn stop_expiry_loop(&self) {
        let task = self
            .expiry_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_expiry_loop();
    }
}

async fn run_expiry_loop(
    manager: Weak<SessionManager>,
    mut expiring: broadcast::Receiver<AccessTokenExpiring>,
) {
    loop {
        match expiring.recv().await {
            Ok(event) => {
                tracing::debug!(expires_at = %event.expires_at, "access token expiring");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "coalescing expiry notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_access_token_expiring().await;
        if manager.phase() == SessionPhase::LoginRedirect {
            break;
        }
    }
}
