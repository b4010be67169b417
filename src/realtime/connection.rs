use std::fmt;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::policy::ReconnectPolicy;
use super::RealtimeError;

type PushSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback receiving every decoded inbound message.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback receiving transport errors.
pub type ErrorHandler = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

/// Handle returned by [`Connection::add_listener`], used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: usize },
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

enum ConnectionOutcome {
    Shutdown,
    Disconnected,
}

/// The current error handler, plus the latest error raised while none was set.
#[derive(Default)]
struct ErrorSink {
    handler: Option<ErrorHandler>,
    undelivered: Option<RealtimeError>,
}

struct Shared {
    url: Url,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    errors: Mutex<ErrorSink>,
    status_tx: watch::Sender<ConnectionStatus>,
    next_id: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn dispatch(&self, message: &Value) {
        let listeners: Vec<(ListenerId, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
                tracing::error!(url = %self.url, listener = id.0, "realtime listener panicked");
            }
        }
    }

    fn error_sink(&self) -> std::sync::MutexGuard<'_, ErrorSink> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report_error(&self, error: RealtimeError) {
        tracing::warn!(url = %self.url, %error, "realtime transport error");
        let handler = {
            let mut sink = self.error_sink();
            match sink.handler.clone() {
                Some(handler) => handler,
                None => {
                    sink.undelivered = Some(error);
                    return;
                }
            }
        };
        self.call_error_handler(&handler, &error);
    }

    /// Install `handler`, handing it the error it missed, if any.
    fn install_error_handler(&self, handler: ErrorHandler) {
        let missed = {
            let mut sink = self.error_sink();
            sink.handler = Some(handler.clone());
            sink.undelivered.take()
        };
        if let Some(error) = missed {
            self.call_error_handler(&handler, &error);
        }
    }

    fn call_error_handler(&self, handler: &ErrorHandler, error: &RealtimeError) {
        if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
            tracing::warn!(url = %self.url, "realtime error handler panicked");
        }
    }
}

struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One push connection shared by every consumer of its URL.
///
/// Listeners run synchronously on the connection's task in registration
/// order. A listener that panics is logged and skipped; the rest still run.
pub struct Connection {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.shared.url.as_str())
            .field("status", &self.status())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Connection {
    /// Register the connection and start its transport task.
    ///
    /// Listeners may be attached right away; frames received before the
    /// first listener is added are dropped.
    pub(crate) fn open(url: Url, policy: ReconnectPolicy) -> Result<Arc<Self>, RealtimeError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|error| RealtimeError::Connect {
            url: url.to_string(),
            reason: format!("no async runtime available: {error}"),
        })?;

        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            url,
            listeners: Mutex::new(Vec::new()),
            errors: Mutex::new(ErrorSink::default()),
            status_tx,
            next_id: AtomicU64::new(1),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = handle.spawn(run_supervisor_loop(shared.clone(), policy, shutdown_rx));

        Ok(Arc::new(Self {
            shared,
            runtime: Mutex::new(Some(Runtime { shutdown_tx, task })),
        }))
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Replace the error handler. Only the most recent one is called.
    ///
    /// The transport starts before a handler can be attached. If it already
    /// failed while no handler was set, the latest such error is passed to
    /// `handler` right away.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.shared.install_error_handler(Arc::new(handler));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Close the transport and cancel any pending reconnect. Idempotent.
    pub async fn close(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(runtime) = runtime else {
            return;
        };
        let _ = runtime.shutdown_tx.send(true);
        if let Err(error) = runtime.task.await {
            if !error.is_cancelled() {
                tracing::warn!(url = %self.shared.url, %error, "realtime task ended abnormally");
            }
        }
        self.shared.set_status(ConnectionStatus::Closed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown_tx.send(true);
            runtime.task.abort();
        }
    }
}

async fn run_supervisor_loop(
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reconnect_attempt = 0usize;
    loop {
        let connected = tokio::select! {
            result = connect_async(shared.url.as_str()) => Some(result),
            _ = wait_for_shutdown(&mut shutdown_rx) => None,
        };
        let Some(result) = connected else {
            break;
        };

        match result {
            Ok((mut socket, _response)) => {
                reconnect_attempt = 0;
                shared.set_status(ConnectionStatus::Open);
                tracing::info!(url = %shared.url, "realtime connection open");

                let outcome = run_active_connection(&mut socket, &shared, &mut shutdown_rx).await;
                if matches!(outcome, ConnectionOutcome::Shutdown) {
                    break;
                }
                tracing::info!(url = %shared.url, "realtime connection dropped");
            }
            Err(error) => shared.report_error(map_connect_error(&shared.url, error)),
        }

        if !policy.is_enabled() || *shutdown_rx.borrow() {
            break;
        }
        if reconnect_attempt >= policy.max_attempts {
            shared.report_error(RealtimeError::ReconnectExhausted {
                url: shared.url.to_string(),
                attempts: reconnect_attempt,
            });
            break;
        }
        reconnect_attempt += 1;
        shared.set_status(ConnectionStatus::Reconnecting {
            attempt: reconnect_attempt,
        });

        let sleep = time::sleep(policy.delay_for(reconnect_attempt));
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
        }
    }

    shared.set_status(ConnectionStatus::Closed);
    tracing::info!(url = %shared.url, "realtime connection closed");
}

async fn run_active_connection(
    socket: &mut PushSocket,
    shared: &Shared,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown_rx) => {
                let _ = socket.send(Message::Close(None)).await;
                return ConnectionOutcome::Shutdown;
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(message)) => match handle_server_message(socket, shared, message).await {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => return ConnectionOutcome::Disconnected,
                        Err(error) => {
                            shared.report_error(RealtimeError::Receive {
                                url: shared.url.to_string(),
                                reason: error.to_string(),
                            });
                            return ConnectionOutcome::Disconnected;
                        }
                    },
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                        return ConnectionOutcome::Disconnected;
                    }
                    Some(Err(error)) => {
                        shared.report_error(RealtimeError::Receive {
                            url: shared.url.to_string(),
                            reason: error.to_string(),
                        });
                        return ConnectionOutcome::Disconnected;
                    }
                }
            }
        }
    }
}

async fn handle_server_message(
    socket: &mut PushSocket,
    shared: &Shared,
    message: Message,
) -> Result<ControlFlow<()>, WsError> {
    match message {
        Message::Text(text) => decode_and_dispatch(shared, text.as_bytes()),
        Message::Binary(bytes) => decode_and_dispatch(shared, &bytes),
        Message::Ping(payload) => socket.send(Message::Pong(payload)).await?,
        Message::Pong(_) | Message::Frame(_) => {}
        Message::Close(_) => return Ok(ControlFlow::Break(())),
    }
    Ok(ControlFlow::Continue(()))
}

fn decode_and_dispatch(shared: &Shared, payload: &[u8]) {
    match serde_json::from_slice::<Value>(payload) {
        Ok(message) => shared.dispatch(&message),
        Err(error) => shared.report_error(RealtimeError::Decode {
            url: shared.url.to_string(),
            reason: error.to_string(),
        }),
    }
}

/// Resolves once shutdown is requested or the connection handle is gone.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

fn map_connect_error(url: &Url, error: WsError) -> RealtimeError {
    let reason = match error {
        WsError::Http(response) => {
            format!("handshake rejected with status {}", response.status().as_u16())
        }
        WsError::Io(error) => error.to_string(),
        WsError::Url(error) => format!("unusable URL: {error}"),
        other => other.to_string(),
    };
    RealtimeError::Connect {
        url: url.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shared(url: &str) -> Arc<Shared> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        Arc::new(Shared {
            url: Url::parse(url).unwrap(),
            listeners: Mutex::new(Vec::new()),
            errors: Mutex::new(ErrorSink::default()),
            status_tx,
            next_id: AtomicU64::new(1),
        })
    }

    #[test]
    fn dispatch_survives_panicking_listener() {
        let shared = shared("ws://push.example/feed");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        let last = seen.clone();
        shared.listeners.lock().unwrap().extend([
            (
                ListenerId(1),
                Arc::new(move |_: &Value| first.lock().unwrap().push("first")) as Listener,
            ),
            (ListenerId(2), Arc::new(|_: &Value| panic!("listener failure")) as Listener),
            (
                ListenerId(3),
                Arc::new(move |_: &Value| last.lock().unwrap().push("last")) as Listener,
            ),
        ]);

        shared.dispatch(&serde_json::json!({"event": "run_finished"}));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "last"]);
    }

    #[test]
    fn undecodable_frame_goes_to_error_handler() {
        let shared = shared("ws://push.example/feed");
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        shared.install_error_handler(Arc::new(move |error: &RealtimeError| {
            assert!(matches!(error, RealtimeError::Decode { .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        decode_and_dispatch(&shared, b"not json");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_raised_before_handler_is_delivered_on_install() {
        let shared = shared("ws://push.example/feed");
        shared.report_error(RealtimeError::Receive {
            url: "ws://push.example/feed".into(),
            reason: "first".into(),
        });
        shared.report_error(RealtimeError::Receive {
            url: "ws://push.example/feed".into(),
            reason: "second".into(),
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        shared.install_error_handler(Arc::new(move |error: &RealtimeError| {
            sink.lock().unwrap().push(error.clone());
        }));
        let other = seen.clone();
        shared.install_error_handler(Arc::new(move |error: &RealtimeError| {
            other.lock().unwrap().push(error.clone());
        }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], RealtimeError::Receive { reason, .. } if reason == "second"));
    }

    #[test]
    fn status_updates_skip_duplicates() {
        let shared = shared("ws://push.example/feed");
        let mut rx = shared.status_tx.subscribe();
        shared.set_status(ConnectionStatus::Connecting);
        assert!(!rx.has_changed().unwrap());
        shared.set_status(ConnectionStatus::Open);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Open);
    }

    #[test]
    fn status_display() {
        assert_eq!(
            ConnectionStatus::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
    }
}
