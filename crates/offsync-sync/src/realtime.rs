//! Authenticated realtime channel with bounded exponential reconnect.
//!
//! The channel owns one supervisor task per `connect` call. The supervisor
//! dials through a [`RealtimeTransport`], pumps inbound messages to the
//! registered handlers and, when the connection drops while the network is
//! still up, redials after 1s, 2s, 4s, ... capped at `reconnect_cap`, giving up
//! after `max_attempts` consecutive failures. A successful authentication
//! resets the attempt counter; an auth rejection stops the supervisor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use offsync_core::{ClientInfo, OfsResult, SyncError, TenantId};
use secrecy::SecretString;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::network::NetworkMonitor;
use crate::protocol::ChannelMessage;

// ── Transport seam ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Credentials {
    pub tenant_id: TenantId,
    pub token: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant_id", &self.tenant_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Outbound half of an established connection.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: &ChannelMessage) -> OfsResult<()>;
    async fn close(&self);
}

/// An established, authenticated connection. The inbound stream ending or
/// yielding an error means the connection dropped.
pub struct Connection {
    pub sink: Arc<dyn MessageSink>,
    pub inbound: BoxStream<'static, OfsResult<ChannelMessage>>,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Dial, authenticate and send `hello`. Rejected credentials must surface
    /// as [`SyncError::Auth`]; everything else as [`SyncError::Network`].
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
        hello: &ChannelMessage,
    ) -> OfsResult<Connection>;
}

// ── Channel ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticated,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// An inbound message from another device or the server
    Message(ChannelMessage),
    StateChanged(ChannelState),
    AuthRejected(String),
    /// Reconnect attempts exhausted; waiting for the next online transition
    GaveUp { attempts: u32 },
}

pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based): 2^attempt seconds, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.cap)
    }
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum PumpEnd {
    Closed,
    Dropped(String),
    AuthRevoked(String),
}

pub struct RealtimeChannel {
    transport: Arc<dyn RealtimeTransport>,
    network: Arc<NetworkMonitor>,
    client_info: ClientInfo,
    policy: ReconnectPolicy,
    state: watch::Sender<ChannelState>,
    handlers: Mutex<Vec<ChannelHandler>>,
    session: Mutex<Option<Session>>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    attempts: AtomicU32,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        network: Arc<NetworkMonitor>,
        client_info: ClientInfo,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Arc::new(Self {
            transport,
            network,
            client_info,
            policy,
            state,
            handlers: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            sink: RwLock::new(None),
            attempts: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Consecutive failed reconnect attempts since the last authentication.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reset_backoff(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    pub fn on_message(&self, handler: impl Fn(ChannelEvent) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Replace any existing session with a new one and wait for the first
    /// dial to finish. On a network failure the supervisor keeps retrying in
    /// the background; the returned error only describes the first attempt.
    pub async fn connect(self: &Arc<Self>, endpoint: &str, credentials: Credentials) -> OfsResult<()> {
        self.close().await;
        self.reset_backoff();

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let channel = Arc::clone(self);
        let endpoint = endpoint.to_string();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            channel
                .supervise(endpoint, credentials, task_cancel, first_tx)
                .await
        });
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session { cancel, task });

        first_rx
            .await
            .unwrap_or_else(|_| Err(SyncError::Network("realtime supervisor exited".into())))
    }

    /// Tear down the current session, if any. No reconnect follows.
    pub async fn close(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                warn!("realtime supervisor ended abnormally: {e}");
            }
        }
        self.clear_sink();
        self.set_state(ChannelState::Disconnected);
    }

    pub async fn send(&self, message: &ChannelMessage) -> OfsResult<()> {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => sink.send(message).await,
            None => Err(SyncError::Network("realtime channel not connected".into())),
        }
    }

    fn hello(&self, credentials: &Credentials) -> ChannelMessage {
        ChannelMessage::Hello {
            client_info: self.client_info.clone(),
            tenant_id: credentials.tenant_id.to_string(),
        }
    }

    async fn supervise(
        self: Arc<Self>,
        endpoint: String,
        credentials: Credentials,
        cancel: CancellationToken,
        first: oneshot::Sender<OfsResult<()>>,
    ) {
        let mut first = Some(first);
        let hello = self.hello(&credentials);

        loop {
            self.set_state(ChannelState::Connecting);
            let dialed = tokio::select! {
                _ = cancel.cancelled() => return,
                dialed = self.transport.connect(&endpoint, &credentials, &hello) => dialed,
            };

            match dialed {
                Ok(connection) => {
                    self.reset_backoff();
                    self.set_state(ChannelState::Authenticated);
                    info!(endpoint = %endpoint, "realtime channel authenticated");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let end = self.pump(connection, &cancel).await;
                    self.clear_sink();
                    self.set_state(ChannelState::Disconnected);
                    match end {
                        PumpEnd::Closed => return,
                        PumpEnd::Dropped(reason) => warn!(reason = %reason, "realtime connection dropped"),
                        PumpEnd::AuthRevoked(reason) => {
                            self.emit(ChannelEvent::AuthRejected(reason));
                            return;
                        }
                    }
                }
                Err(SyncError::Auth(reason)) => {
                    self.set_state(ChannelState::Disconnected);
                    warn!(reason = %reason, "realtime authentication rejected");
                    self.emit(ChannelEvent::AuthRejected(reason.clone()));
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(SyncError::Auth(reason)));
                    }
                    return;
                }
                Err(e) => {
                    self.set_state(ChannelState::Disconnected);
                    debug!(error = %e, "realtime dial failed");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(e));
                    }
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if !self.network.is_online() {
                info!("network offline; realtime reconnect waits for the next online transition");
                return;
            }

            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.policy.max_attempts {
                warn!(attempts = attempt, "giving up on realtime reconnect");
                self.emit(ChannelEvent::GaveUp { attempts: attempt });
                return;
            }
            let delay = self.policy.delay_for(attempt);
            self.attempts.store(attempt + 1, Ordering::SeqCst);
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "scheduling realtime reconnect");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&self, connection: Connection, cancel: &CancellationToken) -> PumpEnd {
        let Connection { sink, mut inbound } = connection;
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&sink));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    sink.close().await;
                    return PumpEnd::Closed;
                }
                next = inbound.next() => match next {
                    None => return PumpEnd::Dropped("stream ended".into()),
                    Some(Err(SyncError::Auth(reason))) => return PumpEnd::AuthRevoked(reason),
                    Some(Err(e)) => return PumpEnd::Dropped(e.to_string()),
                    Some(Ok(message)) => self.dispatch(message, sink.as_ref()).await,
                }
            }
        }
    }

    async fn dispatch(&self, message: ChannelMessage, sink: &dyn MessageSink) {
        if self.client_info.is_self(message.origin_device()) {
            trace!(kind = message.type_name(), "discarding own echo");
            return;
        }
        match message {
            ChannelMessage::KeepAlive { .. } => {
                let ack = ChannelMessage::KeepAliveAck {
                    device_id: self.client_info.device_id.clone(),
                };
                if let Err(e) = sink.send(&ack).await {
                    debug!(error = %e, "keep-alive reply failed");
                }
            }
            ChannelMessage::Hello { .. } | ChannelMessage::KeepAliveAck { .. } => {
                trace!(kind = message.type_name(), "ignoring control message");
            }
            other => self.emit(ChannelEvent::Message(other)),
        }
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            self.emit(ChannelEvent::StateChanged(state));
        }
    }

    fn clear_sink(&self) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn emit(&self, event: ChannelEvent) {
        let handlers: Vec<ChannelHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}
