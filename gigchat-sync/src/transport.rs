//! Live connection to the push-event relay.
//!
//! ```text
//!              ┌──────────── supervisor task ────────────┐
//!              │ connect ─► announce ─► read loop ─► drop │
//!              │    ▲                                 │   │
//!              │    └──── backoff (ReconnectPolicy) ◄─┘   │
//!              └────────────────────┬────────────────────┘
//!                                   │ Envelope by name
//!                     ┌─────────────┼─────────────┐
//!                     ▼             ▼             ▼
//!                subscriber A  subscriber B   (none: debug log)
//! ```
//!
//! One WebSocket carries every named event. On each (re)connect the local
//! user is announced and a fresh presence roster is requested. Publishing
//! while the link is down fails fast; nothing is queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as Frame;

use crate::config::{ReconnectPolicy, SessionConfig};
use crate::error::SyncError;
use crate::protocol::{names, Envelope, InboundEvent, OutboundEvent};

/// Link state, published through a watch channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct Shared {
    url: String,
    username: String,
    policy: ReconnectPolicy,
    buffer: usize,
    /// event name → subscribers
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Envelope>>>>,
    /// Writer of the current connection, if any.
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    state: watch::Sender<ConnectionState>,
    /// Connections established since creation. Bumped before `Connected` is published.
    connections: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Transport {previous:?} -> {next:?}");
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Route one inbound frame to every subscriber of its name.
    async fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame: {e}");
                return;
            }
        };

        let targets = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(&envelope.event).cloned().unwrap_or_default()
        };
        if targets.is_empty() {
            debug!("No subscriber for event {:?}", envelope.event);
            return;
        }

        let mut closed = false;
        for tx in &targets {
            if tx.send(envelope.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            let mut subscribers = self.subscribers.write().await;
            if let Some(list) = subscribers.get_mut(&envelope.event) {
                list.retain(|tx| !tx.is_closed());
            }
        }
    }
}

/// Handle to the live connection. Cheap to clone.
#[derive(Clone)]
pub struct EventTransport {
    shared: Arc<Shared>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventTransport {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        policy: ReconnectPolicy,
        buffer: usize,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                username: username.into(),
                policy,
                buffer: buffer.max(1),
                subscribers: RwLock::new(HashMap::new()),
                outgoing: Mutex::new(None),
                state,
                connections: AtomicU64::new(0),
                shutdown,
            }),
            supervisor: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.socket_url.clone(),
            config.username.clone(),
            config.reconnect,
            config.event_buffer,
        )
    }

    /// Register interest in one or more event names.
    ///
    /// Frames for all listed names arrive on one channel, in wire order.
    pub async fn subscribe(&self, event_names: &[&str]) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.shared.buffer);
        let mut subscribers = self.shared.subscribers.write().await;
        for name in event_names {
            subscribers
                .entry((*name).to_string())
                .or_default()
                .push(tx.clone());
        }
        rx
    }

    /// Emit a named event. Fails with `TransportUnavailable` while not connected.
    pub async fn publish(&self, event: &str, data: Value) -> Result<(), SyncError> {
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::TransportUnavailable(format!(
                "cannot publish {event:?} while {:?}",
                self.state()
            )));
        }
        let frame = Envelope::new(event, data).encode()?;
        let tx = self
            .shared
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or_else(|| SyncError::TransportUnavailable("no active connection".into()))?;
        tx.send(frame)
            .await
            .map_err(|_| SyncError::TransportUnavailable("connection writer closed".into()))
    }

    pub async fn publish_outbound(&self, event: OutboundEvent) -> Result<(), SyncError> {
        let envelope = event.into_envelope();
        self.publish(&envelope.event, envelope.data).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of connections established so far.
    pub fn connection_count(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn username(&self) -> &str {
        &self.shared.username
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Spawn the supervisor: connect, and reconnect with backoff until shutdown.
    ///
    /// Calling `start` on a running transport does nothing.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.shutdown.send_replace(false);
        let shared = self.shared.clone();
        *supervisor = Some(tokio::spawn(supervise(shared)));
    }

    /// Withdraw the local user, close the socket and stop reconnecting.
    pub async fn shutdown(&self) {
        if self.state() == ConnectionState::Connected {
            let leave = OutboundEvent::RemoveLoggedInUser(self.shared.username.clone());
            if let Err(e) = self.publish_outbound(leave).await {
                debug!("Could not withdraw presence: {e}");
            }
        }
        self.shared.shutdown.send_replace(true);
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Transport supervisor ended abnormally: {e}");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

async fn supervise(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        match tokio_tungstenite::connect_async(shared.url.as_str()).await {
            Ok((stream, _)) => {
                attempt = 0;
                run_connection(&shared, stream).await;
            }
            Err(e) => warn!("Connect to {} failed: {e}", shared.url),
        }

        if shared.is_shutting_down() {
            break;
        }

        let delay = shared.policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        shared.set_state(ConnectionState::Reconnecting);
        debug!("Reconnecting in {delay:?} (attempt {attempt})");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut shutdown) => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
}

/// Resolves once shutdown is requested. The borrow guard never leaves this
/// future, which keeps callers `Send`.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Drive one connection until it drops or shutdown is requested.
async fn run_connection(shared: &Arc<Shared>, stream: Socket) {
    let (mut sink, mut reader) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(shared.buffer);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Frame::Text(text.into())).await {
                debug!("Writer stopped: {e}");
                return;
            }
        }
        let _ = sink.close().await;
    });

    for event in [
        OutboundEvent::LoggedInUsers(shared.username.clone()),
        OutboundEvent::GetLoggedInUsers,
    ] {
        match event.into_envelope().encode() {
            Ok(frame) => {
                let _ = out_tx.send(frame).await;
            }
            Err(e) => warn!("Could not encode announce frame: {e}"),
        }
    }

    *shared.outgoing.lock().await = Some(out_tx);
    shared.connections.fetch_add(1, Ordering::SeqCst);
    shared.set_state(ConnectionState::Connected);

    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Frame::Text(text))) => shared.dispatch(text.as_str()).await,
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection error: {e}");
                    break;
                }
            },
            _ = stop_requested(&mut shutdown) => break,
        }
    }

    // Dropping the last sender lets the writer flush and close.
    shared.outgoing.lock().await.take();
    let _ = writer.await;
}

/// Feeds decoded inbound events and link changes into one channel.
pub struct EventBridge;

impl EventBridge {
    /// Subscribe to every inbound event name and spawn the decoding task.
    ///
    /// Malformed payloads are logged and dropped. The channel closes when
    /// the transport's state channel does. Every `Connected` that follows an
    /// earlier connection is followed by [`InboundEvent::Reconnected`], even
    /// when the watch channel folded the intermediate states together.
    pub async fn attach(transport: &EventTransport) -> mpsc::Receiver<InboundEvent> {
        let mut frames = transport.subscribe(&names::INBOUND).await;
        let mut state = transport.watch_state();
        let shared = transport.shared.clone();
        let mut seen_connections = shared.connections.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(shared.buffer);

        tokio::spawn(async move {
            loop {
                let mut reconnected = false;
                let event = tokio::select! {
                    frame = frames.recv() => {
                        let Some(envelope) = frame else { break };
                        let name = envelope.event.clone();
                        match InboundEvent::from_envelope(envelope) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!("Dropping {name:?} event: {e}");
                                continue;
                            }
                        }
                    }
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *state.borrow_and_update();
                        if current == ConnectionState::Connected {
                            let connections = shared.connections.load(Ordering::SeqCst);
                            reconnected = connections > seen_connections
                                && (seen_connections > 0 || connections > 1);
                            seen_connections = seen_connections.max(connections);
                        }
                        InboundEvent::Connection(current)
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
                if reconnected && tx.send(InboundEvent::Reconnected).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}
