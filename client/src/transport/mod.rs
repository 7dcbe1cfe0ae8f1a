//! Reconnecting WebSocket connection to the pipeline backend.
//!
//! A [`Connection`] owns at most one socket at a time. It walks the endpoint
//! candidates in order, keeps the link alive with application-level
//! ping/pong, reconnects with exponential backoff after unexpected closure,
//! and queues outbound messages while no socket is open.

pub mod backoff;

pub use backoff::Backoff;

use crate::config::ConnectionConfig;
use crate::observers::{Observers, Subscription};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use streamctl_types::{ClientMessage, ServerMessage, ServerMessageKind};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable state of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// Trying one endpoint candidate
    Connecting { endpoint: String },
    Connected { endpoint: String },
    /// Waiting `delay` before reconnect attempt number `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal until the next explicit connect
    Error { message: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn description(&self) -> String {
        match self {
            Self::Disconnected => "disconnected".to_string(),
            Self::Connecting { endpoint } => format!("connecting to {}", endpoint),
            Self::Connected { endpoint } => format!("connected to {}", endpoint),
            Self::Reconnecting { attempt, delay } => {
                format!("reconnecting in {:?} (attempt {})", delay, attempt)
            }
            Self::Error { message } => format!("error: {}", message),
        }
    }
}

/// Errors reported by [`Connection::connect`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No endpoint candidates configured")]
    NoEndpoints,

    #[error("All {attempted} endpoint candidates failed (last error: {last_error})")]
    EndpointsExhausted { attempted: usize, last_error: String },

    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Local disconnect
    Cancelled,
    /// Server closed with a normal close code
    ClosedNormally,
    /// Anything else; triggers reconnection
    Lost(String),
}

struct Session {
    endpoint: String,
    ws: WsStream,
    outbound: mpsc::UnboundedReceiver<String>,
}

struct Shared {
    status: ConnectionStatus,
    backoff: Backoff,
    /// Sender into the live session, present only while connected
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Messages waiting for a connection
    queue: VecDeque<String>,
    last_pong: Option<Instant>,
    /// Lifecycle token; cancelled by disconnect or a new connect
    cancel: CancellationToken,
}

struct Inner {
    config: ConnectionConfig,
    endpoints: Vec<String>,
    shared: Mutex<Shared>,
    /// Serializes connect() so at most one socket is ever opened
    connect_lock: tokio::sync::Mutex<()>,
    status_observers: Observers<ConnectionStatus>,
    handlers: Mutex<HashMap<ServerMessageKind, Observers<ServerMessage>>>,
}

/// Handle to the backend connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(config: ConnectionConfig, endpoints: Vec<String>) -> Self {
        let backoff = Backoff::new(
            config.reconnect_base_delay(),
            config.reconnect_multiplier,
            config.reconnect_max_delay(),
        );
        Self {
            inner: Arc::new(Inner {
                endpoints,
                shared: Mutex::new(Shared {
                    status: ConnectionStatus::Disconnected,
                    backoff,
                    outbound: None,
                    queue: VecDeque::new(),
                    last_pong: None,
                    cancel: CancellationToken::new(),
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                status_observers: Observers::new(),
                handlers: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.shared.lock().status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.lock().status.is_connected()
    }

    /// Number of messages waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// When the last pong arrived on the current session.
    pub fn last_pong(&self) -> Option<Instant> {
        self.inner.shared.lock().last_pong
    }

    /// Connect to the first reachable endpoint candidate.
    ///
    /// Resolves with the endpoint URL. Calling this while already connected
    /// returns the current endpoint without opening a second socket.
    pub async fn connect(&self) -> Result<String, TransportError> {
        let _guard = self.inner.connect_lock.lock().await;

        let cancel = {
            let mut shared = self.inner.shared.lock();
            if let ConnectionStatus::Connected { endpoint } = &shared.status {
                return Ok(endpoint.clone());
            }
            // Supersede a pending reconnect loop
            shared.cancel.cancel();
            shared.cancel = CancellationToken::new();
            shared.backoff.reset();
            shared.cancel.clone()
        };

        match self.establish(&cancel).await {
            Ok((endpoint, ws)) => {
                let session = self.open_session(endpoint.clone(), ws);
                tokio::spawn(self.clone().supervise(session, cancel));
                Ok(endpoint)
            }
            Err(TransportError::Cancelled) => Err(TransportError::Cancelled),
            Err(e) => {
                error!("{}", e);
                self.set_status(ConnectionStatus::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        let changed = {
            let mut shared = self.inner.shared.lock();
            shared.cancel.cancel();
            shared.outbound = None;
            shared.last_pong = None;
            if shared.status == ConnectionStatus::Disconnected {
                false
            } else {
                shared.status = ConnectionStatus::Disconnected;
                true
            }
        };
        if changed {
            info!("Disconnected from backend");
            self.inner
                .status_observers
                .notify(&ConnectionStatus::Disconnected);
        }
    }

    /// Send a message, queueing it while disconnected.
    ///
    /// Returns true if the message was handed to a live session and false if
    /// it was queued (or could not be encoded).
    pub fn send(&self, message: &ClientMessage) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} message: {}", message.kind(), e);
                return false;
            }
        };

        let mut shared = self.inner.shared.lock();
        let text = match shared.outbound.as_ref() {
            Some(tx) => match tx.send(text) {
                Ok(()) => {
                    trace!("Sent {}", message.kind());
                    return true;
                }
                Err(mpsc::error::SendError(text)) => text,
            },
            None => text,
        };
        debug!("Queued {} until the connection is available", message.kind());
        enqueue(&mut shared.queue, self.inner.config.queue_capacity, text);
        false
    }

    /// Register a handler for one message type.
    pub fn on_message(
        &self,
        kind: ServerMessageKind,
        handler: impl Fn(&ServerMessage) + Send + Sync + 'static,
    ) -> Subscription {
        let observers = self
            .inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .clone();
        observers.subscribe(handler)
    }

    /// Register a status observer.
    pub fn on_status(
        &self,
        observer: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status_observers.subscribe(observer)
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.status == status {
                return;
            }
            shared.status = status.clone();
        }
        debug!("Connection status: {}", status.description());
        self.inner.status_observers.notify(&status);
    }

    fn dispatch(&self, message: ServerMessage) {
        let observers = self.inner.handlers.lock().get(&message.kind()).cloned();
        match observers {
            Some(observers) => observers.notify(&message),
            None => trace!("No handler for {}", message.kind().wire_name()),
        }
    }

    /// Try every candidate once, in order.
    async fn establish(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(String, WsStream), TransportError> {
        if self.inner.endpoints.is_empty() {
            return Err(TransportError::NoEndpoints);
        }

        let timeout = self.inner.config.connect_timeout();
        let mut last_error = String::new();

        for endpoint in &self.inner.endpoints {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            self.set_status(ConnectionStatus::Connecting {
                endpoint: endpoint.clone(),
            });
            debug!("Connecting to {}", endpoint);

            let attempt = tokio::time::timeout(timeout, connect_async(endpoint.as_str()));
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(Ok((ws, _response))) => {
                    if cancel.is_cancelled() {
                        return Err(TransportError::Cancelled);
                    }
                    return Ok((endpoint.clone(), ws));
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", endpoint, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!("Connection to {} timed out after {:?}", endpoint, timeout);
                    last_error = format!("timed out after {:?}", timeout);
                }
            }
        }

        Err(TransportError::EndpointsExhausted {
            attempted: self.inner.endpoints.len(),
            last_error,
        })
    }

    /// Install a freshly opened socket as the live session.
    fn open_session(&self, endpoint: String, ws: WsStream) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.inner.shared.lock();
            shared.backoff.reset();
            shared.last_pong = Some(Instant::now());
            let queued = shared.queue.len();
            for text in shared.queue.drain(..) {
                let _ = tx.send(text);
            }
            if queued > 0 {
                debug!("Flushing {} queued messages", queued);
            }
            shared.outbound = Some(tx);
        }
        info!("Connected to {}", endpoint);
        self.set_status(ConnectionStatus::Connected {
            endpoint: endpoint.clone(),
        });
        Session {
            endpoint,
            ws,
            outbound: rx,
        }
    }

    /// Run sessions until disconnect, normal closure or reconnect exhaustion.
    async fn supervise(self, mut session: Session, cancel: CancellationToken) {
        loop {
            let end = self.drive(&mut session, &cancel).await;

            {
                let mut shared = self.inner.shared.lock();
                if !cancel.is_cancelled() {
                    shared.outbound = None;
                    shared.last_pong = None;
                }
                // Keep whatever the session did not get to write
                while let Ok(text) = session.outbound.try_recv() {
                    enqueue(&mut shared.queue, self.inner.config.queue_capacity, text);
                }
            }

            match end {
                SessionEnd::Cancelled => return,
                SessionEnd::ClosedNormally => {
                    info!("Backend closed the connection to {}", session.endpoint);
                    self.set_status(ConnectionStatus::Disconnected);
                    return;
                }
                SessionEnd::Lost(reason) => {
                    warn!("Connection to {} lost: {}", session.endpoint, reason);
                    match self.reconnect(&cancel).await {
                        Some(next) => session = next,
                        None => return,
                    }
                }
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<Session> {
        let max_attempts = self.inner.config.max_reconnect_attempts;
        loop {
            let (attempt, delay) = {
                let mut shared = self.inner.shared.lock();
                let attempt = shared.backoff.attempt() + 1;
                if max_attempts > 0 && attempt > max_attempts {
                    drop(shared);
                    let message = format!("Gave up after {} reconnection attempts", max_attempts);
                    error!("{}", message);
                    self.set_status(ConnectionStatus::Error { message });
                    return None;
                }
                (attempt, shared.backoff.next_delay())
            };

            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            self.set_status(ConnectionStatus::Reconnecting { attempt, delay });

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish(cancel).await {
                Ok((endpoint, ws)) => return Some(self.open_session(endpoint, ws)),
                Err(TransportError::Cancelled) => return None,
                Err(e) => warn!("Reconnection attempt {} failed: {}", attempt, e),
            }
        }
    }

    async fn drive(&self, session: &mut Session, cancel: &CancellationToken) -> SessionEnd {
        let ping_interval = self.inner.config.ping_interval();
        let pong_timeout = self.inner.config.pong_timeout();
        let mut ping_timer = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static("client disconnect"),
                    };
                    let _ = session.ws.send(Message::Close(Some(close))).await;
                    return SessionEnd::Cancelled;
                }

                _ = ping_timer.tick() => {
                    if pong_deadline.is_some() {
                        continue;
                    }
                    let text = match ClientMessage::ping().encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode ping: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = session.ws.send(Message::Text(text.into())).await {
                        return SessionEnd::Lost(format!("failed to send ping: {}", e));
                    }
                    trace!("Ping sent");
                    pong_deadline = Some(Box::pin(tokio::time::sleep(pong_timeout)));
                }

                _ = async {
                    match pong_deadline.as_mut() {
                        Some(deadline) => deadline.await,
                        None => std::future::pending().await,
                    }
                } => {
                    return SessionEnd::Lost(format!("no pong within {:?}", pong_timeout));
                }

                outgoing = session.outbound.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = session.ws.send(Message::Text(text.clone().into())).await {
                            let mut shared = self.inner.shared.lock();
                            enqueue(&mut shared.queue, self.inner.config.queue_capacity, text);
                            return SessionEnd::Lost(format!("send failed: {}", e));
                        }
                    }
                    None => return SessionEnd::Lost("outbound channel closed".to_string()),
                },

                incoming = session.ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), &mut pong_deadline);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) if frame.code == CloseCode::Normal => SessionEnd::ClosedNormally,
                            Some(frame) => SessionEnd::Lost(format!(
                                "closed by backend ({}): {}",
                                u16::from(frame.code),
                                frame.reason.as_str()
                            )),
                            None => SessionEnd::Lost("closed by backend without a code".to_string()),
                        };
                    }
                    Some(Ok(_)) => {
                        // Binary frames and protocol-level ping/pong
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }

    fn handle_text(&self, text: &str, pong_deadline: &mut Option<Pin<Box<Sleep>>>) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        if message == ServerMessage::Pong {
            *pong_deadline = None;
            self.inner.shared.lock().last_pong = Some(Instant::now());
        }

        trace!("Received {}", message.kind().wire_name());
        self.dispatch(message);
    }
}

fn enqueue(queue: &mut VecDeque<String>, capacity: usize, text: String) {
    if queue.len() >= capacity {
        queue.pop_front();
        warn!(
            "Outbound queue full ({} messages), dropping the oldest message",
            capacity
        );
    }
    queue.push_back(text);
}
