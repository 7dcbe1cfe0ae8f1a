//! In-process pipeline backend for integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamctl::config::Config;
use streamctl::pipeline::PipelineEvent;
use streamctl::ControlContext;
use streamctl_types::messages::{
    PipelineCreated, PipelineDeleted, PipelineErrorReport, PipelineStateChanged, PipelinesList,
};
use streamctl_types::{
    new_pipeline_id, ClientMessage, PipelineSnapshot, PipelineState, ServerMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{accept_async, WebSocketStream};

/// How the mock answers commands.
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub answer_pings: bool,
    /// State reported after `startPipeline`
    pub start_state: PipelineState,
    /// Reply to `startPipeline` with this error instead
    pub fail_start: Option<String>,
    pub fail_stop: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            answer_pings: true,
            start_state: PipelineState::Receiving,
            fail_start: None,
            fail_stop: false,
        }
    }
}

enum Control {
    Text(String),
    Close(u16),
    Drop,
}

#[derive(Default)]
struct MockState {
    behaviour: Mutex<Behaviour>,
    pipelines: Mutex<BTreeMap<String, PipelineSnapshot>>,
    received: Mutex<Vec<ClientMessage>>,
    connections: AtomicUsize,
    /// Refuse new connections before the handshake
    refusing: AtomicBool,
    close_codes: Mutex<Vec<Option<u16>>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
}

pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    acceptor: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let accept_state = state.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if accept_state.refusing.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        serve(ws, state).await;
                    }
                });
            }
        });

        Self {
            addr,
            state,
            acceptor,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn configure(&self, f: impl FnOnce(&mut Behaviour)) {
        f(&mut self.state.behaviour.lock());
    }

    /// Push a message to every open session.
    pub fn push(&self, message: &ServerMessage) {
        self.push_raw(&message.encode().unwrap());
    }

    pub fn push_raw(&self, text: &str) {
        for session in self.state.sessions.lock().iter() {
            let _ = session.send(Control::Text(text.to_string()));
        }
    }

    /// Cut every open session without a close handshake.
    pub fn drop_connections(&self) {
        for session in self.state.sessions.lock().drain(..) {
            let _ = session.send(Control::Drop);
        }
    }

    /// Close every open session with the given close code.
    pub fn close_connections(&self, code: u16) {
        for session in self.state.sessions.lock().drain(..) {
            let _ = session.send(Control::Close(code));
        }
    }

    /// Stop accepting connections and cut the open ones.
    pub fn shutdown(&self) {
        self.state.refusing.store(true, Ordering::SeqCst);
        self.acceptor.abort();
        self.drop_connections();
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.state.received.lock().clone()
    }

    /// Everything received except liveness probes.
    pub fn received_commands(&self) -> Vec<ClientMessage> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|m| !matches!(m, ClientMessage::Ping(_)))
            .cloned()
            .collect()
    }

    pub fn received_kinds(&self) -> Vec<&'static str> {
        self.state.received.lock().iter().map(|m| m.kind()).collect()
    }

    pub fn count_received(&self, kind: &str) -> usize {
        self.received_kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Wait until `n` sessions have been opened in total.
    pub async fn await_connections(&self, n: usize) {
        assert!(
            eventually(|| self.connection_count() >= n).await,
            "expected {} connections, saw {}",
            n,
            self.connection_count()
        );
    }

    pub fn close_codes(&self) -> Vec<Option<u16>> {
        self.state.close_codes.lock().clone()
    }

    pub fn pipeline_ids(&self) -> Vec<String> {
        self.state.pipelines.lock().keys().cloned().collect()
    }

    /// Replace the backend's pipeline table without telling anyone.
    pub fn replace_pipelines(&self, pipelines: Vec<PipelineSnapshot>) {
        let mut table = self.state.pipelines.lock();
        table.clear();
        for pipeline in pipelines {
            table.insert(pipeline.id.clone(), pipeline);
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl MockState {
    fn handle(&self, text: &str) -> Vec<ServerMessage> {
        let Ok(message) = ClientMessage::decode(text) else {
            return Vec::new();
        };
        self.received.lock().push(message.clone());
        let behaviour = self.behaviour.lock().clone();

        match message {
            ClientMessage::Ping(_) if behaviour.answer_pings => vec![ServerMessage::Pong],
            ClientMessage::Ping(_) => Vec::new(),
            ClientMessage::GetPipelines => vec![ServerMessage::PipelinesList(PipelinesList {
                pipelines: self.pipelines.lock().values().cloned().collect(),
            })],
            ClientMessage::CreatePipeline(payload) => {
                let id = payload.id.unwrap_or_else(new_pipeline_id);
                let mut snapshot = PipelineSnapshot::new(id.clone(), PipelineState::Null);
                snapshot.description = payload.description;
                snapshot.elements = payload.pipeline.elements;
                self.pipelines.lock().insert(id, snapshot.clone());
                vec![ServerMessage::PipelineCreated(PipelineCreated { pipeline: snapshot })]
            }
            ClientMessage::StartPipeline(target) => match behaviour.fail_start {
                Some(message) => vec![error(&target.id, "start-failed", &message)],
                None => self.transition(&target.id, behaviour.start_state),
            },
            ClientMessage::StopPipeline(target) => {
                if behaviour.fail_stop {
                    vec![error(&target.id, "stop-failed", "Failed to pause pipeline")]
                } else {
                    self.transition(&target.id, PipelineState::Paused)
                }
            }
            ClientMessage::DeletePipeline(target) => {
                self.pipelines.lock().remove(&target.id);
                vec![ServerMessage::PipelineDeleted(PipelineDeleted {
                    id: target.id,
                    message: None,
                })]
            }
        }
    }

    fn transition(&self, id: &str, state: PipelineState) -> Vec<ServerMessage> {
        match self.pipelines.lock().get_mut(id) {
            Some(pipeline) => {
                pipeline.state = state;
                vec![ServerMessage::PipelineStateChanged(PipelineStateChanged {
                    id: id.to_string(),
                    state,
                    message: None,
                })]
            }
            None => vec![error(id, "not-found", "Pipeline not found")],
        }
    }
}

fn error(id: &str, code: &str, message: &str) -> ServerMessage {
    ServerMessage::PipelineError(PipelineErrorReport {
        id: Some(id.to_string()),
        error_code: code.to_string(),
        error_message: message.to_string(),
        details: None,
    })
}

async fn serve(ws: WebSocketStream<TcpStream>, state: Arc<MockState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (tx, mut control) = mpsc::unbounded_channel();
    state.sessions.lock().push(tx);
    let (mut sink, mut stream) = ws.split();

    // Every session opens with the current pipeline list
    let greeting = ServerMessage::PipelinesList(PipelinesList {
        pipelines: state.pipelines.lock().values().cloned().collect(),
    });
    if sink.send(Message::Text(greeting.encode().unwrap().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(Control::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static("server shutdown"),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                Some(Control::Drop) | None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    for reply in state.handle(text.as_str()) {
                        if sink.send(Message::Text(reply.encode().unwrap().into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    state.close_codes.lock().push(frame.map(|f| u16::from(f.code)));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}

/// Configuration with timings short enough for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.connection.connect_timeout_ms = 1_000;
    config.connection.reconnect_base_delay_ms = 50;
    config.connection.reconnect_max_delay_ms = 200;
    config.connection.ping_interval_ms = 100;
    config.connection.pong_timeout_ms = 200;
    config.connection.command_timeout_ms = 2_000;
    config.streams.restart_grace_ms = 50;
    config
}

/// A context connected to `mock`.
///
/// Returns once both lists of the session (the greeting and the reply to
/// the client's own `getPipelines`) have been applied.
pub async fn connected_context(mock: &MockBackend, config: Config) -> ControlContext {
    let ctx = ControlContext::with_endpoints(&config, vec![mock.url()]).unwrap();
    connect_context(mock, &ctx).await;
    ctx
}

/// Start `ctx` against `mock` and wait for the session's two resyncs.
pub async fn connect_context(mock: &MockBackend, ctx: &ControlContext) {
    let opened = mock.connection_count();
    let resyncs = Arc::new(AtomicUsize::new(0));
    let counter = resyncs.clone();
    let subscription = ctx.pipelines.subscribe(move |event| {
        if let PipelineEvent::Resynced { .. } = event {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    ctx.start().await.unwrap();
    assert!(
        eventually(|| resyncs.load(Ordering::SeqCst) >= 2).await,
        "expected two resyncs, saw {}",
        resyncs.load(Ordering::SeqCst)
    );
    subscription.unsubscribe();
    mock.await_connections(opened + 1).await;
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
