//! Client-side mirror of the backend's pipelines.
//!
//! [`PipelineClient`] keeps the local pipeline collection, applies
//! optimistic transitions when commands are issued, and reconciles them
//! against the authoritative events pushed by the backend.

pub mod builder;
pub mod errors;
pub mod validation;

pub use builder::build_elements;
pub use errors::translate_error;
pub use validation::{validate, ValidationError, Violation};

use crate::observers::{Observers, Subscription};
use crate::transport::{Connection, ConnectionStatus};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use streamctl_types::messages::{CreatePipelinePayload, PipelineDefinition};
use streamctl_types::{
    new_pipeline_id, ClientMessage, ElementDescriptor, Pipeline, PipelineId, PipelineState,
    ServerMessage, ServerMessageKind,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Pipeline operation errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline not found: {0}")]
    NotFound(PipelineId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Pipeline {id} is already stopped ({state})")]
    AlreadyStopped { id: PipelineId, state: PipelineState },

    #[error("Pipeline {id} failed ({code}): {message}")]
    Backend {
        id: PipelineId,
        code: String,
        message: String,
    },

    #[error("Pipeline {id} entered {state}: {message}")]
    UnexpectedState {
        id: PipelineId,
        state: PipelineState,
        message: String,
    },

    #[error("No response for pipeline {id} within {timeout:?}")]
    Timeout { id: PipelineId, timeout: Duration },
}

/// The kind of confirmation a command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Running,
    Stopped,
}

impl Expect {
    fn is_met_by(self, state: PipelineState) -> bool {
        match self {
            Self::Running => state.is_active(),
            Self::Stopped => state.is_stopped(),
        }
    }
}

/// Change notifications for the pipeline collection.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A pipeline was added or changed, optimistically or authoritatively
    Updated(Pipeline),
    /// The backend confirmed a state
    StateConfirmed {
        id: PipelineId,
        state: PipelineState,
        message: Option<String>,
    },
    /// The backend reported an error; `message` is already translated
    Failed {
        id: PipelineId,
        code: String,
        message: String,
    },
    Removed(PipelineId),
    /// A full list replaced the collection
    Resynced { count: usize },
}

impl PipelineEvent {
    pub fn pipeline_id(&self) -> Option<&str> {
        match self {
            Self::Updated(p) => Some(&p.id),
            Self::StateConfirmed { id, .. } | Self::Failed { id, .. } | Self::Removed(id) => {
                Some(id)
            }
            Self::Resynced { .. } => None,
        }
    }
}

/// Pipeline operations the stream manager depends on.
#[async_trait]
pub trait PipelineControl: Send + Sync {
    async fn create_pipeline(
        &self,
        elements: Vec<ElementDescriptor>,
        description: Option<String>,
    ) -> Result<Pipeline, PipelineError>;

    async fn start_pipeline(&self, id: &str) -> Result<Pipeline, PipelineError>;

    async fn stop_pipeline(&self, id: &str) -> Result<Pipeline, PipelineError>;

    async fn delete_pipeline(&self, id: &str) -> bool;

    fn get_pipeline(&self, id: &str) -> Option<Pipeline>;

    fn subscribe(&self, callback: Box<dyn Fn(&PipelineEvent) + Send + Sync>) -> Subscription;
}

struct Inner {
    connection: Connection,
    command_timeout: Duration,
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
    observers: Observers<PipelineEvent>,
    /// Feeds command waiters
    events: broadcast::Sender<PipelineEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Pipeline control client. Cheap to clone.
#[derive(Clone)]
pub struct PipelineClient {
    inner: Arc<Inner>,
}

impl PipelineClient {
    /// Create a client and register its handlers on the connection.
    pub fn new(connection: Connection, command_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        let client = Self {
            inner: Arc::new(Inner {
                connection: connection.clone(),
                command_timeout,
                pipelines: RwLock::new(HashMap::new()),
                observers: Observers::new(),
                events,
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        let mut subscriptions = Vec::new();
        for kind in ServerMessageKind::ALL {
            if kind == ServerMessageKind::Pong {
                continue;
            }
            let weak = Arc::downgrade(&client.inner);
            subscriptions.push(connection.on_message(kind, move |message| {
                if let Some(client) = upgrade(&weak) {
                    client.apply(message);
                }
            }));
        }

        // Events missed while disconnected are not redelivered
        let weak = Arc::downgrade(&client.inner);
        subscriptions.push(connection.on_status(move |status| {
            if let (ConnectionStatus::Connected { .. }, Some(client)) = (status, upgrade(&weak)) {
                client.refresh();
            }
        }));

        *client.inner.subscriptions.lock() = subscriptions;
        client
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Snapshot of one pipeline.
    pub fn get_pipeline(&self, id: &str) -> Option<Pipeline> {
        self.inner.pipelines.read().get(id).cloned()
    }

    /// Snapshot of every pipeline, ordered by id.
    pub fn list_pipelines(&self) -> Vec<Pipeline> {
        let mut pipelines: Vec<Pipeline> = self.inner.pipelines.read().values().cloned().collect();
        pipelines.sort_by(|a, b| a.id.cmp(&b.id));
        pipelines
    }

    /// Validate and submit a new pipeline.
    ///
    /// The returned record is the local optimistic copy in `NULL` state; the
    /// backend's acknowledgement is merged into it when it arrives.
    pub fn create_pipeline(
        &self,
        elements: Vec<ElementDescriptor>,
        description: Option<String>,
    ) -> Result<Pipeline, PipelineError> {
        validate(&elements)?;

        let id = new_pipeline_id();
        let description = description.unwrap_or_else(|| format!("Pipeline {}", id));
        let pipeline = Pipeline::new(id.clone(), description.clone(), elements.clone());
        self.inner
            .pipelines
            .write()
            .insert(id.clone(), pipeline.clone());
        self.emit(PipelineEvent::Updated(pipeline.clone()));

        let message = ClientMessage::CreatePipeline(CreatePipelinePayload {
            id: Some(id.clone()),
            description: Some(description),
            pipeline: PipelineDefinition {
                elements,
                options: None,
            },
        });
        if !self.inner.connection.send(&message) {
            debug!("Creation of {} queued until the connection is back", id);
        }

        info!("Created pipeline {}", id);
        Ok(pipeline)
    }

    /// Start a pipeline and wait for the backend's verdict.
    ///
    /// The local state is `CONNECTING` as soon as this is called.
    pub async fn start_pipeline(&self, id: &str) -> Result<Pipeline, PipelineError> {
        let waiter = self.begin_command(id, PipelineState::Connecting, ClientMessage::start(id))?;
        self.await_verdict(id, Expect::Running, waiter).await
    }

    /// Stop (pause) a pipeline and wait for the backend's verdict.
    pub async fn stop_pipeline(&self, id: &str) -> Result<Pipeline, PipelineError> {
        if let Some(pipeline) = self.get_pipeline(id) {
            let state = pipeline.state();
            if state.is_stopped() {
                return Err(PipelineError::AlreadyStopped {
                    id: id.to_string(),
                    state,
                });
            }
        }
        let waiter = self.begin_command(id, PipelineState::Paused, ClientMessage::stop(id))?;
        self.await_verdict(id, Expect::Stopped, waiter).await
    }

    /// Ask the backend to delete a pipeline.
    ///
    /// The local record is removed only when the command went out on a live
    /// connection. Returns false for unknown ids and for queued commands.
    pub fn delete_pipeline(&self, id: &str) -> bool {
        if !self.inner.pipelines.read().contains_key(id) {
            return false;
        }

        if !self.inner.connection.send(&ClientMessage::delete(id)) {
            warn!("Delete of {} queued; keeping the local record until the backend confirms", id);
            return false;
        }

        if self.inner.pipelines.write().remove(id).is_some() {
            self.emit(PipelineEvent::Removed(id.to_string()));
        }
        info!("Deleted pipeline {}", id);
        true
    }

    /// Request the full pipeline list from the backend.
    pub fn refresh(&self) -> bool {
        self.inner.connection.send(&ClientMessage::GetPipelines)
    }

    /// Request the full list and wait until it has been applied.
    pub async fn fetch_pipelines(&self) -> Result<Vec<Pipeline>, PipelineError> {
        let mut rx = self.inner.events.subscribe();
        self.refresh();

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(PipelineEvent::Resynced { .. }) => return,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Pipeline event receiver lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };
        tokio::time::timeout(self.inner.command_timeout, wait)
            .await
            .map_err(|_| PipelineError::Timeout {
                id: "*".to_string(),
                timeout: self.inner.command_timeout,
            })?;
        Ok(self.list_pipelines())
    }

    /// Subscribe to every pipeline event.
    pub fn subscribe(
        &self,
        callback: impl Fn(&PipelineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.observers.subscribe(callback)
    }

    /// Subscribe to changes of one pipeline.
    ///
    /// The current snapshot is delivered immediately if the pipeline exists.
    pub fn subscribe_to_pipeline(
        &self,
        id: &str,
        callback: impl Fn(&Pipeline) + Send + Sync + 'static,
    ) -> Subscription {
        if let Some(pipeline) = self.get_pipeline(id) {
            callback(&pipeline);
        }
        let id = id.to_string();
        self.inner.observers.subscribe(move |event| {
            if let PipelineEvent::Updated(pipeline) = event {
                if pipeline.id == id {
                    callback(pipeline);
                }
            }
        })
    }

    /// Apply an authoritative backend message to the local collection.
    pub fn apply(&self, message: &ServerMessage) {
        let mut events = Vec::new();
        {
            let mut pipelines = self.inner.pipelines.write();
            match message {
                ServerMessage::PipelineCreated(created) => {
                    let snapshot = created.pipeline.clone();
                    let pipeline = match pipelines.remove(&snapshot.id) {
                        Some(mut pipeline) => {
                            pipeline.merge_snapshot(snapshot);
                            pipeline
                        }
                        // Dropped by a list that crossed the creation; a later
                        // pipelineDeleted removes it again if it was deleted
                        None => {
                            debug!("Adopting pipeline {} from its acknowledgement", snapshot.id);
                            Pipeline::from_snapshot(snapshot)
                        }
                    };
                    events.push(PipelineEvent::Updated(pipeline.clone()));
                    pipelines.insert(pipeline.id.clone(), pipeline);
                }
                ServerMessage::PipelineStateChanged(changed) => {
                    match pipelines.get_mut(&changed.id) {
                        Some(pipeline) => {
                            pipeline.confirm_state(changed.state);
                            debug!("Pipeline {} is now {}", changed.id, changed.state);
                            events.push(PipelineEvent::StateConfirmed {
                                id: changed.id.clone(),
                                state: changed.state,
                                message: changed.message.clone(),
                            });
                            events.push(PipelineEvent::Updated(pipeline.clone()));
                        }
                        None => debug!("Ignoring state change of unknown pipeline {}", changed.id),
                    }
                }
                ServerMessage::PipelineError(report) => {
                    let raw = match &report.details {
                        Some(details) => format!("{}: {}", report.error_message, details),
                        None => report.error_message.clone(),
                    };
                    let message = translate_error(&raw);
                    match report.id.as_ref().and_then(|id| pipelines.get_mut(id)) {
                        Some(pipeline) => {
                            warn!(
                                "Pipeline {} failed ({}): {}",
                                pipeline.id, report.error_code, message
                            );
                            pipeline.fail(message.clone());
                            events.push(PipelineEvent::Failed {
                                id: pipeline.id.clone(),
                                code: report.error_code.clone(),
                                message,
                            });
                            events.push(PipelineEvent::Updated(pipeline.clone()));
                        }
                        None => warn!("Backend error ({}): {}", report.error_code, message),
                    }
                }
                ServerMessage::PipelineStats(report) => {
                    if let Some(pipeline) = pipelines.get_mut(&report.id) {
                        pipeline.stats = report.stats.clone();
                        events.push(PipelineEvent::Updated(pipeline.clone()));
                    }
                }
                ServerMessage::PipelineDeleted(deleted) => {
                    if pipelines.remove(&deleted.id).is_some() {
                        events.push(PipelineEvent::Removed(deleted.id.clone()));
                    }
                }
                ServerMessage::PipelinesList(list) => {
                    let mut previous = std::mem::take(&mut *pipelines);
                    for snapshot in list.pipelines.iter().cloned() {
                        let id = snapshot.id.clone();
                        let pipeline = match previous.remove(&id) {
                            Some(mut pipeline) => {
                                pipeline.merge_snapshot(snapshot);
                                pipeline
                            }
                            None => Pipeline::from_snapshot(snapshot),
                        };
                        events.push(PipelineEvent::Updated(pipeline.clone()));
                        pipelines.insert(id, pipeline);
                    }
                    for id in previous.into_keys() {
                        events.push(PipelineEvent::Removed(id));
                    }
                    debug!("Resynchronized {} pipelines", pipelines.len());
                    events.push(PipelineEvent::Resynced {
                        count: pipelines.len(),
                    });
                }
                ServerMessage::Pong => {}
            }
        }

        for event in events {
            self.emit(event);
        }
    }

    fn emit(&self, event: PipelineEvent) {
        self.inner.observers.notify(&event);
        // No receivers simply means no command is waiting
        let _ = self.inner.events.send(event);
    }

    /// Apply the optimistic state and send the command.
    fn begin_command(
        &self,
        id: &str,
        optimistic: PipelineState,
        message: ClientMessage,
    ) -> Result<broadcast::Receiver<PipelineEvent>, PipelineError> {
        // Subscribe first so the verdict cannot slip past
        let waiter = self.inner.events.subscribe();
        let snapshot = {
            let mut pipelines = self.inner.pipelines.write();
            let pipeline = pipelines
                .get_mut(id)
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
            pipeline.set_optimistic_state(optimistic);
            pipeline.clone()
        };
        self.emit(PipelineEvent::Updated(snapshot));

        if !self.inner.connection.send(&message) {
            debug!("{} for {} queued until the connection is back", message.kind(), id);
        }
        Ok(waiter)
    }

    /// Wait until the backend confirms a state matching `expect`, or fails.
    ///
    /// Confirmations of other states (a concurrent command's reply, an
    /// intermediate state) keep the waiter waiting. A confirmed `ERROR` fails
    /// the command.
    async fn await_verdict(
        &self,
        id: &str,
        expect: Expect,
        mut waiter: broadcast::Receiver<PipelineEvent>,
    ) -> Result<Pipeline, PipelineError> {
        let wait = async {
            loop {
                let event = match waiter.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Command waiter for {} lagged by {} events", id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PipelineError::NotFound(id.to_string()));
                    }
                };
                match event {
                    PipelineEvent::StateConfirmed {
                        id: event_id,
                        state,
                        message,
                    } if event_id == id => {
                        if expect.is_met_by(state) {
                            return self
                                .get_pipeline(id)
                                .ok_or_else(|| PipelineError::NotFound(id.to_string()));
                        }
                        if state == PipelineState::Error {
                            return Err(PipelineError::UnexpectedState {
                                id: event_id,
                                state,
                                message: message
                                    .unwrap_or_else(|| "Pipeline reported an error".to_string()),
                            });
                        }
                        debug!("Pipeline {} is {}, waiting for {:?}", id, state, expect);
                    }
                    PipelineEvent::Failed {
                        id: event_id,
                        code,
                        message,
                    } if event_id == id => {
                        return Err(PipelineError::Backend {
                            id: event_id,
                            code,
                            message,
                        });
                    }
                    PipelineEvent::Removed(event_id) if event_id == id => {
                        return Err(PipelineError::NotFound(event_id));
                    }
                    _ => {}
                }
            }
        };

        tokio::time::timeout(self.inner.command_timeout, wait)
            .await
            .map_err(|_| PipelineError::Timeout {
                id: id.to_string(),
                timeout: self.inner.command_timeout,
            })?
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<PipelineClient> {
    weak.upgrade().map(|inner| PipelineClient { inner })
}

#[async_trait]
impl PipelineControl for PipelineClient {
    async fn create_pipeline(
        &self,
        elements: Vec<ElementDescriptor>,
        description: Option<String>,
    ) -> Result<Pipeline, PipelineError> {
        PipelineClient::create_pipeline(self, elements, description)
    }

    async fn start_pipeline(&self, id: &str) -> Result<Pipeline, PipelineError> {
        PipelineClient::start_pipeline(self, id).await
    }

    async fn stop_pipeline(&self, id: &str) -> Result<Pipeline, PipelineError> {
        PipelineClient::stop_pipeline(self, id).await
    }

    async fn delete_pipeline(&self, id: &str) -> bool {
        PipelineClient::delete_pipeline(self, id)
    }

    fn get_pipeline(&self, id: &str) -> Option<Pipeline> {
        PipelineClient::get_pipeline(self, id)
    }

    fn subscribe(&self, callback: Box<dyn Fn(&PipelineEvent) + Send + Sync>) -> Subscription {
        self.inner.observers.subscribe(callback)
    }
}
