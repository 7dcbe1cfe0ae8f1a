//! Stream lifecycle management.
//!
//! A stream moves `idle → starting → active → stopping → paused`; any failed
//! transition other than a stop lands in `error`, and deletion ends in
//! `terminated`. The manager owns admission (resources), health registration
//! and the backing pipeline of every stream.

use crate::config::StreamsConfig;
use crate::health::{HealthMonitor, HealthNotice};
use crate::observers::{Observers, Subscription};
use crate::pipeline::{build_elements, PipelineControl, PipelineError, PipelineEvent};
use crate::resources::{ResourceAllocator, ResourceError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use streamctl_types::{
    CreateStreamRequest, HealthReport, PipelineId, PipelineState, PipelineStats, Severity, Stream,
    StreamId, StreamStatus,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Metadata key holding the last failure message of a stream.
pub const ERROR_METADATA_KEY: &str = "error";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream not found: {0}")]
    NotFound(StreamId),

    #[error("Stream {0} has no pipeline")]
    NoPipeline(StreamId),

    #[error(transparent)]
    Resources(#[from] ResourceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Notifications about streams.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream record or its pipeline changed
    Changed(Stream),
    Removed(StreamId),
    /// A non-critical health verdict
    HealthWarning {
        stream_id: StreamId,
        report: HealthReport,
    },
}

struct Inner {
    pipelines: Arc<dyn PipelineControl>,
    resources: Arc<ResourceAllocator>,
    health: HealthMonitor,
    restart_grace: Duration,
    streams: RwLock<HashMap<StreamId, Stream>>,
    observers: Observers<StreamEvent>,
    /// Streams with a restart in flight
    restarting: Mutex<HashSet<StreamId>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Stream manager. Cheap to clone.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    pub fn new(
        pipelines: Arc<dyn PipelineControl>,
        resources: Arc<ResourceAllocator>,
        health: HealthMonitor,
        config: &StreamsConfig,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                pipelines,
                resources,
                health,
                restart_grace: config.restart_grace(),
                streams: RwLock::new(HashMap::new()),
                observers: Observers::new(),
                restarting: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        let weak = Arc::downgrade(&manager.inner);
        let pipeline_events =
            manager
                .inner
                .pipelines
                .subscribe(Box::new(move |event: &PipelineEvent| {
                    if let Some(manager) = upgrade(&weak) {
                        manager.on_pipeline_event(event);
                    }
                }));

        let weak = Arc::downgrade(&manager.inner);
        let health_notices = manager.inner.health.on_unhealthy(move |notice: &HealthNotice| {
            if let Some(manager) = upgrade(&weak) {
                manager.on_health_notice(notice);
            }
        });

        *manager.inner.subscriptions.lock() = vec![pipeline_events, health_notices];
        manager
    }

    pub fn resources(&self) -> &ResourceAllocator {
        &self.inner.resources
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    /// Start periodic health checks over this manager's streams.
    ///
    /// Every registered stream is visited, but only `active` streams are
    /// sampled. Idle, paused and failed pipelines report stale stats and are
    /// skipped until they run again.
    pub fn start_health_monitoring(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .health
            .start(Arc::new(move |id: &StreamId| {
                upgrade(&weak).and_then(|manager| manager.stats_for(id))
            }));
    }

    /// Snapshot of one stream, including its pipeline.
    pub fn get_stream(&self, id: &StreamId) -> Option<Stream> {
        let stream = self.inner.streams.read().get(id).cloned()?;
        Some(self.with_pipeline(stream))
    }

    /// Snapshot of every stream, oldest first.
    pub fn list_streams(&self) -> Vec<Stream> {
        let mut streams: Vec<Stream> = self.inner.streams.read().values().cloned().collect();
        streams.sort_by_key(|s| s.created_at);
        streams
            .into_iter()
            .map(|s| self.with_pipeline(s))
            .collect()
    }

    /// Admit, register and build a new stream.
    ///
    /// Nothing stays registered if any step fails.
    pub async fn create_stream(&self, request: CreateStreamRequest) -> Result<Stream, StreamError> {
        let mut stream = Stream::from_request(request);
        let id = stream.id;

        self.inner
            .resources
            .try_allocate(id, stream.stream_type, stream.priority)?;
        self.inner.health.register_stream(id);

        let elements = build_elements(
            stream.stream_type,
            &stream.source,
            stream.destination.as_ref(),
        );
        let description = format!("{} ({})", stream.name, stream.stream_type);
        let pipeline = match self
            .inner
            .pipelines
            .create_pipeline(elements, Some(description))
            .await
        {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.inner.resources.release(&id);
                self.inner.health.unregister_stream(&id);
                warn!("Failed to build pipeline for stream '{}': {}", stream.name, e);
                return Err(e.into());
            }
        };

        stream.pipeline_id = Some(pipeline.id);
        self.inner.streams.write().insert(id, stream.clone());
        info!(
            "Created {} stream '{}' ({})",
            stream.stream_type, stream.name, id
        );

        let snapshot = self.with_pipeline(stream);
        self.inner
            .observers
            .notify(&StreamEvent::Changed(snapshot.clone()));
        Ok(snapshot)
    }

    /// Start a stream's pipeline.
    pub async fn start_stream(&self, id: &StreamId) -> Result<Stream, StreamError> {
        let pipeline_id = self.require_pipeline(id)?;
        self.update(id, |stream| stream.set_status(StreamStatus::Starting))?;

        match self.inner.pipelines.start_pipeline(&pipeline_id).await {
            Ok(_) => {
                let stream = self.update(id, |stream| {
                    stream.metadata.remove(ERROR_METADATA_KEY);
                    stream.set_status(StreamStatus::Active);
                })?;
                info!("Stream '{}' is active", stream.name);
                Ok(stream)
            }
            Err(e) => {
                warn!("Failed to start stream {}: {}", id, e);
                // Deleted while the command was in flight: nothing to record
                let _ = self.update(id, |stream| {
                    stream.set_status(StreamStatus::Error);
                    stream
                        .metadata
                        .insert(ERROR_METADATA_KEY.to_string(), e.to_string());
                });
                Err(e.into())
            }
        }
    }

    /// Stop (pause) a stream's pipeline.
    ///
    /// A failed stop restores the previous status instead of marking the
    /// stream failed.
    pub async fn stop_stream(&self, id: &StreamId) -> Result<Stream, StreamError> {
        let pipeline_id = self.require_pipeline(id)?;
        let mut previous = StreamStatus::Idle;
        self.update(id, |stream| {
            previous = stream.status;
            stream.set_status(StreamStatus::Stopping);
        })?;

        match self.inner.pipelines.stop_pipeline(&pipeline_id).await {
            Ok(_) => {
                let stream = self.update(id, |stream| stream.set_status(StreamStatus::Paused))?;
                info!("Stream '{}' is paused", stream.name);
                Ok(stream)
            }
            Err(e) => {
                error!("Failed to stop stream {}: {}", id, e);
                let _ = self.update(id, |stream| {
                    if stream.status == StreamStatus::Stopping {
                        stream.set_status(previous);
                    }
                });
                Err(e.into())
            }
        }
    }

    /// Tear a stream down completely. Returns false for unknown ids.
    pub async fn delete_stream(&self, id: &StreamId) -> bool {
        let Some(stream) = self.get_stream(id) else {
            return false;
        };

        if stream.status.is_running() {
            if let Err(e) = self.stop_stream(id).await {
                warn!("Failed to stop stream {} before deletion: {}", id, e);
            }
        }

        if let Some(pipeline_id) = &stream.pipeline_id {
            if !self.inner.pipelines.delete_pipeline(pipeline_id).await {
                warn!(
                    "Pipeline {} of stream {} was not deleted immediately",
                    pipeline_id, id
                );
            }
        }

        self.inner.resources.release(id);
        self.inner.health.unregister_stream(id);
        self.inner.restarting.lock().remove(id);
        let removed = self.inner.streams.write().remove(id);

        if let Some(mut stream) = removed {
            stream.set_status(StreamStatus::Terminated);
            info!("Deleted stream '{}' ({})", stream.name, id);
            self.inner.observers.notify(&StreamEvent::Changed(stream));
            self.inner.observers.notify(&StreamEvent::Removed(*id));
        }
        true
    }

    /// Stop, wait the grace period, then start again.
    ///
    /// A restart requested while another is in flight for the same stream
    /// returns the current snapshot without doing anything.
    pub async fn restart_stream(&self, id: &StreamId) -> Result<Stream, StreamError> {
        if !self.inner.restarting.lock().insert(*id) {
            debug!("Restart of stream {} already in progress", id);
            return self.get_stream(id).ok_or(StreamError::NotFound(*id));
        }

        let result = self.run_restart(id).await;
        self.inner.restarting.lock().remove(id);
        result
    }

    pub fn is_restarting(&self, id: &StreamId) -> bool {
        self.inner.restarting.lock().contains(id)
    }

    /// Subscribe to every stream event.
    pub fn subscribe(&self, callback: impl Fn(&StreamEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.subscribe(callback)
    }

    /// Subscribe to changes of one stream.
    ///
    /// The current snapshot is delivered immediately if the stream exists.
    pub fn subscribe_to_stream(
        &self,
        id: &StreamId,
        callback: impl Fn(&Stream) + Send + Sync + 'static,
    ) -> Subscription {
        if let Some(stream) = self.get_stream(id) {
            callback(&stream);
        }
        let id = *id;
        self.inner.observers.subscribe(move |event| {
            if let StreamEvent::Changed(stream) = event {
                if stream.id == id {
                    callback(stream);
                }
            }
        })
    }

    async fn run_restart(&self, id: &StreamId) -> Result<Stream, StreamError> {
        let stream = self.get_stream(id).ok_or(StreamError::NotFound(*id))?;
        info!("Restarting stream '{}'", stream.name);

        if matches!(
            stream.status,
            StreamStatus::Active | StreamStatus::Starting | StreamStatus::Error
        ) {
            if let Err(e) = self.stop_stream(id).await {
                warn!("Stop before restart of stream {} failed: {}", id, e);
            }
        }

        tokio::time::sleep(self.inner.restart_grace).await;
        self.start_stream(id).await
    }

    fn require_pipeline(&self, id: &StreamId) -> Result<PipelineId, StreamError> {
        let pipeline_id = {
            let streams = self.inner.streams.read();
            let stream = streams.get(id).ok_or(StreamError::NotFound(*id))?;
            stream.pipeline_id.clone()
        };
        match pipeline_id {
            Some(pipeline_id) if self.inner.pipelines.get_pipeline(&pipeline_id).is_some() => {
                Ok(pipeline_id)
            }
            _ => Err(StreamError::NoPipeline(*id)),
        }
    }

    /// Mutate a stream record and notify observers with the new snapshot.
    fn update(&self, id: &StreamId, f: impl FnOnce(&mut Stream)) -> Result<Stream, StreamError> {
        let stream = {
            let mut streams = self.inner.streams.write();
            let stream = streams.get_mut(id).ok_or(StreamError::NotFound(*id))?;
            f(stream);
            stream.clone()
        };
        let snapshot = self.with_pipeline(stream);
        self.inner
            .observers
            .notify(&StreamEvent::Changed(snapshot.clone()));
        Ok(snapshot)
    }

    fn with_pipeline(&self, mut stream: Stream) -> Stream {
        stream.pipeline = stream
            .pipeline_id
            .as_deref()
            .and_then(|pid| self.inner.pipelines.get_pipeline(pid));
        stream
    }

    /// Statistics to sample for health checks; only active streams count.
    fn stats_for(&self, id: &StreamId) -> Option<PipelineStats> {
        let pipeline_id = {
            let streams = self.inner.streams.read();
            let stream = streams.get(id)?;
            if stream.status != StreamStatus::Active {
                return None;
            }
            stream.pipeline_id.clone()?
        };
        self.inner
            .pipelines
            .get_pipeline(&pipeline_id)
            .map(|pipeline| pipeline.stats)
    }

    fn on_pipeline_event(&self, event: &PipelineEvent) {
        let PipelineEvent::Updated(pipeline) = event else {
            return;
        };

        let snapshot = {
            let mut streams = self.inner.streams.write();
            let Some(stream) = streams
                .values_mut()
                .find(|s| s.pipeline_id.as_deref() == Some(pipeline.id.as_str()))
            else {
                return;
            };

            if pipeline.state() == PipelineState::Error && stream.status.is_running() {
                let message = pipeline
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Pipeline error".to_string());
                warn!("Stream '{}' failed: {}", stream.name, message);
                stream.set_status(StreamStatus::Error);
                stream
                    .metadata
                    .insert(ERROR_METADATA_KEY.to_string(), message);
            }

            let mut snapshot = stream.clone();
            snapshot.pipeline = Some(pipeline.clone());
            snapshot
        };

        self.inner.observers.notify(&StreamEvent::Changed(snapshot));
    }

    fn on_health_notice(&self, notice: &HealthNotice) {
        let Some(stream) = self.get_stream(&notice.stream_id) else {
            return;
        };
        let report = &notice.report;

        if report.severity < Severity::Critical {
            warn!(
                "Stream '{}' is {}: {}",
                stream.name, report.status, report.reason
            );
            self.inner.observers.notify(&StreamEvent::HealthWarning {
                stream_id: stream.id,
                report: report.clone(),
            });
            return;
        }

        if self.is_restarting(&stream.id) {
            debug!("Stream '{}' is critical but already restarting", stream.name);
            return;
        }

        warn!(
            "Stream '{}' is critical ({}), restarting",
            stream.name, report.reason
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!("No async runtime available to restart stream {}", stream.id);
            return;
        };
        let manager = self.clone();
        let id = stream.id;
        handle.spawn(async move {
            if let Err(e) = manager.restart_stream(&id).await {
                error!("Automatic restart of stream {} failed: {}", id, e);
            }
        });
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<StreamManager> {
    weak.upgrade().map(|inner| StreamManager { inner })
}
