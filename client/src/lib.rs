//! streamctl control library.
//!
//! Client-side connection and stream lifecycle layer for a GStreamer pipeline
//! backend: a reconnecting WebSocket transport, a mirrored pipeline state
//! machine, admission control, health monitoring and stream orchestration.

use std::sync::Arc;

pub mod config;
pub mod endpoints;
pub mod health;
pub mod logging;
pub mod observers;
pub mod pipeline;
pub mod resources;
pub mod streams;
pub mod transport;

use config::Config;
use endpoints::{candidate_urls, EndpointEnv};
use health::{HealthError, HealthMonitor};
use pipeline::PipelineClient;
use resources::ResourceAllocator;
use streams::StreamManager;
use transport::{Connection, TransportError};

/// Every service of the control layer, wired together.
///
/// Each context owns its own connection, so several can coexist (tests run
/// one per mock backend).
#[derive(Clone)]
pub struct ControlContext {
    pub connection: Connection,
    pub pipelines: PipelineClient,
    pub resources: Arc<ResourceAllocator>,
    pub health: HealthMonitor,
    pub streams: StreamManager,
}

impl ControlContext {
    /// Build a context whose endpoint candidates come from the configuration
    /// and the `GSTREAMER_WS_*` environment variables.
    pub fn new(config: &Config) -> Result<Self, HealthError> {
        let endpoints = candidate_urls(&config.connection.urls, &EndpointEnv::from_env());
        Self::with_endpoints(config, endpoints)
    }

    /// Build a context with an explicit candidate list.
    pub fn with_endpoints(config: &Config, endpoints: Vec<String>) -> Result<Self, HealthError> {
        let connection = Connection::new(config.connection.clone(), endpoints);
        let pipelines = PipelineClient::new(connection.clone(), config.connection.command_timeout());
        let resources = Arc::new(ResourceAllocator::new(config.resources.clone()));
        let health = HealthMonitor::new(&config.health)?;
        let streams = StreamManager::new(
            Arc::new(pipelines.clone()),
            resources.clone(),
            health.clone(),
            &config.streams,
        );

        Ok(Self {
            connection,
            pipelines,
            resources,
            health,
            streams,
        })
    }

    /// Connect to the backend and start health monitoring.
    pub async fn start(&self) -> Result<String, TransportError> {
        let endpoint = self.connection.connect().await?;
        self.streams.start_health_monitoring();
        Ok(endpoint)
    }

    /// Stop health monitoring and close the connection.
    pub fn shutdown(&self) {
        self.health.stop();
        self.connection.disconnect();
    }
}
