//! Shared types for the streamctl control layer.
//!
//! This crate contains the wire protocol spoken with the GStreamer pipeline
//! backend and the domain models (pipelines, streams, health verdicts) shared
//! by every consumer of the control client.

/// Default port of the pipeline backend.
pub const DEFAULT_PORT: u16 = 8080;

/// Default WebSocket path of the pipeline backend.
pub const DEFAULT_WS_PATH: &str = "/gstreamer";

pub mod element;
pub mod health;
pub mod messages;
pub mod pipeline;
pub mod state;
pub mod stats;
pub mod stream;

// Re-export commonly used types
pub use element::{launch_line, ElementDescriptor, PropertyValue};
pub use health::{HealthReport, HealthStatus, Severity};
pub use messages::{ClientMessage, Frame, ProtocolError, ServerMessage, ServerMessageKind};
pub use pipeline::{new_pipeline_id, Pipeline, PipelineId, PipelineSnapshot, Reconciled};
pub use state::PipelineState;
pub use stats::PipelineStats;
pub use stream::{
    CreateStreamRequest, DestinationKind, SourceKind, Stream, StreamDestination, StreamId,
    StreamPriority, StreamSource, StreamStatus, StreamType,
};
