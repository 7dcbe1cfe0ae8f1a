//! Stream definitions.
//!
//! A stream is one user-intended media flow: a pipeline plus the scheduling,
//! priority and resource metadata the control layer needs.

use crate::pipeline::{Pipeline, PipelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a stream.
pub type StreamId = Uuid;

/// What a stream does with its media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Low-latency viewing
    Live,
    /// Written to storage
    Recording,
    /// Decoded and re-encoded
    Transcode,
    /// Forwarded without decoding
    Relay,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Recording => write!(f, "recording"),
            Self::Transcode => write!(f, "transcode"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "recording" => Ok(Self::Recording),
            "transcode" => Ok(Self::Transcode),
            "relay" => Ok(Self::Relay),
            other => Err(format!("unknown stream type: {}", other)),
        }
    }
}

/// Scheduling priority, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum StreamPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for StreamPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for StreamPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Idle,
    Starting,
    Active,
    Paused,
    Error,
    Stopping,
    Terminated,
}

impl StreamStatus {
    /// Whether the stream is running or on its way there.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active | Self::Starting)
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
            Self::Stopping => write!(f, "stopping"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Kind of media source feeding a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic test pattern
    Test,
    Rtsp,
    Srt,
    Udp,
    File,
    Http,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "rtsp" => Ok(Self::Rtsp),
            "srt" => Ok(Self::Srt),
            "udp" => Ok(Self::Udp),
            "file" => Ok(Self::File),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Where a stream's media comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub kind: SourceKind,
    /// URI, path or port depending on the kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl StreamSource {
    pub fn new(kind: SourceKind, uri: Option<String>) -> Self {
        Self { kind, uri }
    }

    /// A synthetic test source.
    pub fn test() -> Self {
        Self::new(SourceKind::Test, None)
    }
}

/// Kind of output a stream writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    File,
    Srt,
    Rtmp,
    Udp,
    /// Discard output (useful for monitoring-only pipelines)
    Null,
}

impl std::str::FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "srt" => Ok(Self::Srt),
            "rtmp" => Ok(Self::Rtmp),
            "udp" => Ok(Self::Udp),
            "null" => Ok(Self::Null),
            other => Err(format!("unknown destination kind: {}", other)),
        }
    }
}

/// Where a stream's media goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDestination {
    pub kind: DestinationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl StreamDestination {
    pub fn new(kind: DestinationKind, uri: Option<String>) -> Self {
        Self { kind, uri }
    }
}

/// Request to create a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub name: String,
    pub stream_type: StreamType,
    pub source: StreamSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<StreamDestination>,
    #[serde(default)]
    pub priority: StreamPriority,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateStreamRequest {
    pub fn new(name: impl Into<String>, stream_type: StreamType, source: StreamSource) -> Self {
        Self {
            name: name.into(),
            stream_type,
            source,
            destination: None,
            priority: StreamPriority::default(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_destination(mut self, destination: StreamDestination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_priority(mut self, priority: StreamPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A stream record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub name: String,
    pub stream_type: StreamType,
    pub source: StreamSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<StreamDestination>,
    pub priority: StreamPriority,
    pub status: StreamStatus,
    /// Backing pipeline id, once built
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<PipelineId>,
    /// Snapshot of the backing pipeline, filled in when a snapshot is taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Stream {
    /// Create an idle stream from a request.
    pub fn from_request(request: CreateStreamRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            stream_type: request.stream_type,
            source: request.source,
            destination: request.destination,
            priority: request.priority,
            status: StreamStatus::Idle,
            pipeline_id: None,
            pipeline: None,
            created_at: now,
            updated_at: now,
            metadata: request.metadata,
        }
    }

    /// Change status and bump the update timestamp.
    pub fn set_status(&mut self, status: StreamStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
