//! Wire protocol between the control client and the pipeline backend.
//!
//! Every WebSocket text frame is a JSON object
//! `{"type": ..., "payload": {...}, "id"?: ..., "timestamp"?: ...}`.
//! Frames are decoded into [`ServerMessage`] / [`ClientMessage`] so that the
//! rest of the code dispatches on typed variants instead of strings.

use crate::element::ElementDescriptor;
use crate::pipeline::{PipelineId, PipelineSnapshot};
use crate::state::PipelineState;
use crate::stats::PipelineStats;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors decoding or encoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Frame {
    fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            id: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        // Backends omit the payload for messages without fields
        let value = if self.payload.is_null() {
            Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
            kind: self.kind.clone(),
            source,
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    // Serializing plain structs into a Value cannot fail
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ============================================================================
// Client -> server
// ============================================================================

/// Pipeline definition carried by `createPipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub elements: Vec<ElementDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePipelinePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PipelineId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub pipeline: PipelineDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRef {
    pub id: PipelineId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Empty {}

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CreatePipeline(CreatePipelinePayload),
    StartPipeline(PipelineRef),
    StopPipeline(PipelineRef),
    DeletePipeline(PipelineRef),
    GetPipelines,
    Ping(PingPayload),
}

impl ClientMessage {
    pub fn start(id: impl Into<PipelineId>) -> Self {
        Self::StartPipeline(PipelineRef { id: id.into() })
    }

    pub fn stop(id: impl Into<PipelineId>) -> Self {
        Self::StopPipeline(PipelineRef { id: id.into() })
    }

    pub fn delete(id: impl Into<PipelineId>) -> Self {
        Self::DeletePipeline(PipelineRef { id: id.into() })
    }

    /// Liveness probe stamped with the current time.
    pub fn ping() -> Self {
        Self::Ping(PingPayload {
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreatePipeline(_) => "createPipeline",
            Self::StartPipeline(_) => "startPipeline",
            Self::StopPipeline(_) => "stopPipeline",
            Self::DeletePipeline(_) => "deletePipeline",
            Self::GetPipelines => "getPipelines",
            Self::Ping(_) => "ping",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Self::CreatePipeline(p) => to_payload(p),
            Self::StartPipeline(p) | Self::StopPipeline(p) | Self::DeletePipeline(p) => {
                to_payload(p)
            }
            Self::GetPipelines => to_payload(&Empty {}),
            Self::Ping(p) => to_payload(p),
        };
        Frame::new(self.kind(), payload)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_frame().to_text()
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(match frame.kind.as_str() {
            "createPipeline" => Self::CreatePipeline(frame.payload_as()?),
            "startPipeline" => Self::StartPipeline(frame.payload_as()?),
            "stopPipeline" => Self::StopPipeline(frame.payload_as()?),
            "deletePipeline" => Self::DeletePipeline(frame.payload_as()?),
            "getPipelines" => Self::GetPipelines,
            "ping" => Self::Ping(frame.payload_as()?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        })
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(&Frame::parse(text)?)
    }
}

// ============================================================================
// Server -> client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCreated {
    pub pipeline: PipelineSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDeleted {
    pub id: PipelineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStateChanged {
    pub id: PipelineId,
    pub state: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineErrorReport {
    /// Missing when the backend could not tell which pipeline was meant
    #[serde(default)]
    pub id: Option<PipelineId>,
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatsReport {
    pub id: PipelineId,
    pub stats: PipelineStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinesList {
    pub pipelines: Vec<PipelineSnapshot>,
}

/// Discriminant of [`ServerMessage`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMessageKind {
    PipelineCreated,
    PipelineDeleted,
    PipelineStateChanged,
    PipelineError,
    PipelineStats,
    PipelinesList,
    Pong,
}

impl ServerMessageKind {
    pub const ALL: [ServerMessageKind; 7] = [
        Self::PipelineCreated,
        Self::PipelineDeleted,
        Self::PipelineStateChanged,
        Self::PipelineError,
        Self::PipelineStats,
        Self::PipelinesList,
        Self::Pong,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::PipelineCreated => "pipelineCreated",
            Self::PipelineDeleted => "pipelineDeleted",
            Self::PipelineStateChanged => "pipelineStateChanged",
            Self::PipelineError => "pipelineError",
            Self::PipelineStats => "pipelineStats",
            Self::PipelinesList => "pipelinesList",
            Self::Pong => "pong",
        }
    }
}

/// Messages the backend pushes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    PipelineCreated(PipelineCreated),
    PipelineDeleted(PipelineDeleted),
    PipelineStateChanged(PipelineStateChanged),
    PipelineError(PipelineErrorReport),
    PipelineStats(PipelineStatsReport),
    PipelinesList(PipelinesList),
    Pong,
}

impl ServerMessage {
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            Self::PipelineCreated(_) => ServerMessageKind::PipelineCreated,
            Self::PipelineDeleted(_) => ServerMessageKind::PipelineDeleted,
            Self::PipelineStateChanged(_) => ServerMessageKind::PipelineStateChanged,
            Self::PipelineError(_) => ServerMessageKind::PipelineError,
            Self::PipelineStats(_) => ServerMessageKind::PipelineStats,
            Self::PipelinesList(_) => ServerMessageKind::PipelinesList,
            Self::Pong => ServerMessageKind::Pong,
        }
    }

    /// Pipeline the message refers to, if any.
    pub fn pipeline_id(&self) -> Option<&str> {
        match self {
            Self::PipelineCreated(m) => Some(&m.pipeline.id),
            Self::PipelineDeleted(m) => Some(&m.id),
            Self::PipelineStateChanged(m) => Some(&m.id),
            Self::PipelineError(m) => m.id.as_deref(),
            Self::PipelineStats(m) => Some(&m.id),
            Self::PipelinesList(_) | Self::Pong => None,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Self::PipelineCreated(m) => to_payload(m),
            Self::PipelineDeleted(m) => to_payload(m),
            Self::PipelineStateChanged(m) => to_payload(m),
            Self::PipelineError(m) => to_payload(m),
            Self::PipelineStats(m) => to_payload(m),
            Self::PipelinesList(m) => to_payload(m),
            Self::Pong => Value::Null,
        };
        Frame::new(self.kind().wire_name(), payload)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_frame().to_text()
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(match frame.kind.as_str() {
            "pipelineCreated" => Self::PipelineCreated(frame.payload_as()?),
            "pipelineDeleted" => Self::PipelineDeleted(frame.payload_as()?),
            "pipelineStateChanged" => Self::PipelineStateChanged(frame.payload_as()?),
            "pipelineError" => Self::PipelineError(frame.payload_as()?),
            "pipelineStats" => Self::PipelineStats(frame.payload_as()?),
            "pipelinesList" => Self::PipelinesList(frame.payload_as()?),
            "pong" => Self::Pong,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        })
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(&Frame::parse(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_backend_frames() {
        let created = r#"{"type":"pipelineCreated","payload":{"pipeline":{"id":"p1","description":"Test","state":"NULL","elements":[{"type":"videotestsrc","properties":{}}]}},"timestamp":1700000000000}"#;
        match ServerMessage::decode(created).unwrap() {
            ServerMessage::PipelineCreated(m) => {
                assert_eq!(m.pipeline.id, "p1");
                assert_eq!(m.pipeline.state, PipelineState::Null);
                assert_eq!(m.pipeline.elements.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let error = r#"{"type":"pipelineError","payload":{"id":null,"errorCode":"not-found","errorMessage":"Pipeline not found"}}"#;
        let message = ServerMessage::decode(error).unwrap();
        assert_eq!(message.kind(), ServerMessageKind::PipelineError);
        assert_eq!(message.pipeline_id(), None);

        // The backend sends pong without a payload
        let pong = r#"{"type":"pong","timestamp":5}"#;
        assert_eq!(ServerMessage::decode(pong).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn test_reject_malformed_frames() {
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"somethingElse","payload":{}}"#),
            Err(ProtocolError::UnknownType(kind)) if kind == "somethingElse"
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"pipelineStateChanged","payload":{"id":"p1","state":"UNKNOWN"}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_client_frames_match_backend_expectations() {
        let text = ClientMessage::start("p1").encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "startPipeline");
        assert_eq!(value["payload"]["id"], "p1");
        assert!(value["timestamp"].is_i64());

        let text = ClientMessage::GetPipelines.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["payload"], serde_json::json!({}));

        let create = ClientMessage::CreatePipeline(CreatePipelinePayload {
            id: Some("p2".to_string()),
            description: None,
            pipeline: PipelineDefinition {
                elements: vec![ElementDescriptor::new("fakesink")],
                options: None,
            },
        });
        let decoded = ClientMessage::decode(&create.encode().unwrap()).unwrap();
        assert_eq!(decoded, create);
    }
}
