//! Pipeline state definitions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a backend pipeline.
///
/// The first four states correspond to the GStreamer GST_STATE enum. The
/// remaining ones describe network-fed pipelines whose data flow is tracked
/// separately from the element state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// No state has been set (initial state)
    #[default]
    Null,
    /// The pipeline is ready to go to PAUSED
    Ready,
    /// The pipeline is paused
    Paused,
    /// The pipeline is playing/running
    Playing,
    /// Connecting to the upstream source
    Connecting,
    /// Upstream was lost, trying to get it back
    Reconnecting,
    /// Data is flowing from the source
    Receiving,
    /// Waiting for enough data to continue
    Buffering,
    /// The pipeline failed
    Error,
    /// The upstream source went away
    Disconnected,
}

impl PipelineState {
    /// Whether the pipeline is doing work, or trying to.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Playing | Self::Receiving | Self::Buffering | Self::Reconnecting | Self::Connecting
        )
    }

    /// Whether media data is actually flowing.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Receiving | Self::Playing)
    }

    /// Whether the pipeline is at rest and a stop would be a no-op.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Null | Self::Ready | Self::Paused)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Ready => write!(f, "READY"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Receiving => write!(f, "RECEIVING"),
            Self::Buffering => write!(f, "BUFFERING"),
            Self::Error => write!(f, "ERROR"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}
