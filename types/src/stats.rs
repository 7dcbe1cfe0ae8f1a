//! Statistics reported by the backend for running pipelines.

use serde::{Deserialize, Serialize};

/// Last observed statistics snapshot of a pipeline.
///
/// Every field is optional because the backend only reports what the
/// pipeline's elements can measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// Buffer fill level in percent (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_health: Option<f64>,
    /// Current bitrate in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
    /// Total frames received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_received: Option<u64>,
    /// Total frames dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_dropped: Option<u64>,
    /// End-to-end latency in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    /// Jitter in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl PipelineStats {
    /// Percentage of frames dropped, when both counters are known.
    pub fn drop_rate(&self) -> Option<f64> {
        let received = self.frames_received?;
        let dropped = self.frames_dropped?;
        let total = received + dropped;
        if total == 0 {
            return Some(0.0);
        }
        Some(dropped as f64 / total as f64 * 100.0)
    }

    /// Whether no statistic has been reported at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
