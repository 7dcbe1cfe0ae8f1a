//! Periodic health checks for registered streams.
//!
//! A check turns the latest pipeline statistics into a [`HealthReport`].
//! Each metric is judged on its own and the worst severity wins:
//!
//! | Metric        | Warning            | Critical            |
//! |---------------|--------------------|---------------------|
//! | buffer health | < 30% (medium)     | < 10% (critical)    |
//! | drop rate     | > 5% (high)        | > 20% (critical)    |
//! | latency       | > 2000 ms (medium) | > 5000 ms (high)    |
//!
//! Only reports that are not healthy reach the registered callbacks.

use crate::config::HealthConfig;
use crate::observers::{Observers, Subscription};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use streamctl_types::{HealthReport, HealthStatus, PipelineStats, Severity, StreamId};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BUFFER_WARNING_PERCENT: f64 = 30.0;
pub const BUFFER_CRITICAL_PERCENT: f64 = 10.0;
pub const DROP_RATE_WARNING_PERCENT: f64 = 5.0;
pub const DROP_RATE_CRITICAL_PERCENT: f64 = 20.0;
pub const LATENCY_WARNING_MS: f64 = 2000.0;
pub const LATENCY_CRITICAL_MS: f64 = 5000.0;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Health check interval must be greater than zero")]
    InvalidInterval,
}

/// A non-healthy verdict for one stream.
#[derive(Debug, Clone)]
pub struct HealthNotice {
    pub stream_id: StreamId,
    pub report: HealthReport,
}

/// Resolves a stream to its pipeline's latest statistics.
///
/// Returns `None` for streams that have nothing to sample.
pub type StatsLookup = Arc<dyn Fn(&StreamId) -> Option<PipelineStats> + Send + Sync>;

/// Compute a health verdict from a statistics snapshot.
pub fn evaluate(stats: &PipelineStats) -> HealthReport {
    let mut metrics = BTreeMap::new();
    let mut issues: Vec<String> = Vec::new();
    let mut worst: Option<Severity> = None;
    let mut raise = |severity: Severity, issue: String| {
        worst = Some(worst.map_or(severity, |w| w.max(severity)));
        issues.push(issue);
    };

    let buffer = stats.buffer_health.unwrap_or(100.0);
    metrics.insert("bufferHealth".to_string(), buffer);
    if buffer < BUFFER_CRITICAL_PERCENT {
        raise(Severity::Critical, format!("Critical buffer level: {:.0}%", buffer));
    } else if buffer < BUFFER_WARNING_PERCENT {
        raise(Severity::Medium, format!("Low buffer level: {:.0}%", buffer));
    }

    if let Some(drop_rate) = stats.drop_rate() {
        metrics.insert("dropRate".to_string(), drop_rate);
        if drop_rate > DROP_RATE_CRITICAL_PERCENT {
            raise(Severity::Critical, format!("Critical frame drop rate: {:.1}%", drop_rate));
        } else if drop_rate > DROP_RATE_WARNING_PERCENT {
            raise(Severity::High, format!("High frame drop rate: {:.1}%", drop_rate));
        }
    }

    if let Some(latency) = stats.latency {
        metrics.insert("latency".to_string(), latency);
        if latency > LATENCY_CRITICAL_MS {
            raise(Severity::High, format!("Very high latency: {:.0}ms", latency));
        } else if latency > LATENCY_WARNING_MS {
            raise(Severity::Medium, format!("High latency: {:.0}ms", latency));
        }
    }

    if let Some(bitrate) = stats.bitrate {
        metrics.insert("bitrate".to_string(), bitrate);
    }
    if let Some(dropped) = stats.frames_dropped {
        metrics.insert("framesDropped".to_string(), dropped as f64);
    }

    match worst {
        None => HealthReport {
            status: HealthStatus::Healthy,
            severity: Severity::Low,
            reason: "Stream is healthy".to_string(),
            metrics,
        },
        Some(severity) => HealthReport {
            status: if severity >= Severity::High {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            },
            severity,
            reason: issues.join("; "),
            metrics,
        },
    }
}

struct Inner {
    interval: Duration,
    streams: Mutex<HashSet<StreamId>>,
    callbacks: Observers<HealthNotice>,
    timer: Mutex<Option<CancellationToken>>,
}

/// Health monitor. Cheap to clone.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Result<Self, HealthError> {
        if config.interval_ms == 0 {
            return Err(HealthError::InvalidInterval);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                interval: config.interval(),
                streams: Mutex::new(HashSet::new()),
                callbacks: Observers::new(),
                timer: Mutex::new(None),
            }),
        })
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn register_stream(&self, stream_id: StreamId) {
        self.inner.streams.lock().insert(stream_id);
    }

    pub fn unregister_stream(&self, stream_id: &StreamId) {
        self.inner.streams.lock().remove(stream_id);
    }

    pub fn is_registered(&self, stream_id: &StreamId) -> bool {
        self.inner.streams.lock().contains(stream_id)
    }

    pub fn registered_streams(&self) -> Vec<StreamId> {
        self.inner.streams.lock().iter().copied().collect()
    }

    /// Register a callback for non-healthy verdicts.
    pub fn on_unhealthy(
        &self,
        callback: impl Fn(&HealthNotice) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.callbacks.subscribe(callback)
    }

    /// Check one stream without notifying anyone.
    pub fn check_stream(&self, stream_id: &StreamId, lookup: &StatsLookup) -> Option<HealthReport> {
        lookup(stream_id).map(|stats| evaluate(&stats))
    }

    /// Run one round of checks over every registered stream.
    ///
    /// Returns the notices that were delivered.
    pub fn run_checks(&self, lookup: &StatsLookup) -> Vec<HealthNotice> {
        let mut notices = Vec::new();
        for stream_id in self.registered_streams() {
            // Unregistered while this round was running
            if !self.is_registered(&stream_id) {
                continue;
            }
            let Some(report) = self.check_stream(&stream_id, lookup) else {
                continue;
            };
            if report.is_healthy() {
                continue;
            }
            debug!(
                "Stream {} is {} ({}): {}",
                stream_id, report.status, report.severity, report.reason
            );
            let notice = HealthNotice { stream_id, report };
            self.inner.callbacks.notify(&notice);
            notices.push(notice);
        }
        notices
    }

    /// Start the periodic timer. Restarting replaces the previous timer.
    pub fn start(&self, lookup: StatsLookup) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let monitor = self.clone();
        let interval = self.inner.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Health monitoring started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let notices = monitor.run_checks(&lookup);
                        if !notices.is_empty() {
                            warn!("{} stream(s) need attention", notices.len());
                        }
                    }
                }
            }
            debug!("Health monitoring stopped");
        });
    }

    /// Stop the periodic timer.
    pub fn stop(&self) {
        if let Some(token) = self.inner.timer.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }
}
