//! Admission control for new streams.
//!
//! Resource needs are estimated per stream type and summed over every
//! current allocation. Usage is advisory: nothing here measures what the
//! backend actually consumes.

use crate::config::ResourceLimits;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use streamctl_types::{StreamId, StreamPriority, StreamType};
use thiserror::Error;
use tracing::{debug, info};

/// Estimated need of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceEstimate {
    /// CPU in percent
    pub cpu: f64,
    pub memory_mb: f64,
    pub bandwidth_mbps: f64,
}

/// Static estimate for a stream type.
pub fn estimate(stream_type: StreamType) -> ResourceEstimate {
    let (cpu, memory_mb, bandwidth_mbps) = match stream_type {
        StreamType::Transcode => (25.0, 512.0, 10.0),
        StreamType::Recording => (15.0, 256.0, 8.0),
        StreamType::Relay => (8.0, 192.0, 10.0),
        StreamType::Live => (5.0, 128.0, 5.0),
    };
    ResourceEstimate {
        cpu,
        memory_mb,
        bandwidth_mbps,
    }
}

/// Admission rejection. The message names the first exceeded dimension.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceError {
    #[error("Insufficient CPU resources")]
    InsufficientCpu { required: f64, available: f64 },

    #[error("Insufficient memory resources")]
    InsufficientMemory { required: f64, available: f64 },

    #[error("Insufficient bandwidth resources")]
    InsufficientBandwidth { required: f64, available: f64 },
}

/// Result of an availability check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Availability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceAllocation {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub priority: StreamPriority,
    pub estimate: ResourceEstimate,
    pub allocated_at: DateTime<Utc>,
}

/// Aggregate of every current allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory_mb: f64,
    pub bandwidth_mbps: f64,
    pub streams: usize,
}

pub struct ResourceAllocator {
    limits: ResourceLimits,
    allocations: Mutex<HashMap<StreamId, ResourceAllocation>>,
}

impl ResourceAllocator {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Whether a stream of this type would fit next to the current allocations.
    ///
    /// Priority does not change the verdict; see [`Self::can_preempt`].
    pub fn check_availability(
        &self,
        stream_type: StreamType,
        _priority: StreamPriority,
    ) -> Availability {
        let allocations = self.allocations.lock();
        match self.admit(&allocations, stream_type) {
            Ok(()) => Availability {
                available: true,
                reason: None,
            },
            Err(e) => Availability {
                available: false,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Record an allocation without checking limits.
    pub fn allocate(&self, stream_id: StreamId, stream_type: StreamType, priority: StreamPriority) {
        let allocation = new_allocation(stream_id, stream_type, priority);
        self.allocations.lock().insert(stream_id, allocation);
        debug!("Allocated resources for {} stream {}", stream_type, stream_id);
    }

    /// Check and allocate in one step, so concurrent admissions cannot
    /// jointly exceed the limits.
    pub fn try_allocate(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        priority: StreamPriority,
    ) -> Result<ResourceAllocation, ResourceError> {
        let mut allocations = self.allocations.lock();
        if let Err(e) = self.admit(&allocations, stream_type) {
            info!("Rejected {} stream {}: {}", stream_type, stream_id, e);
            return Err(e);
        }
        let allocation = new_allocation(stream_id, stream_type, priority);
        allocations.insert(stream_id, allocation.clone());
        debug!("Allocated resources for {} stream {}", stream_type, stream_id);
        Ok(allocation)
    }

    /// Remove an allocation. Unknown ids are ignored.
    pub fn release(&self, stream_id: &StreamId) -> Option<ResourceAllocation> {
        let released = self.allocations.lock().remove(stream_id);
        if released.is_some() {
            debug!("Released resources for stream {}", stream_id);
        }
        released
    }

    /// Preemption candidates for a request of the given priority.
    ///
    /// Only critical requests may preempt, and only low-priority streams are
    /// candidates. Evicting them is up to the caller.
    pub fn can_preempt(&self, priority: StreamPriority) -> Vec<StreamId> {
        if priority != StreamPriority::Critical {
            return Vec::new();
        }
        let mut candidates: Vec<(DateTime<Utc>, StreamId)> = self
            .allocations
            .lock()
            .values()
            .filter(|a| a.priority == StreamPriority::Low)
            .map(|a| (a.allocated_at, a.stream_id))
            .collect();
        candidates.sort();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    pub fn allocation(&self, stream_id: &StreamId) -> Option<ResourceAllocation> {
        self.allocations.lock().get(stream_id).cloned()
    }

    pub fn usage(&self) -> ResourceUsage {
        usage_of(&self.allocations.lock())
    }

    fn admit(
        &self,
        allocations: &HashMap<StreamId, ResourceAllocation>,
        stream_type: StreamType,
    ) -> Result<(), ResourceError> {
        let need = estimate(stream_type);
        let used = usage_of(allocations);

        let available = self.limits.max_cpu - used.cpu;
        if need.cpu > available {
            return Err(ResourceError::InsufficientCpu {
                required: need.cpu,
                available,
            });
        }
        let available = self.limits.max_memory_mb - used.memory_mb;
        if need.memory_mb > available {
            return Err(ResourceError::InsufficientMemory {
                required: need.memory_mb,
                available,
            });
        }
        let available = self.limits.max_bandwidth_mbps - used.bandwidth_mbps;
        if need.bandwidth_mbps > available {
            return Err(ResourceError::InsufficientBandwidth {
                required: need.bandwidth_mbps,
                available,
            });
        }
        Ok(())
    }
}

fn new_allocation(
    stream_id: StreamId,
    stream_type: StreamType,
    priority: StreamPriority,
) -> ResourceAllocation {
    ResourceAllocation {
        stream_id,
        stream_type,
        priority,
        estimate: estimate(stream_type),
        allocated_at: Utc::now(),
    }
}

fn usage_of(allocations: &HashMap<StreamId, ResourceAllocation>) -> ResourceUsage {
    allocations
        .values()
        .fold(ResourceUsage::default(), |mut usage, allocation| {
            usage.cpu += allocation.estimate.cpu;
            usage.memory_mb += allocation.estimate.memory_mb;
            usage.bandwidth_mbps += allocation.estimate.bandwidth_mbps;
            usage.streams += 1;
            usage
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn limits(cpu: f64, memory: f64, bandwidth: f64) -> ResourceLimits {
        ResourceLimits {
            max_cpu: cpu,
            max_memory_mb: memory,
            max_bandwidth_mbps: bandwidth,
        }
    }

    #[test]
    fn test_estimates_are_ordered_by_cost() {
        let order = [
            StreamType::Transcode,
            StreamType::Recording,
            StreamType::Relay,
            StreamType::Live,
        ];
        for pair in order.windows(2) {
            assert!(estimate(pair[0]).cpu > estimate(pair[1]).cpu);
            assert!(estimate(pair[0]).memory_mb > estimate(pair[1]).memory_mb);
        }
    }

    #[test]
    fn test_low_cpu_limit_rejects_transcode() {
        let allocator = ResourceAllocator::new(limits(10.0, 4096.0, 100.0));
        let availability = allocator.check_availability(StreamType::Transcode, StreamPriority::Normal);
        assert_eq!(
            availability,
            Availability {
                available: false,
                reason: Some("Insufficient CPU resources".to_string()),
            }
        );
        assert!(allocator.check_availability(StreamType::Live, StreamPriority::Normal).available);
    }

    #[test]
    fn test_cumulative_allocation_reaches_each_dimension() {
        // Eight live streams use 40% CPU, 1024 MB and exactly 40 Mbps
        let allocator = ResourceAllocator::new(limits(80.0, 4096.0, 40.0));
        for _ in 0..8 {
            allocator
                .try_allocate(Uuid::new_v4(), StreamType::Live, StreamPriority::Normal)
                .unwrap();
        }
        let availability = allocator.check_availability(StreamType::Live, StreamPriority::Normal);
        assert_eq!(availability.reason.as_deref(), Some("Insufficient bandwidth resources"));

        let allocator = ResourceAllocator::new(limits(80.0, 300.0, 100.0));
        allocator.allocate(Uuid::new_v4(), StreamType::Recording, StreamPriority::Normal);
        let availability = allocator.check_availability(StreamType::Live, StreamPriority::Normal);
        assert_eq!(availability.reason.as_deref(), Some("Insufficient memory resources"));
    }

    #[test]
    fn test_cpu_is_reported_before_memory() {
        let allocator = ResourceAllocator::new(limits(1.0, 1.0, 1.0));
        let err = allocator
            .try_allocate(Uuid::new_v4(), StreamType::Relay, StreamPriority::High)
            .unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientCpu { .. }));
        assert_eq!(allocator.usage().streams, 0);
    }

    #[test]
    fn test_allocate_is_unconditional_and_release_idempotent() {
        let allocator = ResourceAllocator::new(limits(10.0, 100.0, 1.0));
        let id = Uuid::new_v4();
        allocator.allocate(id, StreamType::Transcode, StreamPriority::Normal);
        assert_eq!(allocator.usage().cpu, 25.0);

        assert!(allocator.release(&id).is_some());
        assert!(allocator.release(&id).is_none());
        assert_eq!(allocator.usage(), ResourceUsage::default());
    }

    #[test]
    fn test_only_critical_requests_preempt_low_streams() {
        let allocator = ResourceAllocator::new(ResourceLimits::default());
        let low = Uuid::new_v4();
        allocator.allocate(low, StreamType::Live, StreamPriority::Low);
        allocator.allocate(Uuid::new_v4(), StreamType::Live, StreamPriority::Normal);

        assert_eq!(allocator.can_preempt(StreamPriority::Critical), vec![low]);
        assert!(allocator.can_preempt(StreamPriority::High).is_empty());
    }
}
