//! Throughput and outcome counters for the reconstruction engine

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the engine while it runs
#[derive(Debug, Default)]
pub struct ReconstructionMetrics {
    /// Events accepted on the input port
    pub events_received: AtomicU64,
    /// Events discarded without being buffered (eoi collisions, assembly
    /// rejects)
    pub events_dropped: AtomicU64,
    /// Traces emitted on the valid output
    pub traces_valid: AtomicU64,
    /// Traces emitted on the invalid output
    pub traces_invalid: AtomicU64,
    /// Traces evicted by the timeout sweep
    pub traces_timed_out: AtomicU64,
    /// Pending traces flushed at graceful termination
    pub traces_flushed: AtomicU64,
}

impl ReconstructionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            traces_valid: self.traces_valid.load(Ordering::Relaxed),
            traces_invalid: self.traces_invalid.load(Ordering::Relaxed),
            traces_timed_out: self.traces_timed_out.load(Ordering::Relaxed),
            traces_flushed: self.traces_flushed.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`ReconstructionMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_dropped: u64,
    pub traces_valid: u64,
    pub traces_invalid: u64,
    pub traces_timed_out: u64,
    pub traces_flushed: u64,
}
