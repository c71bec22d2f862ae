//! Time sources for probes and tests

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Supplies the entry/exit timestamps recorded in execution events
pub trait TimeSource: Send + Sync {
    /// Current time in nanoseconds
    fn now_nanos(&self) -> i64;
}

/// Wall-clock time source
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_nanos(&self) -> i64 {
        // timestamp_nanos_opt only fails past the year 2262
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000))
    }
}

/// Manually advanced time source for deterministic tests
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_nanos: i64) -> Self {
        Self {
            now: AtomicI64::new(start_nanos),
        }
    }

    pub fn advance(&self, nanos: i64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_is_monotone_enough() {
        let ts = SystemTimeSource;
        let a = ts.now_nanos();
        let b = ts.now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn manual_time_advances() {
        let ts = ManualTimeSource::new(100);
        assert_eq!(ts.now_nanos(), 100);
        ts.advance(50);
        assert_eq!(ts.now_nanos(), 150);
    }
}
