//! Counters for the capture pipeline

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared capture counters
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub total_requests: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    // Rule outcomes
    pub blocked: AtomicU64,
    pub short_circuited: AtomicU64,
    pub modified: AtomicU64,
    pub delayed: AtomicU64,
    /// Capture events the store could not write
    pub persistence_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rules: RuleMetrics,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMetrics {
    pub blocked: u64,
    pub short_circuited: u64,
    pub modified: u64,
    pub delayed: u64,
}

impl CaptureMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rules: RuleMetrics {
                blocked: self.blocked.load(Ordering::Relaxed),
                short_circuited: self.short_circuited.load(Ordering::Relaxed),
                modified: self.modified.load(Ordering::Relaxed),
                delayed: self.delayed.load(Ordering::Relaxed),
            },
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}
