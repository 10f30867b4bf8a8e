//! Liveness activity counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time view of liveness metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LivenessMetricsSnapshot {
    pub heartbeat_successes: u64,
    pub heartbeat_failures: u64,
    pub epoch_increments: u64,
    pub heartbeat_latency_count: u64,
    pub heartbeat_latency_total_nanos: u64,
    pub heartbeat_latency_max_nanos: u64,
    /// Live nodes visible to this node; 0 when this node is not itself live.
    pub live_nodes: u64,
}

#[derive(Default)]
pub(crate) struct LivenessMetrics {
    heartbeat_successes: AtomicU64,
    heartbeat_failures: AtomicU64,
    epoch_increments: AtomicU64,
    heartbeat_latency_count: AtomicU64,
    heartbeat_latency_total_nanos: AtomicU64,
    heartbeat_latency_max_nanos: AtomicU64,
}

impl LivenessMetrics {
    pub fn record_heartbeat_success(&self) {
        self.heartbeat_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_epoch_increment(&self) {
        self.epoch_increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_latency(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.heartbeat_latency_count.fetch_add(1, Ordering::Relaxed);
        self.heartbeat_latency_total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.heartbeat_latency_max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self, live_nodes: u64) -> LivenessMetricsSnapshot {
        LivenessMetricsSnapshot {
            heartbeat_successes: self.heartbeat_successes.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            epoch_increments: self.epoch_increments.load(Ordering::Relaxed),
            heartbeat_latency_count: self.heartbeat_latency_count.load(Ordering::Relaxed),
            heartbeat_latency_total_nanos: self
                .heartbeat_latency_total_nanos
                .load(Ordering::Relaxed),
            heartbeat_latency_max_nanos: self.heartbeat_latency_max_nanos.load(Ordering::Relaxed),
            live_nodes,
        }
    }
}
