//! # Client Metrics
//!
//! Lightweight atomic counters for the scheduler and connections. The
//! queue-depth and outstanding gauges live with their owners; this module
//! aggregates the monotonic event counters an operator watches to spot a
//! starving queue or a flapping node.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of all client counters at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Queries accepted by `get`/`set`.
    pub enqueued: u64,
    /// Terminal results handed to the consumer.
    pub delivered: u64,
    /// Queries put back on the queue after a connection failure.
    pub requeued: u64,
    /// Queries failed after exhausting their retry budget.
    pub dead_lettered: u64,
    /// GET queries that hit their deadline before a response.
    pub timed_out: u64,
    /// Socket (re)connect attempts issued.
    pub connects: u64,
}

/// Thread-safe counter set shared by every task in one client.
///
/// `Ordering::Relaxed` is sufficient: the counters are independent and only
/// need eventual consistency for observation.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    timed_out: AtomicU64,
    connects: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        ClientMetrics::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = ClientMetrics::new();
        metrics.record_enqueued();
        metrics.record_enqueued();
        metrics.record_delivered();
        metrics.record_timed_out();

        let snap = metrics.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.delivered, 1);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.requeued, 0);
        assert_eq!(snap.dead_lettered, 0);
        assert_eq!(snap.connects, 0);
    }
}
