//! Campaign metrics.
//!
//! Each worker owns one slot and is its only writer; the fuzzer (and any
//! consumer holding a handle) aggregates the slots read-only, so no locking
//! is involved on either side.

use std::sync::atomic::{AtomicU64, Ordering};

/// The metric slot of one worker index. Slots survive worker respawns.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Call sequences fully processed by this worker index.
    pub sequences_tested: AtomicU64,
    /// Individual calls executed, including during shrinking.
    pub calls_tested: AtomicU64,
    /// Gas consumed by executed calls.
    pub gas_used: AtomicU64,
    /// How many times a worker was (re)started on this index.
    pub worker_startup_count: AtomicU64,
}

/// Metrics for a whole campaign, one slot per worker index.
#[derive(Debug)]
pub struct FuzzerMetrics {
    workers: Box<[WorkerMetrics]>,
}

/// A point-in-time aggregation of all worker slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sequences_tested: u64,
    pub calls_tested: u64,
    pub gas_used: u64,
    pub worker_startup_count: u64,
}

impl FuzzerMetrics {
    pub fn new(workers: usize) -> Self {
        Self { workers: (0..workers).map(|_| WorkerMetrics::default()).collect() }
    }

    /// The slot owned by `worker_index`.
    pub fn worker(&self, worker_index: usize) -> &WorkerMetrics {
        &self.workers[worker_index]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for worker in &self.workers {
            snapshot.sequences_tested += worker.sequences_tested.load(Ordering::Relaxed);
            snapshot.calls_tested += worker.calls_tested.load(Ordering::Relaxed);
            snapshot.gas_used += worker.gas_used.load(Ordering::Relaxed);
            snapshot.worker_startup_count += worker.worker_startup_count.load(Ordering::Relaxed);
        }
        snapshot
    }
}
