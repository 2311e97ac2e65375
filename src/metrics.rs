//! Per-container metrics. Each of `lfring`, `ringbuf`, `stack`, and `msqueue`
//! carries one of these and increments it on every enqueue/dequeue, exposed
//! through a `.metrics()` accessor, following the same counter-plus-snapshot
//! shape the ring buffer used upstream of this crate.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live, atomically-updated counters for a single container instance.
#[derive(Debug, Default)]
pub struct Metrics {
    pub items_enqueued: AtomicU64,
    pub items_dequeued: AtomicU64,
    pub batches_enqueued: AtomicU64,
    pub batches_dequeued: AtomicU64,
    pub acquire_spins: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_dequeued: self.items_dequeued.load(Ordering::Relaxed),
            batches_enqueued: self.batches_enqueued.load(Ordering::Relaxed),
            batches_dequeued: self.batches_dequeued.load(Ordering::Relaxed),
            acquire_spins: self.acquire_spins.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, non-atomic copy of [`Metrics`] for inspection/reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_enqueued: u64,
    pub items_dequeued: u64,
    pub batches_enqueued: u64,
    pub batches_dequeued: u64,
    pub acquire_spins: u64,
}
