//! Lock-free MPMC ring buffer with per-slot sequence counters.
//!
//! Each slot carries a sequence number distinguishing "ready to write"
//! generation `g*2` from "ready to read" generation `g*2 + 1`. A producer
//! claims a slot by advancing `enqueue_pos` with CAS, waits for the slot's
//! sequence to match its claimed position, writes the value, then publishes
//! by bumping the slot sequence to `pos + 1`. A consumer is the mirror image.
//! This is the same combining-free, per-slot-sequenced protocol documented
//! for `lfring`, adapted to owned Rust values instead of raw caller-owned
//! node pointers.

use crate::errors::AllocError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded, lock-free, multi-producer multi-consumer ring buffer.
///
/// Capacity 1 is supported (a degenerate but valid MPMC rendezvous slot).
pub struct LfRing<T> {
    buffer: Box<[CachePadded<Slot<T>>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
    metrics: Metrics,
}

unsafe impl<T: Send> Send for LfRing<T> {}
unsafe impl<T: Send> Sync for LfRing<T> {}

impl<T> LfRing<T> {
    /// Allocate a ring of the given capacity, which must be a power of two.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        crate::config::check_power_of_two(capacity)?;
        let buffer = (0..capacity)
            .map(|i| {
                CachePadded::new(Slot {
                    seq: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
            metrics: Metrics::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Snapshot of this ring's live counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Attempt to enqueue a single value. Returns the value back on a full
    /// ring rather than blocking.
    pub fn try_enqueue(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: we own this slot exclusively until we
                        // publish the new sequence number below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos + 1, Ordering::Release);
                        self.metrics.items_enqueued.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempt to dequeue a single value. Returns `None` on an empty ring.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - (pos as isize + 1);
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: slot sequence confirms a fully written
                        // value is present and we hold exclusive claim on it.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos + self.capacity(), Ordering::Release);
                        self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue as many of `items` as fit, in order, removing the enqueued
    /// prefix from `items` and returning how many were enqueued.
    pub fn enqueue_batch(&self, items: &mut Vec<T>) -> usize {
        let mut count = 0;
        while !items.is_empty() {
            let item = items.remove(0);
            match self.try_enqueue(item) {
                Ok(()) => count += 1,
                Err(back) => {
                    items.insert(0, back);
                    break;
                }
            }
        }
        if count > 0 {
            self.metrics.batches_enqueued.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Dequeue up to `max` values.
    pub fn dequeue_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.capacity()));
        for _ in 0..max {
            match self.try_dequeue() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        if !out.is_empty() {
            self.metrics.batches_dequeued.fetch_add(1, Ordering::Relaxed);
        }
        out
    }
}

impl<T> Drop for LfRing<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_one_roundtrip() {
        let ring: LfRing<i32> = LfRing::new(1).unwrap();
        assert!(ring.try_dequeue().is_none());
        assert!(ring.try_enqueue(1).is_ok());
        assert!(ring.try_enqueue(2).is_err());
        assert_eq!(ring.try_dequeue(), Some(1));
        assert!(ring.try_enqueue(2).is_ok());
        assert_eq!(ring.try_dequeue(), Some(2));
    }

    #[test]
    fn metrics_track_enqueue_dequeue_counts() {
        let ring: LfRing<i32> = LfRing::new(4).unwrap();
        ring.try_enqueue(1).unwrap();
        ring.try_enqueue(2).unwrap();
        ring.try_dequeue().unwrap();
        let snap = ring.metrics();
        assert_eq!(snap.items_enqueued, 2);
        assert_eq!(snap.items_dequeued, 1);

        let mut batch = vec![3, 4, 5];
        ring.enqueue_batch(&mut batch);
        let _ = ring.dequeue_batch(2);
        let snap = ring.metrics();
        assert_eq!(snap.batches_enqueued, 1);
        assert_eq!(snap.batches_dequeued, 1);
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(LfRing::<i32>::new(3).is_err());
        assert!(LfRing::<i32>::new(0).is_err());
    }

    #[test]
    fn fifo_single_threaded() {
        let ring: LfRing<i32> = LfRing::new(8).unwrap();
        for i in 0..8 {
            ring.try_enqueue(i).unwrap();
        }
        assert!(ring.try_enqueue(99).is_err());
        for i in 0..8 {
            assert_eq!(ring.try_dequeue(), Some(i));
        }
        assert!(ring.try_dequeue().is_none());
    }

    #[test]
    fn concurrent_mpmc_no_loss() {
        use std::sync::Arc;
        use std::thread;

        let ring: Arc<LfRing<u64>> = Arc::new(LfRing::new(1024).unwrap());
        let producers = 4;
        let per_producer = 2000u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let v = p * per_producer + i;
                        loop {
                            if ring.try_enqueue(v).is_ok() {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = producers * per_producer;
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(total as usize);
                while (seen.len() as u64) < total {
                    if let Some(v) = ring.try_dequeue() {
                        seen.push(v);
                    } else {
                        std::thread::yield_now();
                    }
                }
                seen
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        let mut seen = consumer.join().unwrap();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..total).collect();
        assert_eq!(seen, expected);
    }
}
