//! Blocking multi-producer multi-consumer ring buffer (`ringbuf`) and its
//! batch-blocking specialization `BlkRing`.
//!
//! The core protocol is a two-phase acquire/release over a reservation
//! counter and a separate commit counter:
//!
//! 1. **Acquire**: advance the reservation counter by the number of slots
//!    actually available (bounded by both free space and the caller's
//!    request), claiming `[index, index + actual)`.
//! 2. Caller writes (or reads) the claimed slots.
//! 3. **Release**: for the multi-producer/multi-consumer blocking modes,
//!    wait until the commit counter reaches `index` (i.e. every earlier
//!    reservation has already released) before publishing — this is the
//!    source of blocking: a stalled producer/consumer blocks later
//!    releases, not later acquires.
//!
//! Non-blocking modes fold reservation and commit into one step; the
//! lock-free-consumer mode instead speculatively reads then CAS's the
//! consumer counter forward, retrying from scratch on failure. That mode
//! cannot be paired with a non-blocking producer (see [`AllocError::IncompatibleModes`]).

use crate::backoff::Backoff;
use crate::config::{check_power_of_two, RingFlags};
use crate::errors::AllocError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct RingBuf<T> {
    produce_reserve: CachePadded<AtomicU64>,
    produce_commit: CachePadded<AtomicU64>,
    consume_reserve: CachePadded<AtomicU64>,
    consume_commit: CachePadded<AtomicU64>,
    mask: usize,
    flags: RingFlags,
    buffer: UnsafeCell<Box<[MaybeUninit<T>]>>,
    metrics: Metrics,
}

unsafe impl<T: Send> Send for RingBuf<T> {}
unsafe impl<T: Send> Sync for RingBuf<T> {}

struct Claim {
    index: u64,
    actual: usize,
}

impl<T> RingBuf<T> {
    pub fn new(capacity: usize, flags: RingFlags) -> Result<Self, AllocError> {
        check_power_of_two(capacity)?;
        let flags = flags.validate()?;
        let mut v = Vec::with_capacity(capacity);
        v.resize_with(capacity, MaybeUninit::uninit);
        Ok(Self {
            produce_reserve: CachePadded::new(AtomicU64::new(0)),
            produce_commit: CachePadded::new(AtomicU64::new(0)),
            consume_reserve: CachePadded::new(AtomicU64::new(0)),
            consume_commit: CachePadded::new(AtomicU64::new(0)),
            mask: capacity - 1,
            flags,
            buffer: UnsafeCell::new(v.into_boxed_slice()),
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

    fn slot(&self, idx: u64) -> *mut MaybeUninit<T> {
        let buf = self.buffer.get();
        // SAFETY: idx & mask is always within bounds of the allocated buffer.
        unsafe { (*buf).as_mut_ptr().add((idx as usize) & self.mask) }
    }

    fn acquire_produce(&self, n: usize) -> Option<Claim> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.produce_reserve.load(Ordering::Relaxed);
            let tail = self.consume_commit.load(Ordering::Acquire);
            let used = head.wrapping_sub(tail) as usize;
            let free = self.capacity().saturating_sub(used);
            let actual = n.min(free);
            if actual == 0 {
                if self.flags.non_blocking_producer {
                    return None;
                }
                self.metrics.acquire_spins.fetch_add(1, Ordering::Relaxed);
                backoff.snooze();
                continue;
            }
            if self.flags.multi_producer {
                match self.produce_reserve.compare_exchange_weak(
                    head,
                    head + actual as u64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(Claim { index: head, actual }),
                    Err(_) => continue,
                }
            } else {
                self.produce_reserve
                    .store(head + actual as u64, Ordering::Relaxed);
                return Some(Claim { index: head, actual });
            }
        }
    }

    fn release_produce(&self, claim: &Claim) {
        let new_commit = claim.index + claim.actual as u64;
        if self.flags.multi_producer {
            crate::pr::wait_until_equal(&self.produce_commit, claim.index, Ordering::Acquire);
        }
        self.produce_commit.store(new_commit, Ordering::Release);
    }

    fn acquire_consume(&self, n: usize) -> Option<Claim> {
        let mut backoff = Backoff::new();
        loop {
            let tail = self.consume_reserve.load(Ordering::Relaxed);
            let head = self.produce_commit.load(Ordering::Acquire);
            let avail = head.wrapping_sub(tail) as usize;
            let actual = n.min(avail);
            if actual == 0 {
                if self.flags.non_blocking_consumer || self.flags.lock_free_consumer {
                    return None;
                }
                self.metrics.acquire_spins.fetch_add(1, Ordering::Relaxed);
                backoff.snooze();
                continue;
            }
            if self.flags.multi_consumer || self.flags.lock_free_consumer {
                match self.consume_reserve.compare_exchange_weak(
                    tail,
                    tail + actual as u64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(Claim { index: tail, actual }),
                    Err(_) => continue,
                }
            } else {
                self.consume_reserve
                    .store(tail + actual as u64, Ordering::Relaxed);
                return Some(Claim { index: tail, actual });
            }
        }
    }

    fn release_consume(&self, claim: &Claim) {
        let new_commit = claim.index + claim.actual as u64;
        if self.flags.multi_consumer && !self.flags.lock_free_consumer {
            crate::pr::wait_until_equal(&self.consume_commit, claim.index, Ordering::Acquire);
        }
        self.consume_commit.store(new_commit, Ordering::Release);
    }

    /// Enqueue as many of `items` as fit (bounded by free space and, in
    /// non-blocking mode, by a single attempt). Returns the number actually
    /// enqueued, taken from the front of `items`.
    pub fn enqueue(&self, items: &mut Vec<T>) -> usize {
        let Some(claim) = self.acquire_produce(items.len()) else {
            return 0;
        };
        for i in 0..claim.actual {
            let v = items.remove(0);
            // SAFETY: slot index is exclusively owned by this claim until release.
            unsafe { self.slot(claim.index + i as u64).write(MaybeUninit::new(v)) };
        }
        self.release_produce(&claim);
        self.metrics
            .items_enqueued
            .fetch_add(claim.actual as u64, Ordering::Relaxed);
        self.metrics.batches_enqueued.fetch_add(1, Ordering::Relaxed);
        claim.actual
    }

    /// Dequeue up to `n` elements. Lock-free-consumer mode speculatively
    /// reads and retries on a failed CAS rather than waiting for other
    /// consumers.
    pub fn dequeue(&self, n: usize) -> Vec<T> {
        if self.flags.lock_free_consumer {
            return self.dequeue_lock_free(n);
        }
        let Some(claim) = self.acquire_consume(n) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(claim.actual);
        for i in 0..claim.actual {
            // SAFETY: produce_commit acquire established these slots are
            // fully written, and this claim owns them exclusively.
            let v = unsafe { self.slot(claim.index + i as u64).read().assume_init() };
            out.push(v);
        }
        self.release_consume(&claim);
        self.metrics
            .items_dequeued
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        self.metrics.batches_dequeued.fetch_add(1, Ordering::Relaxed);
        out
    }

    fn dequeue_lock_free(&self, n: usize) -> Vec<T>
    {
        let mut backoff = Backoff::new();
        loop {
            let tail = self.consume_reserve.load(Ordering::Acquire);
            let head = self.produce_commit.load(Ordering::Acquire);
            let avail = head.wrapping_sub(tail) as usize;
            let actual = n.min(avail);
            if actual == 0 {
                return Vec::new();
            }
            // Speculative read: values may be overwritten if we lose the
            // race below, so we only trust them after the CAS succeeds.
            let mut out = Vec::with_capacity(actual);
            for i in 0..actual {
                // SAFETY: slots in [tail, head) are published and, while
                // speculative, are not yet reclaimed by a producer because
                // produce_reserve cannot lap consume_commit past capacity.
                let v = unsafe { std::ptr::read(self.slot(tail + i as u64)).assume_init() };
                out.push(v);
            }
            match self.consume_reserve.compare_exchange_weak(
                tail,
                tail + actual as u64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.consume_commit
                        .store(tail + actual as u64, Ordering::Release);
                    self.metrics
                        .items_dequeued
                        .fetch_add(out.len() as u64, Ordering::Relaxed);
                    self.metrics.batches_dequeued.fetch_add(1, Ordering::Relaxed);
                    return out;
                }
                Err(_) => {
                    std::mem::forget(out);
                    self.metrics.acquire_spins.fetch_add(1, Ordering::Relaxed);
                    backoff.snooze();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        let head = self.produce_commit.load(Ordering::Acquire);
        let tail = self.consume_commit.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for RingBuf<T> {
    fn drop(&mut self) {
        let tail = *self.consume_commit.get_mut();
        let head = *self.produce_commit.get_mut();
        let mut idx = tail;
        while idx != head {
            // SAFETY: [tail, head) holds live, unread values at drop time.
            unsafe { self.slot(idx).read().assume_init_drop() };
            idx += 1;
        }
    }
}

/// A batch-blocking specialization: enqueue and dequeue both block until
/// *exactly* `num` elements are placed or taken, built on the same
/// reservation protocol as [`RingBuf`].
pub struct BlkRing<T> {
    inner: RingBuf<T>,
}

impl<T> BlkRing<T> {
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        Ok(Self {
            inner: RingBuf::new(capacity, RingFlags::multi_producer_multi_consumer())?,
        })
    }

    /// Block until all of `items` is enqueued.
    pub fn enqueue_all(&self, mut items: Vec<T>) {
        while !items.is_empty() {
            self.inner.enqueue(&mut items);
        }
    }

    /// Block until exactly `num` elements are dequeued.
    pub fn dequeue_exact(&self, num: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(num);
        while out.len() < num {
            let mut batch = self.inner.dequeue(num - out.len());
            out.append(&mut batch);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of the underlying ring's live counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blkring_order_scenario() {
        let rb: BlkRing<i32> = BlkRing::new(8).unwrap();
        rb.enqueue_all(vec![1]);
        assert_eq!(rb.dequeue_exact(1), vec![1]);
        rb.enqueue_all(vec![2, 3, 4, 5, 6]);
        assert_eq!(rb.dequeue_exact(1), vec![2]);
        assert_eq!(rb.dequeue_exact(2), vec![3, 4]);
        assert_eq!(rb.dequeue_exact(2), vec![5, 6]);
    }

    #[test]
    fn spsc_basic() {
        let rb: RingBuf<i32> = RingBuf::new(4, RingFlags::single_producer_single_consumer()).unwrap();
        let mut items = vec![1, 2, 3];
        assert_eq!(rb.enqueue(&mut items), 3);
        assert_eq!(rb.dequeue(10), vec![1, 2, 3]);
    }

    #[test]
    fn non_blocking_producer_truncates() {
        let flags = RingFlags {
            non_blocking_producer: true,
            ..RingFlags::single_producer_single_consumer()
        };
        let rb: RingBuf<i32> = RingBuf::new(2, flags).unwrap();
        let mut items = vec![1, 2, 3];
        assert_eq!(rb.enqueue(&mut items), 2);
        assert_eq!(items, vec![3]);
    }

    #[test]
    fn metrics_track_items_and_batches() {
        let rb: RingBuf<i32> = RingBuf::new(4, RingFlags::single_producer_single_consumer()).unwrap();
        let mut items = vec![1, 2, 3];
        rb.enqueue(&mut items);
        rb.dequeue(3);
        let snap = rb.metrics();
        assert_eq!(snap.items_enqueued, 3);
        assert_eq!(snap.items_dequeued, 3);
        assert_eq!(snap.batches_enqueued, 1);
        assert_eq!(snap.batches_dequeued, 1);
    }

    #[test]
    fn rejects_lfdeq_with_nbenq() {
        let flags = RingFlags {
            lock_free_consumer: true,
            non_blocking_producer: true,
            ..RingFlags::single_producer_single_consumer()
        };
        assert!(matches!(
            RingBuf::<i32>::new(4, flags),
            Err(AllocError::IncompatibleModes)
        ));
    }

    #[test]
    fn mpmc_no_loss() {
        use std::sync::Arc;
        use std::thread;

        let rb: Arc<RingBuf<u64>> = Arc::new(
            RingBuf::new(64, RingFlags::multi_producer_multi_consumer()).unwrap(),
        );
        let producers = 4u64;
        let per = 500u64;
        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let rb = Arc::clone(&rb);
                thread::spawn(move || {
                    for i in 0..per {
                        let mut v = vec![p * per + i];
                        while !v.is_empty() {
                            rb.enqueue(&mut v);
                        }
                    }
                })
            })
            .collect();

        let total = producers * per;
        let rb2 = Arc::clone(&rb);
        let consumer = thread::spawn(move || {
            let mut seen = Vec::with_capacity(total as usize);
            while (seen.len() as u64) < total {
                let mut batch = rb2.dequeue((total as usize) - seen.len());
                seen.append(&mut batch);
            }
            seen
        });

        for h in handles {
            h.join().unwrap();
        }
        let mut seen = consumer.join().unwrap();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..total).collect();
        assert_eq!(seen, expected);
    }
}
