//! Lax reorder buffer: sequence-number-indexed insert, in-order retirement,
//! with a combining-style "one robber, many enqueuers" exclusivity protocol.
//!
//! Every inserting thread either becomes the *robber* (the sole thread
//! processing the ring right now) or attaches its batch onto a lock-free
//! LIFO backlog for the current robber to pick up. `pending` encodes three
//! states in one pointer:
//!
//! - a tagged sentinel (`IDLE_SENTINEL`, low bit set): no robber.
//! - `null`: a robber owns the buffer, no backlog.
//! - any other pointer: a robber owns the buffer; the pointer is the head of
//!   a linked backlog of batches awaiting processing.
//!
//! Because only the thread holding robber status ever touches `ring`,
//! `oldest`, or the output batch buffer, those fields need no further
//! synchronization beyond the handoff implied by the `pending` CAS protocol.

use crate::backoff::Backoff;
use crate::config::check_power_of_two;
use crate::errors::AllocError;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct PendNode<T> {
    sn: u64,
    value: T,
    next: *mut PendNode<T>,
}

fn idle_sentinel<T>() -> *mut PendNode<T> {
    // A fixed, never-allocated address used purely as a tag; no `PendNode`
    // is ever placed here.
    1usize as *mut PendNode<T>
}

/// A lax reorder buffer: accepts elements out of order by sequence number,
/// retires them strictly in order through `callback` once their position
/// falls outside the sliding window.
pub struct LaxRob<T> {
    pending: AtomicPtr<PendNode<T>>,
    oldest: UnsafeCell<u64>,
    size: usize,
    mask: usize,
    vecsz: usize,
    ring: UnsafeCell<Vec<Vec<(u64, T)>>>,
    out_buf: UnsafeCell<Vec<(u64, T)>>,
    callback: UnsafeCell<Box<dyn FnMut(Vec<(u64, T)>) + Send>>,
}

unsafe impl<T: Send> Send for LaxRob<T> {}
unsafe impl<T: Send> Sync for LaxRob<T> {}

impl<T> LaxRob<T> {
    /// `size` (the window length) and `vecsz` (the retirement batch size)
    /// must both be powers of two... actually only `size` must be, to keep
    /// slot indexing a mask operation; `vecsz` just bounds a `Vec`.
    pub fn new<F>(size: usize, vecsz: usize, callback: F) -> Result<Self, AllocError>
    where
        F: FnMut(Vec<(u64, T)>) + Send + 'static,
    {
        check_power_of_two(size)?;
        if vecsz == 0 {
            return Err(AllocError::ZeroCapacity);
        }
        let mut ring = Vec::with_capacity(size);
        ring.resize_with(size, Vec::new);
        Ok(Self {
            pending: AtomicPtr::new(idle_sentinel()),
            oldest: UnsafeCell::new(0),
            size,
            mask: size - 1,
            vecsz,
            ring: UnsafeCell::new(ring),
            out_buf: UnsafeCell::new(Vec::with_capacity(vecsz)),
            callback: UnsafeCell::new(Box::new(callback)),
        })
    }

    fn acquire_or_enqueue(&self, head: *mut PendNode<T>, tail: *mut PendNode<T>) -> bool {
        loop {
            let cur = self.pending.load(Ordering::Acquire);
            if cur == idle_sentinel() {
                if self
                    .pending
                    .compare_exchange(cur, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            } else {
                // SAFETY: tail is the exclusively-owned end of our own
                // not-yet-published chain.
                unsafe { (*tail).next = cur };
                if self
                    .pending
                    .compare_exchange(cur, head, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return false;
                }
            }
        }
    }

    fn release_or_dequeue(&self) -> Option<*mut PendNode<T>> {
        loop {
            let cur = self.pending.load(Ordering::Acquire);
            match self.pending.compare_exchange(
                cur,
                idle_sentinel(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return None,
                Err(actual) => {
                    if self
                        .pending
                        .compare_exchange(actual, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Some(actual);
                    }
                }
            }
        }
    }

    fn acquire_rob_blocking(&self) {
        let mut backoff = Backoff::new();
        loop {
            let cur = self.pending.load(Ordering::Acquire);
            if cur == idle_sentinel()
                && self
                    .pending
                    .compare_exchange(cur, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Insert a batch of `(sn, value)` pairs. Retirement happens as a side
    /// effect through the callback installed at construction.
    pub fn insert(&self, items: Vec<(u64, T)>) {
        if items.is_empty() {
            return;
        }
        let mut head: *mut PendNode<T> = ptr::null_mut();
        let mut tail: *mut PendNode<T> = ptr::null_mut();
        for (sn, value) in items {
            let node = Box::into_raw(Box::new(PendNode {
                sn,
                value,
                next: ptr::null_mut(),
            }));
            if head.is_null() {
                head = node;
                tail = node;
            } else {
                // SAFETY: tail was just set above in this same construction
                // and is not yet shared.
                unsafe { (*tail).next = node };
                tail = node;
            }
        }
        if self.acquire_or_enqueue(head, tail) {
            self.run_robber(head);
        }
    }

    fn run_robber(&self, mut list: *mut PendNode<T>) {
        loop {
            self.insert_list(list);
            match self.release_or_dequeue() {
                None => break,
                Some(next) => list = next,
            }
        }
    }

    fn insert_list(&self, list: *mut PendNode<T>) {
        let mut cur = list;
        while !cur.is_null() {
            // SAFETY: the robber has exclusive ownership of this chain.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
            self.insert_one(node.sn, node.value);
        }
    }

    fn insert_one(&self, sn: u64, value: T) {
        // SAFETY: only the current robber touches `oldest`/`ring`.
        let oldest = unsafe { *self.oldest.get() };
        if sn < oldest {
            self.retire_value(sn, value);
            return;
        }
        if sn >= oldest + self.size as u64 {
            let new_oldest = sn - self.size as u64 + 1;
            self.retire_slots(oldest, new_oldest);
            unsafe { *self.oldest.get() = new_oldest };
        }
        let idx = (sn & self.mask as u64) as usize;
        // SAFETY: exclusive robber access.
        unsafe { (*self.ring.get())[idx].push((sn, value)) };
    }

    fn retire_slots(&self, from: u64, to: u64) {
        let mut seq = from;
        while seq < to {
            let idx = (seq & self.mask as u64) as usize;
            // SAFETY: exclusive robber access.
            let items = {
                let ring = unsafe { &mut *self.ring.get() };
                std::mem::take(&mut ring[idx])
            };
            for (s, v) in items {
                self.retire_value(s, v);
            }
            seq += 1;
        }
    }

    fn retire_value(&self, sn: u64, value: T) {
        // SAFETY: exclusive robber access.
        let buf = unsafe { &mut *self.out_buf.get() };
        buf.push((sn, value));
        if buf.len() >= self.vecsz {
            self.flush_out_buf();
        }
    }

    fn flush_out_buf(&self) {
        // SAFETY: exclusive robber access.
        let buf = unsafe { &mut *self.out_buf.get() };
        if buf.is_empty() {
            return;
        }
        let batch = std::mem::take(buf);
        // SAFETY: exclusive robber access.
        let cb = unsafe { &mut *self.callback.get() };
        cb(batch);
    }

    /// Force retirement of up to `nslots` leading window slots (and flush
    /// any partial output batch), blocking until robber ownership is
    /// available. Used to drain the buffer at end of stream.
    pub fn flush(&self, nslots: usize) {
        self.acquire_rob_blocking();
        let n = nslots.min(self.size);
        // SAFETY: robber ownership held.
        let oldest = unsafe { *self.oldest.get() };
        self.retire_slots(oldest, oldest + n as u64);
        unsafe { *self.oldest.get() = oldest + n as u64 };
        self.flush_out_buf();
        loop {
            match self.release_or_dequeue() {
                None => break,
                Some(list) => self.insert_list(list),
            }
        }
    }
}

impl<T> Drop for LaxRob<T> {
    fn drop(&mut self) {
        let ring = self.ring.get_mut();
        debug_assert!(
            ring.iter().all(Vec::is_empty) && self.out_buf.get_mut().is_empty(),
            "LaxRob dropped with unretired elements still buffered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_callback() -> (Arc<Mutex<Vec<(u64, i32)>>>, impl FnMut(Vec<(u64, i32)>) + Send) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let out2 = Arc::clone(&out);
        let cb = move |batch: Vec<(u64, i32)>| {
            out2.lock().unwrap().extend(batch);
        };
        (out, cb)
    }

    #[test]
    fn laxrob_scenario() {
        let (out, cb) = collecting_callback();
        let rob: LaxRob<i32> = LaxRob::new(4, 1, cb).unwrap();

        rob.insert(vec![(0, 100), (0, 101)]);
        rob.flush(1);
        {
            let seen = out.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert!(seen.iter().all(|(sn, _)| *sn == 0));
        }

        rob.insert(vec![(2, 200), (2, 201)]);
        rob.insert(vec![(1, 150)]);
        rob.insert(vec![(5, 500)]);
        rob.flush(4);

        let seen = out.lock().unwrap();
        assert_eq!(seen.len(), 6);
        for w in seen.windows(2) {
            assert!(w[0].0 <= w[1].0);
        }
        assert_eq!(seen.last().unwrap().0, 5);
    }

    #[test]
    fn straggler_retires_immediately() {
        let (out, cb) = collecting_callback();
        let rob: LaxRob<i32> = LaxRob::new(4, 1, cb).unwrap();
        rob.insert(vec![(10, 1)]);
        rob.flush(4);
        rob.insert(vec![(2, 2)]);
        let seen = out.lock().unwrap();
        assert!(seen.iter().any(|(sn, v)| *sn == 2 && *v == 2));
    }

    #[test]
    fn concurrent_inserts_retire_in_order() {
        use std::thread;

        let (out, cb) = collecting_callback();
        let rob: Arc<LaxRob<u64>> = Arc::new(LaxRob::new(16, 4, cb).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let rob = Arc::clone(&rob);
                thread::spawn(move || {
                    for i in 0..50u64 {
                        let sn = i * 4 + t;
                        rob.insert(vec![(sn, sn)]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        rob.flush(16);
        let seen = out.lock().unwrap();
        for w in seen.windows(2) {
            assert!(w[0].0 <= w[1].0);
        }
    }
}
