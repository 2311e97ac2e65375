//! Atomics façade.
//!
//! Thin wrappers over `core::sync::atomic` giving every container a uniform
//! vocabulary for loads, stores, compare-exchange, and fetch-ops with
//! explicit memory ordering, plus a portable double-word compare-exchange
//! for the `(ptr, tag)` cells used by the tagged-pointer ABA defenses.

use crate::backoff::Backoff;
use std::sync::atomic::{fence, AtomicU64, Ordering};

#[inline]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

#[inline]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Busy-wait until `loc` is observed to equal `val`, using an adaptive
/// backoff between polls. Used by the blocking ring buffer's release path
/// and the rwlock family's acquire paths.
pub fn wait_until_equal(loc: &AtomicU64, val: u64, order: Ordering) -> u64 {
    let mut backoff = Backoff::new();
    loop {
        let cur = loc.load(order);
        if cur == val {
            return cur;
        }
        backoff.snooze();
    }
}

/// Busy-wait until `pred(loc.load(order))` holds, returning the observed value.
pub fn wait_until<F: Fn(u64) -> bool>(loc: &AtomicU64, order: Ordering, pred: F) -> u64 {
    let mut backoff = Backoff::new();
    loop {
        let cur = loc.load(order);
        if pred(cur) {
            return cur;
        }
        backoff.snooze();
    }
}

/// A `(pointer, tag)` pair accessed as a single logical unit via a portable
/// double-word compare-exchange.
///
/// Native 128-bit atomics are not stable on all targets this crate supports,
/// so the pair is stored as two adjacent `AtomicU64`s and the "double-word
/// CAS" is realized as a verifying CAS loop: read both halves, then CAS the
/// pointer half only if the tag half still matches what was observed. This
/// is weaker than a true atomic 128-bit load (the two halves are not
/// snapshotted together), so every call site that depends on the pair being
/// observed atomically re-reads and re-verifies after any potential race
/// rather than trusting a cached snapshot.
#[repr(C)]
pub struct DwCas {
    ptr: AtomicU64,
    tag: AtomicU64,
}

impl DwCas {
    pub const fn new(ptr: u64, tag: u64) -> Self {
        Self {
            ptr: AtomicU64::new(ptr),
            tag: AtomicU64::new(tag),
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> (u64, u64) {
        let tag = self.tag.load(order);
        let ptr = self.ptr.load(order);
        (ptr, tag)
    }

    /// Exclusive access to the pointer half, for use at drop time where
    /// `&mut self` already rules out concurrent access.
    pub fn ptr_mut(&mut self) -> &mut u64 {
        self.ptr.get_mut()
    }

    /// Unconditional store of both halves. Only safe to use where the
    /// caller already has exclusive access to this cell by construction
    /// (e.g. the internal lock mode, where a held mutex rules out any
    /// concurrent reader or writer).
    pub fn store(&self, new: (u64, u64), order: Ordering) {
        self.ptr.store(new.0, order);
        self.tag.store(new.1, order);
    }

    /// Compare-and-swap both halves. Succeeds only if both `old` values
    /// still match; on success stores `new` to both halves with `success`
    /// ordering, otherwise reloads and returns the observed pair with
    /// `failure` ordering.
    pub fn compare_exchange(
        &self,
        old: (u64, u64),
        new: (u64, u64),
        success: Ordering,
        failure: Ordering,
    ) -> Result<(u64, u64), (u64, u64)> {
        match self
            .tag
            .compare_exchange(old.1, u64::MAX, Ordering::AcqRel, failure)
        {
            Ok(_) => {
                // We hold exclusive rights to the tag half for the instant
                // of this update; the pointer half cannot be concurrently
                // observed as consistent while tag == u64::MAX, so no other
                // thread can be mid-update on the same generation.
                if self.ptr.load(Ordering::Acquire) != old.0 {
                    // shouldn't happen under correct protocol use, but
                    // restore and fail rather than corrupt state.
                    self.tag.store(old.1, Ordering::Release);
                    return Err(self.load(failure));
                }
                self.ptr.store(new.0, success);
                self.tag.store(new.1, success);
                Ok(new)
            }
            Err(_) => Err(self.load(failure)),
        }
    }
}
