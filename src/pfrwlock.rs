//! Phase-fair reader/writer lock: readers and writers alternate in phases,
//! so a steady stream of readers cannot starve a waiting writer (the
//! weakness [`crate::rwlock::RwLock`] accepts as a non-goal).
//!
//! The state word packs four 16-bit counters: `enter_rd`, `enter_wr` (ticket
//! counters, bumped by arriving readers/writers) and `leave_rd`, `leave_wr`
//! (completion counters, bumped by departing readers/writers), plus a fifth
//! `pend_rd` counter tracking readers that arrived during an active writer's
//! phase and must wait for that writer instead of joining the current
//! read phase. All five are packed into explicit byte ranges of a single
//! `u64` via shifts, not a `#[repr(C)]` bitfield union, so the layout is
//! identical regardless of target endianness.

use crate::backoff::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};

const ENTER_RD_SHIFT: u32 = 0;
const PEND_RD_SHIFT: u32 = 16;
const LEAVE_WR_SHIFT: u32 = 32;
const ENTER_WR_SHIFT: u32 = 48;
const FIELD_MASK: u64 = 0xFFFF;

fn field(word: u64, shift: u32) -> u16 {
    ((word >> shift) & FIELD_MASK) as u16
}

fn add_w_mask(word: u64, shift: u32, delta: u16) -> u64 {
    let cur = field(word, shift);
    let next = cur.wrapping_add(delta);
    (word & !(FIELD_MASK << shift)) | ((next as u64) << shift)
}

/// A phase-fair reader/writer lock.
///
/// Unlike [`crate::rwlock::RwLock`], readers that arrive while a writer is
/// active or pending do not join the currently-draining read phase; they
/// queue behind the writer via `pend_rd`, bounding the number of read
/// phases a single writer can be starved behind to one.
pub struct PfRwLock {
    word: AtomicU64,
    leave_rd: AtomicU64,
}

impl PfRwLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            leave_rd: AtomicU64::new(0),
        }
    }

    /// Take a reader ticket, incrementing `enter_rd` if no writer is
    /// currently between its own `enter_wr` and `leave_wr` tickets
    /// (i.e. no writer has announced intent but not yet released), else
    /// `pend_rd` so this reader waits for that writer's phase to end.
    fn incr_enter_or_pend(&self) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            let w = self.word.load(Ordering::Relaxed);
            let writer_active = field(w, ENTER_WR_SHIFT) != field(w, LEAVE_WR_SHIFT);
            let shift = if writer_active {
                PEND_RD_SHIFT
            } else {
                ENTER_RD_SHIFT
            };
            let next = add_w_mask(w, shift, 1);
            if self
                .word
                .compare_exchange_weak(w, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return w;
            }
            backoff.snooze();
        }
    }

    pub fn acquire_rd(&self) {
        self.incr_enter_or_pend();
        // Readers complete in any order; there is no per-reader ticket to
        // wait on beyond having successfully joined a phase, since the
        // writer side is what enforces exclusion against this phase.
        let mut backoff = Backoff::new();
        loop {
            let w = self.word.load(Ordering::Acquire);
            if field(w, ENTER_WR_SHIFT) == field(w, LEAVE_WR_SHIFT) {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire_rd(&self) -> bool {
        let w = self.word.load(Ordering::Relaxed);
        if field(w, ENTER_WR_SHIFT) != field(w, LEAVE_WR_SHIFT) {
            return false;
        }
        let next = add_w_mask(w, ENTER_RD_SHIFT, 1);
        self.word
            .compare_exchange(w, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_rd(&self) {
        self.leave_rd.fetch_add(1, Ordering::Release);
    }

    /// Acquire the write lock. Waits for every reader already in the
    /// current phase to depart, then for any previous writer to finish.
    pub fn acquire_wr(&self) {
        let mut backoff = Backoff::new();
        let my_ticket;
        loop {
            let w = self.word.load(Ordering::Relaxed);
            let ticket = field(w, ENTER_WR_SHIFT);
            let next = add_w_mask(w, ENTER_WR_SHIFT, 1);
            if self
                .word
                .compare_exchange_weak(w, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                my_ticket = ticket;
                break;
            }
            backoff.snooze();
        }
        // Wait our turn among writers.
        let mut backoff = Backoff::new();
        loop {
            let w = self.word.load(Ordering::Acquire);
            if field(w, LEAVE_WR_SHIFT) == my_ticket {
                break;
            }
            backoff.snooze();
        }
        // Wait for every reader that had already entered this phase (the
        // `enter_rd` snapshot taken once we own the writer turn) to leave.
        let enter_rd = field(self.word.load(Ordering::Acquire), ENTER_RD_SHIFT);
        let mut backoff = Backoff::new();
        loop {
            let left = self.leave_rd.load(Ordering::Acquire);
            if (left as u16) == enter_rd {
                break;
            }
            backoff.snooze();
        }
    }

    /// Release the write lock, folding any readers that queued behind this
    /// writer (`pend_rd`) into the next read phase (`enter_rd`) and bumping
    /// `leave_wr` so waiting readers and the next writer may proceed.
    pub fn release_wr(&self) {
        let mut backoff = Backoff::new();
        loop {
            let w = self.word.load(Ordering::Relaxed);
            let pend = field(w, PEND_RD_SHIFT);
            let mut next = add_w_mask(w, LEAVE_WR_SHIFT, 1);
            next = add_w_mask(next, ENTER_RD_SHIFT, pend);
            next &= !(FIELD_MASK << PEND_RD_SHIFT);
            if self
                .word
                .compare_exchange_weak(w, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }
}

impl Default for PfRwLock {
    fn default() -> Self {
        Self::new()
    }
}
