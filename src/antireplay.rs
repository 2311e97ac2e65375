//! Wait-free sliding-window replay detector: checks and records 64-bit
//! sequence numbers against a fixed-size window of per-slot high-water
//! marks, used to reject duplicate ("replayed") or out-of-window ("stale")
//! events without any locking.
//!
//! Each window slot holds the highest sequence number seen that hashes to
//! it; a test-and-set is a single atomic fetch-max. Optional "swizzling"
//! scrambles the slot index so consecutive sequence numbers land in
//! different cache lines, trading locality for reduced false sharing under
//! high-rate concurrent senders.

use crate::errors::AllocError;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

pub type SequenceNumber = u64;

/// Outcome of testing a sequence number against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayResult {
    /// Higher than anything seen at this slot: not a replay.
    Pass,
    /// Equal to the highest seen at this slot: a duplicate.
    Replay,
    /// Lower than the highest seen at this slot: too old to tell apart from
    /// a replay, treated as stale rather than checked further.
    Stale,
}

/// Cache-line size assumed for index swizzling. 64 bytes covers the large
/// majority of current server and mobile cores; [`AntiReplay::new`] also
/// accepts 128 for platforms with larger lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLine {
    Bytes64,
    Bytes128,
}

/// A fixed-size sliding window of sequence-number high-water marks.
pub struct AntiReplay {
    slots: Box<[CachePadded<AtomicU64>]>,
    mask: u64,
    swizzle: Option<CacheLine>,
}

impl AntiReplay {
    /// `winsize` must be a power of two. `swizzle`, if given, scrambles the
    /// slot index assuming the named cache line size.
    pub fn new(winsize: u32, swizzle: Option<CacheLine>) -> Result<Self, AllocError> {
        let winsize = winsize as usize;
        if winsize == 0 || !winsize.is_power_of_two() {
            return Err(AllocError::InvalidWindowSize(winsize));
        }
        let mut slots = Vec::with_capacity(winsize);
        slots.resize_with(winsize, || CachePadded::new(AtomicU64::new(0)));
        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: winsize as u64 - 1,
            swizzle,
        })
    }

    fn index(&self, sn: SequenceNumber) -> usize {
        let sn = match self.swizzle {
            None => sn,
            Some(CacheLine::Bytes64) => sn ^ ((sn & 7) << 3),
            Some(CacheLine::Bytes128) => sn ^ ((sn & 15) << 4),
        };
        (sn & self.mask) as usize
    }

    /// Check `sn` against the window without recording it.
    pub fn test(&self, sn: SequenceNumber) -> ReplayResult {
        let idx = self.index(sn);
        let old = self.slots[idx].load(Ordering::Relaxed);
        classify(sn, old)
    }

    /// Check `sn` against the window and, if it passes or replays, record
    /// it as the new high-water mark for its slot (lock-free fetch-max).
    pub fn test_and_set(&self, sn: SequenceNumber) -> ReplayResult {
        let idx = self.index(sn);
        let slot = &self.slots[idx];
        let mut old = slot.load(Ordering::Relaxed);
        loop {
            if sn <= old {
                return classify(sn, old);
            }
            match slot.compare_exchange_weak(old, sn, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return ReplayResult::Pass,
                Err(actual) => old = actual,
            }
        }
    }
}

fn classify(sn: SequenceNumber, old: SequenceNumber) -> ReplayResult {
    if sn > old {
        ReplayResult::Pass
    } else if sn == old {
        ReplayResult::Replay
    } else {
        ReplayResult::Stale
    }
}
