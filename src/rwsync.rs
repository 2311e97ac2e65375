//! Seqlock-style reader/writer synchroniser: a single 32-bit even/odd
//! counter protecting associated data without ever blocking a writer on a
//! reader.
//!
//! The counter is even when no write is in progress and odd while one is.
//! A reader snapshots the counter, reads the data, then checks the counter
//! is unchanged; if a write happened in between (the snapshot no longer
//! matches), the reader must discard what it read and retry. Readers never
//! block writers and writers never block on readers, only on each other.

use crate::backoff::Backoff;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A reader/writer synchroniser. Carries no data itself; callers wrap their
/// own state and use [`RwSync::read`]/[`RwSync::write`] (or the raw
/// acquire/release pairs) to guard access to it.
pub struct RwSync {
    word: AtomicU32,
}

impl RwSync {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Acquire for reading. Returns a snapshot to pass to
    /// [`RwSync::release_rd`]; never blocks a concurrent writer.
    pub fn acquire_rd(&self) -> u32 {
        let mut backoff = Backoff::new();
        loop {
            let v = self.word.load(Ordering::Acquire);
            if v & 1 == 0 {
                return v;
            }
            backoff.snooze();
        }
    }

    /// Release a read acquisition. Returns `false` if a write occurred (or
    /// is still in progress) since `prv` was taken, meaning anything read
    /// under that snapshot may be torn and the operation must retry.
    pub fn release_rd(&self, prv: u32) -> bool {
        self.word.load(Ordering::Acquire) == prv
    }

    /// Acquire for writing. Blocks until any earlier write has completed.
    pub fn acquire_wr(&self) {
        let mut backoff = Backoff::new();
        loop {
            let v = self.word.load(Ordering::Relaxed);
            if v & 1 == 0
                && self
                    .word
                    .compare_exchange_weak(v, v.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn release_wr(&self) {
        self.word.fetch_add(1, Ordering::Release);
    }

    /// Read `data` under the synchroniser, retrying the snapshot-copy until
    /// no concurrent write is observed.
    pub fn read<T: Copy>(&self, data: &T) -> T {
        loop {
            let prv = self.acquire_rd();
            let snapshot = *data;
            if self.release_rd(prv) {
                return snapshot;
            }
        }
    }

    /// Write `data` under the synchroniser via `f`, excluding concurrent
    /// writers (but never blocking concurrent readers from retrying).
    pub fn write<T>(&self, data: &mut T, f: impl FnOnce(&mut T)) {
        self.acquire_wr();
        f(data);
        self.release_wr();
    }
}

impl Default for RwSync {
    fn default() -> Self {
        Self::new()
    }
}

const INVALID_TID: u64 = 0;

/// Recursive wrapper over [`RwSync`] for the write side only: nested
/// `acquire_wr` calls by the same thread collapse into the outermost one.
/// Unlike [`crate::rwlock::RwLockR`], a thread that already holds the write
/// side is flatly rejected from acquiring the read side (there is no
/// consistent snapshot to hand back while its own write is in flight), and
/// there is no recursive read side at all.
pub struct RwSyncR {
    sync: RwSync,
    owner: AtomicU64,
    count: AtomicU32,
}

impl RwSyncR {
    pub const fn new() -> Self {
        Self {
            sync: RwSync::new(),
            owner: AtomicU64::new(INVALID_TID),
            count: AtomicU32::new(0),
        }
    }

    /// Acquire for reading. Returns `None` (after reporting via the error
    /// handler) if this thread already holds the write side.
    pub fn acquire_rd(&self) -> Option<u32> {
        let tid = crate::recursive::current_thread_id();
        if self.owner.load(Ordering::Relaxed) == tid {
            crate::errors::report("rwsync_r", "acquire-read after acquire-write", tid as usize);
            return None;
        }
        Some(self.sync.acquire_rd())
    }

    pub fn release_rd(&self, prv: u32) -> bool {
        self.sync.release_rd(prv)
    }

    pub fn acquire_wr(&self) {
        let tid = crate::recursive::current_thread_id();
        if self.owner.load(Ordering::Relaxed) != tid {
            self.sync.acquire_wr();
            debug_assert_eq!(self.count.load(Ordering::Relaxed), 0);
            self.owner.store(tid, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release_wr(&self) {
        if self.count.load(Ordering::Relaxed) == 0 {
            crate::errors::report("rwsync_r", "excess release call", 0);
            return;
        }
        if self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(INVALID_TID, Ordering::Relaxed);
            self.sync.release_wr();
        }
    }
}

impl Default for RwSyncR {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_retries_across_write() {
        let sync = RwSync::new();
        let mut data = 41i64;

        let prv = sync.acquire_rd();
        assert_eq!(sync.release_rd(prv), true);

        sync.write(&mut data, |d| *d += 1);
        assert_eq!(sync.read(&data), 42);
    }

    #[test]
    fn writers_mutually_exclude() {
        let sync = Arc::new(RwSync::new());
        let data = Arc::new(std::sync::Mutex::new(0i64));
        let counter = Arc::new(AtomicI64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..200 {
                        sync.acquire_wr();
                        counter.fetch_add(1, Ordering::Relaxed);
                        sync.release_wr();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let _ = data;
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn recursive_write_nesting() {
        let sync = RwSyncR::new();
        sync.acquire_wr();
        sync.acquire_wr();
        sync.release_wr();
        sync.release_wr();
    }

    #[test]
    fn read_after_write_same_thread_rejected() {
        let sync = RwSyncR::new();
        sync.acquire_wr();
        assert!(sync.acquire_rd().is_none());
        sync.release_wr();
    }
}
