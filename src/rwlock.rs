//! Writer-preference reader/writer lock: a single 32-bit word where the
//! high bit marks a present (or pending) writer and the low 31 bits count
//! concurrently held readers.
//!
//! A new reader is blocked while the writer bit is set; a new writer waits
//! for the word to reach zero. Writer preference is implicit in the word
//! layout only insofar as a writer claims the high bit before readers can
//! increment past it — no separate fairness queue is maintained, matching
//! the documented "no fairness guarantee beyond what's stated" non-goal.

use crate::backoff::Backoff;
use crate::errors;
use crate::recursive::RecursiveStack;
use std::sync::atomic::{AtomicU32, Ordering};

const WRITER_BIT: u32 = 1 << 31;
const READER_MASK: u32 = WRITER_BIT - 1;

pub struct RwLock {
    word: AtomicU32,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    pub fn acquire_rd(&self) {
        let mut backoff = Backoff::new();
        loop {
            let w = self.word.load(Ordering::Relaxed);
            if w & WRITER_BIT == 0 {
                if self
                    .word
                    .compare_exchange_weak(w, w + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire_rd(&self) -> bool {
        let w = self.word.load(Ordering::Relaxed);
        w & WRITER_BIT == 0
            && self
                .word
                .compare_exchange(w, w + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub fn release_rd(&self) {
        let prev = self.word.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READER_MASK > 0, "release_rd with no readers held");
    }

    pub fn acquire_wr(&self) {
        let mut backoff = Backoff::new();
        loop {
            if self
                .word
                .compare_exchange_weak(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire_wr(&self) -> bool {
        self.word
            .compare_exchange(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_wr(&self) {
        debug_assert_eq!(self.word.load(Ordering::Relaxed), WRITER_BIT);
        self.word.store(0, Ordering::Release);
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive wrapper over [`RwLock`]: a thread may acquire-read repeatedly,
/// and may acquire-read after already holding the write lock, but may not
/// acquire-write while already holding a read lock on the same instance.
pub struct RwLockR {
    inner: RwLock,
}

impl RwLockR {
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(),
        }
    }

    fn addr(&self) -> usize {
        std::ptr::addr_of!(self.inner) as usize
    }

    pub fn acquire_rd(&self) {
        let addr = self.addr();
        let first = !RecursiveStack::holds(addr);
        if first {
            self.inner.acquire_rd();
        }
        RecursiveStack::push(addr, first);
    }

    pub fn try_acquire_rd(&self) -> bool {
        let addr = self.addr();
        let first = !RecursiveStack::holds(addr);
        if first && !self.inner.try_acquire_rd() {
            return false;
        }
        RecursiveStack::push(addr, first)
    }

    pub fn release_rd(&self) {
        let addr = self.addr();
        if RecursiveStack::pop(addr) {
            self.inner.release_rd();
        }
    }

    /// Acquire the write lock. Reports an error (via the installed error
    /// handler) and refuses if this thread already holds the read lock on
    /// the same instance, matching the "write after read" rejection.
    pub fn acquire_wr(&self) -> bool {
        let addr = self.addr();
        if RecursiveStack::holds(addr) {
            errors::report("rwlock_r", "acquire-write after acquire-read", addr);
            return false;
        }
        let first = true;
        self.inner.acquire_wr();
        RecursiveStack::push(addr, first);
        true
    }

    pub fn release_wr(&self) {
        let addr = self.addr();
        if RecursiveStack::pop(addr) {
            self.inner.release_wr();
        }
    }
}

impl Default for RwLockR {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new();
        lock.acquire_wr();
        assert!(!lock.try_acquire_rd());
        lock.release_wr();
        assert!(lock.try_acquire_rd());
        lock.release_rd();
    }

    #[test]
    fn readers_share() {
        let lock = RwLock::new();
        lock.acquire_rd();
        lock.acquire_rd();
        assert!(!lock.try_acquire_wr());
        lock.release_rd();
        lock.release_rd();
        assert!(lock.try_acquire_wr());
        lock.release_wr();
    }

    #[test]
    fn recursive_read_nesting() {
        let lock = RwLockR::new();
        lock.acquire_rd();
        lock.acquire_rd();
        lock.release_rd();
        lock.release_rd();
    }

    #[test]
    fn concurrent_mutual_exclusion() {
        let lock = Arc::new(RwLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..500 {
                        lock.acquire_wr();
                        let before = counter.load(Ordering::Relaxed);
                        counter.store(before + 1, Ordering::Relaxed);
                        lock.release_wr();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
