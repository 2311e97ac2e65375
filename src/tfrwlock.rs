//! Task-fair reader/writer lock: a ticket-based lock where each acquirer
//! takes a ticket from an `enter` counter and waits for a matching `leave`
//! counter to catch up, giving FIFO-ish fairness between the reader and
//! writer populations (not full per-request FIFO, just "no request is
//! starved by a later one of the other kind").
//!
//! `enter` and `leave` are each split into a 16-bit reader half (low bits)
//! and a 16-bit writer half (high bits). A reader takes a ticket from
//! `enter`'s reader half and waits for `leave`'s writer half to reach the
//! writer-half value captured at ticket time (every writer queued ahead of
//! it has finished). A writer takes a ticket from `enter`'s writer half and
//! waits for `leave`'s writer half to reach its own ticket (its turn among
//! writers) and `leave`'s reader half to reach the reader-half value
//! captured at ticket time (every reader queued ahead of it has left).

use crate::backoff::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

const RD_MASK: u32 = 0x0000_FFFF;
const WR_SHIFT: u32 = 16;
const WR_INC: u32 = 1 << WR_SHIFT;

fn rd_half(word: u32) -> u32 {
    word & RD_MASK
}

fn wr_half(word: u32) -> u32 {
    word >> WR_SHIFT
}

pub struct TfRwLock {
    enter: AtomicU32,
    leave: AtomicU32,
}

/// Opaque ticket returned by [`TfRwLock::acquire_wr`], required by
/// [`TfRwLock::release_wr`].
#[derive(Debug, Clone, Copy)]
pub struct WriteTicket(u32);

impl TfRwLock {
    pub const fn new() -> Self {
        Self {
            enter: AtomicU32::new(0),
            leave: AtomicU32::new(0),
        }
    }

    fn wait_leave<F: Fn(u32) -> bool>(&self, pred: F) {
        let mut backoff = Backoff::new();
        loop {
            let leave = self.leave.load(Ordering::Acquire);
            if pred(leave) {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn acquire_rd(&self) {
        let prev = self.enter.fetch_add(1, Ordering::AcqRel);
        let my_wr_epoch = wr_half(prev);
        self.wait_leave(|leave| wr_half(leave) == my_wr_epoch);
    }

    pub fn try_acquire_rd(&self) -> bool {
        let cur = self.enter.load(Ordering::Relaxed);
        let leave = self.leave.load(Ordering::Acquire);
        if wr_half(leave) != wr_half(cur) {
            return false;
        }
        self.enter
            .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_rd(&self) {
        self.leave.fetch_add(1, Ordering::Release);
    }

    pub fn acquire_wr(&self) -> WriteTicket {
        let prev = self.enter.fetch_add(WR_INC, Ordering::AcqRel);
        let my_rd_epoch = rd_half(prev);
        let my_ticket = wr_half(prev);
        self.wait_leave(|leave| wr_half(leave) == my_ticket && rd_half(leave) == my_rd_epoch);
        WriteTicket(my_ticket)
    }

    pub fn release_wr(&self, ticket: WriteTicket) {
        debug_assert_eq!(wr_half(self.leave.load(Ordering::Relaxed)), ticket.0);
        self.leave.fetch_add(WR_INC, Ordering::Release);
    }
}

/// Recursive wrapper over [`TfRwLock`]. Unlike [`crate::rwlock::RwLockR`],
/// this wrapper has no `try_*` acquire variants: a ticket lock cannot be
/// "tried" without a way to hand back an already-drawn ticket, so neither
/// the underlying lock nor this wrapper attempts it.
pub struct TfRwLockR {
    inner: TfRwLock,
}

struct RecEntry {
    lock_addr: usize,
    first_acquire: bool,
    ticket: Option<WriteTicket>,
}

thread_local! {
    static TF_STACK: std::cell::RefCell<Vec<RecEntry>> = std::cell::RefCell::new(Vec::with_capacity(crate::recursive::MAX_DEPTH));
}

impl TfRwLockR {
    pub const fn new() -> Self {
        Self {
            inner: TfRwLock::new(),
        }
    }

    fn addr(&self) -> usize {
        std::ptr::addr_of!(self.inner) as usize
    }

    fn holds(addr: usize) -> bool {
        TF_STACK.with(|s| s.borrow().iter().any(|e| e.lock_addr == addr))
    }

    pub fn acquire_rd(&self) {
        let addr = self.addr();
        let first = !Self::holds(addr);
        if first {
            self.inner.acquire_rd();
        }
        TF_STACK.with(|s| {
            let mut entries = s.borrow_mut();
            if entries.len() >= crate::recursive::MAX_DEPTH {
                crate::errors::report("tfrwlock_r", "recursive lock depth exceeded", entries.len());
                return;
            }
            entries.push(RecEntry {
                lock_addr: addr,
                first_acquire: first,
                ticket: None,
            });
        });
    }

    pub fn release_rd(&self) {
        let addr = self.addr();
        let first = TF_STACK.with(|s| {
            let mut entries = s.borrow_mut();
            match entries.last() {
                Some(top) if top.lock_addr == addr => {
                    let first = top.first_acquire;
                    entries.pop();
                    first
                }
                _ => {
                    crate::errors::report("tfrwlock_r", "release out of LIFO order", addr);
                    false
                }
            }
        });
        if first {
            self.inner.release_rd();
        }
    }

    pub fn acquire_wr(&self) -> bool {
        let addr = self.addr();
        if Self::holds(addr) {
            crate::errors::report("tfrwlock_r", "acquire-write after acquire-read", addr);
            return false;
        }
        let ticket = self.inner.acquire_wr();
        TF_STACK.with(|s| {
            s.borrow_mut().push(RecEntry {
                lock_addr: addr,
                first_acquire: true,
                ticket: Some(ticket),
            });
        });
        true
    }

    pub fn release_wr(&self) {
        let addr = self.addr();
        let ticket = TF_STACK.with(|s| {
            let mut entries = s.borrow_mut();
            match entries.last() {
                Some(top) if top.lock_addr == addr => entries.pop().and_then(|e| e.ticket),
                _ => {
                    crate::errors::report("tfrwlock_r", "release out of LIFO order", addr);
                    None
                }
            }
        });
        if let Some(t) = ticket {
            self.inner.release_wr(t);
        }
    }
}

impl Default for TfRwLockR {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for TfRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_mutual_exclusion() {
        let lock = TfRwLock::new();
        lock.acquire_rd();
        lock.acquire_rd();
        lock.release_rd();
        lock.release_rd();

        let t = lock.acquire_wr();
        lock.release_wr(t);
    }

    #[test]
    fn concurrent_readers_writers() {
        use std::sync::atomic::AtomicI64;
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(TfRwLock::new());
        let counter = Arc::new(AtomicI64::new(0));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..300 {
                        let t = lock.acquire_wr();
                        counter.fetch_add(1, Ordering::Relaxed);
                        lock.release_wr(t);
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..300 {
                        lock.acquire_rd();
                        lock.release_rd();
                    }
                })
            })
            .collect();
        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1200);
    }
}
