//! Shared per-thread recursive-lock bookkeeping, used by the recursive
//! wrappers of `rwlock`, `tfrwlock`, and `rwsync`.
//!
//! Each thread maintains a bounded stack of locks it currently holds
//! (depth 32, matching the non-recursive locks' own lack of a dynamic
//! allocation budget) plus a bitmask recording which stack entries were
//! *first* acquisitions of their lock by this thread — only those entries
//! must release the underlying lock when popped; a second nested
//! acquire-read by the same thread on the same lock is a no-op acquire and
//! a no-op release.

use crate::errors;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MAX_DEPTH: usize = 32;

thread_local! {
    static THREAD_ID: u64 = next_thread_id();
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_thread_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A stable, process-unique identifier for the calling thread, assigned
/// lazily on first use (not an OS thread ID).
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// One entry in a thread's recursive-lock stack: which lock (identified by
/// its address) and whether this thread's acquisition was the first (and
/// therefore must release the underlying lock on pop).
#[derive(Clone, Copy)]
struct Entry {
    lock_addr: usize,
    first_acquire: bool,
}

/// Per-thread bounded stack of held recursive locks, keyed by lock address
/// so a single thread-local serves every recursive lock instance in the
/// process.
pub struct RecursiveStack {
    entries: RefCell<Vec<Entry>>,
}

thread_local! {
    static STACK: RecursiveStack = RecursiveStack {
        entries: RefCell::new(Vec::with_capacity(MAX_DEPTH)),
    };
}

impl RecursiveStack {
    /// Returns `true` if this thread already holds `lock_addr` at some
    /// depth (used to reject write-after-read recursion).
    pub fn holds(lock_addr: usize) -> bool {
        STACK.with(|s| s.entries.borrow().iter().any(|e| e.lock_addr == lock_addr))
    }

    pub fn depth() -> usize {
        STACK.with(|s| s.entries.borrow().len())
    }

    /// Push a new entry, reporting via the error handler (and refusing) if
    /// the bounded depth would be exceeded.
    pub fn push(lock_addr: usize, first_acquire: bool) -> bool {
        STACK.with(|s| {
            let mut entries = s.entries.borrow_mut();
            if entries.len() >= MAX_DEPTH {
                errors::report("rwlock_r", "recursive lock depth exceeded", entries.len());
                return false;
            }
            entries.push(Entry {
                lock_addr,
                first_acquire,
            });
            true
        })
    }

    /// Pop the top entry, reporting via the error handler if it does not
    /// match `lock_addr` (LIFO release-order violation). Returns whether
    /// the popped entry was a first-acquire (and therefore the caller must
    /// release the underlying lock too).
    pub fn pop(lock_addr: usize) -> bool {
        STACK.with(|s| {
            let mut entries = s.entries.borrow_mut();
            match entries.last() {
                Some(top) if top.lock_addr == lock_addr => {
                    let first = top.first_acquire;
                    entries.pop();
                    first
                }
                _ => {
                    errors::report("rwlock_r", "release out of LIFO order", lock_addr);
                    false
                }
            }
        })
    }
}
