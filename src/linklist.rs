//! Harris-style lock-free sorted singly linked list.
//!
//! Each node's `next` pointer carries a low mark bit meaning "logically
//! removed." Once set, the mark bit is never cleared; a marked node is
//! still traversable (so concurrent walkers behind it keep working) but is
//! physically unlinked by the next writer or reader that passes over it
//! ("helping"). The list is kept sorted by key so search can stop early.
//!
//! A node is only ever dereferenced after its pointer is published in the
//! caller's hazard slot and re-verified still reachable, and a physically
//! unlinked node is retired through the list's own hazard-pointer domain
//! rather than freed on the spot: another thread may have read the same
//! pointer just before the unlink and not yet finished its traversal.

use crate::smr::{HazardDomain, HazardGuard, Smr, SmrGuard};
use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Outcome of a [`LinkList::insert`] or [`LinkList::remove`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinklistStatus {
    Success,
    NotFound,
    /// The predecessor the caller (or a retried internal cursor) was
    /// working from is itself marked for removal; the operation must be
    /// retried from an earlier cursor position.
    PredMark,
}

struct Node<K, V> {
    key: K,
    value: Option<V>,
    next: AtomicPtr<Node<K, V>>,
}

const MARK: usize = 1;

fn is_marked<K, V>(p: *mut Node<K, V>) -> bool {
    (p as usize) & MARK != 0
}

fn unmark<K, V>(p: *mut Node<K, V>) -> *mut Node<K, V> {
    ((p as usize) & !MARK) as *mut Node<K, V>
}

fn mark<K, V>(p: *mut Node<K, V>) -> *mut Node<K, V> {
    ((p as usize) | MARK) as *mut Node<K, V>
}

/// A lock-free sorted linked list keyed by `K: Ord`.
pub struct LinkList<K, V> {
    head: AtomicPtr<Node<K, V>>,
    domain: HazardDomain,
}

unsafe impl<K: Send, V: Send> Send for LinkList<K, V> {}
unsafe impl<K: Send, V: Send> Sync for LinkList<K, V> {}

struct Cursor<K, V> {
    pred: *mut Node<K, V>,
    curr: *mut Node<K, V>,
}

impl<K: Ord, V> LinkList<K, V> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            domain: HazardDomain::new(),
        }
    }

    /// Search for the first node with key `>= key`, helping unlink any
    /// marked nodes encountered along the way. Retries internally
    /// (`'retry`) whenever a helping unlink loses its CAS race, or when a
    /// node can't be confirmed still reachable after being hazard-protected.
    ///
    /// `pred` and `curr` are published in `guard`'s hazard slots 0 and 1 for
    /// the duration of the returned cursor's use; the caller must keep
    /// `guard` alive until it is done dereferencing the cursor.
    fn find(&self, key: &K, guard: &HazardGuard<'_>) -> Cursor<K, V> {
        'retry: loop {
            let mut pred: *mut Node<K, V> = ptr::null_mut();
            guard.clear(0);
            loop {
                let link = if pred.is_null() {
                    &self.head
                } else {
                    // SAFETY: pred is hazard-protected from the previous step.
                    unsafe { &(*pred).next }
                };
                // SAFETY: head is never marked (it is not itself a list node).
                let curr = unmark(link.load(Ordering::Acquire));
                if curr.is_null() {
                    guard.clear(1);
                    return Cursor { pred, curr };
                }
                if guard.protect(1, curr).is_none() {
                    continue 'retry;
                }
                // Re-verify curr is still linked where we read it from; if
                // not, a concurrent unlink may be about to retire it and we
                // must not dereference it.
                if unmark(link.load(Ordering::Acquire)) != curr {
                    continue 'retry;
                }
                // SAFETY: curr is hazard-protected and confirmed reachable.
                let next_raw = unsafe { (*curr).next.load(Ordering::Acquire) };
                let unmarked_next = unmark(next_raw);
                if is_marked(next_raw) {
                    let cas_target: &AtomicPtr<Node<K, V>> = if pred.is_null() {
                        &self.head
                    } else {
                        // SAFETY: pred was reached via a live link chain.
                        unsafe { &(*pred).next }
                    };
                    if cas_target
                        .compare_exchange(curr, unmarked_next, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        continue 'retry;
                    }
                    // SAFETY: this thread won the unlink CAS; defer
                    // reclamation since another thread may still hold a
                    // hazard pointer to `curr` from a traversal that hasn't
                    // reached its re-verify step yet.
                    unsafe {
                        self.domain.retire(curr.cast(), |p| {
                            unsafe { drop(Box::from_raw(p.cast::<Node<K, V>>())) };
                        });
                    }
                    continue;
                }
                // SAFETY: curr valid per loop invariant above.
                let curr_key = unsafe { &(*curr).key };
                match curr_key.cmp(key) {
                    CmpOrdering::Less => {
                        guard.protect(0, curr);
                        pred = curr;
                    }
                    CmpOrdering::Equal | CmpOrdering::Greater => {
                        return Cursor { pred, curr };
                    }
                }
            }
        }
    }

    /// Insert `(key, value)`, keeping the list sorted. Returns
    /// [`LinklistStatus::Success`] even if an equal key already exists
    /// (duplicates are inserted before the existing equal-keyed run,
    /// matching the original's predecessor-based insert contract).
    pub fn insert(&self, mut key: K, mut value: V) -> LinklistStatus {
        let guard = self.domain.register();
        loop {
            let cursor = self.find(&key, &guard);
            let node = Box::into_raw(Box::new(Node {
                key,
                value: Some(value),
                next: AtomicPtr::new(cursor.curr),
            }));
            let target: &AtomicPtr<Node<K, V>> = if cursor.pred.is_null() {
                &self.head
            } else {
                // SAFETY: pred is hazard-protected and live per `find`.
                unsafe { &(*cursor.pred).next }
            };
            match target.compare_exchange(cursor.curr, node, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return LinklistStatus::Success,
                Err(_) => {
                    // SAFETY: node never published, we still own it; recover
                    // key/value to retry rather than re-consuming moved-from
                    // locals.
                    let reclaimed = unsafe { Box::from_raw(node) };
                    key = reclaimed.key;
                    value = reclaimed.value.expect("value just inserted above");
                }
            }
        }
    }

    /// Logically remove the first node with this key. Returns `NotFound`
    /// if no such key is present.
    pub fn remove(&self, key: &K) -> LinklistStatus {
        let guard = self.domain.register();
        loop {
            let cursor = self.find(key, &guard);
            if cursor.curr.is_null() {
                return LinklistStatus::NotFound;
            }
            // SAFETY: curr is hazard-protected and live per `find`.
            let curr_key_matches = unsafe { (*cursor.curr).key == *key };
            if !curr_key_matches {
                return LinklistStatus::NotFound;
            }
            // SAFETY: curr is live.
            let next = unsafe { (*cursor.curr).next.load(Ordering::Acquire) };
            if is_marked(next) {
                continue;
            }
            let marked_next = mark(next);
            // SAFETY: curr is live; mark its own next pointer first so
            // concurrent readers see the removal before physical unlink.
            let marked = unsafe {
                (*cursor.curr)
                    .next
                    .compare_exchange(next, marked_next, Ordering::AcqRel, Ordering::Relaxed)
            };
            if marked.is_err() {
                continue;
            }
            // Best-effort physical unlink; if it fails, a later traverser
            // (via `find`'s helping logic) will finish the job.
            let target: &AtomicPtr<Node<K, V>> = if cursor.pred.is_null() {
                &self.head
            } else {
                // SAFETY: pred is hazard-protected and live.
                unsafe { &(*cursor.pred).next }
            };
            if target
                .compare_exchange(cursor.curr, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: this thread won the unlink CAS; defer reclamation
                // since another thread may still hold a hazard pointer to
                // `curr` from a concurrent traversal.
                unsafe {
                    self.domain.retire(cursor.curr.cast(), |p| {
                        unsafe { drop(Box::from_raw(p.cast::<Node<K, V>>())) };
                    });
                }
            }
            return LinklistStatus::Success;
        }
    }

    /// `true` if a node with this key is present and not (yet, as observed)
    /// marked for removal.
    pub fn contains(&self, key: &K) -> bool {
        let guard = self.domain.register();
        let cursor = self.find(key, &guard);
        !cursor.curr.is_null() && unsafe { (*cursor.curr).key == *key }
    }
}

impl<K: Ord, V> Default for LinkList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for LinkList<K, V> {
    fn drop(&mut self) {
        let mut curr = unmark(*self.head.get_mut());
        while !curr.is_null() {
            // SAFETY: sole owner at drop time.
            let mut node = unsafe { Box::from_raw(curr) };
            curr = unmark(*node.next.get_mut());
            node.value.take();
        }
    }
}
