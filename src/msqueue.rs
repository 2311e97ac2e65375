//! Michael & Scott lock-free FIFO queue, in three ABA-defense flavors:
//! an internal lock, a tagged `(ptr, tag)` pair, and hazard-pointer SMR.
//!
//! The queue always holds a dummy head node; a successful dequeue retires
//! the old dummy and the node following it becomes the new dummy. Enqueue
//! helps swing a stale tail forward before attempting its own link.
//!
//! Tag mode's generation tag defends the head/tail CAS against ABA, but a
//! thread that already holds a stale head or tail pointer can still race a
//! concurrent dequeue that retires that same node. Tag mode therefore
//! protects every pointer it is about to dereference with this queue's own
//! internal hazard domain before touching it, and defers the old dummy's
//! reclamation to that domain instead of freeing it on the spot.

use crate::config::QueueAbaMode;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pr::DwCas;
use crate::smr::{HazardDomain, Smr, SmrGuard};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

fn ptr_to_word<T>(p: *mut T) -> u64 {
    p as usize as u64
}

fn word_to_ptr<T>(word: u64) -> *mut T {
    word as usize as *mut T
}

pub struct MsQueue<T> {
    mode: QueueAbaMode,
    head: DwCas,
    tail: DwCas,
    lock: Mutex<()>,
    // Backs Tag mode's internal deferred reclamation. Smr mode ignores
    // this and takes an explicit domain via `pop_with_smr` instead.
    domain: HazardDomain,
    metrics: Metrics,
}

unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T> MsQueue<T> {
    pub fn new(mode: QueueAbaMode) -> Self {
        let dummy = Box::into_raw(Box::new(Node {
            value: None,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let dummy_word = ptr_to_word(dummy);
        Self {
            mode,
            head: DwCas::new(dummy_word, 0),
            tail: DwCas::new(dummy_word, 0),
            lock: Mutex::new(()),
            domain: HazardDomain::new(),
            metrics: Metrics::new(),
        }
    }

    /// Snapshot of this queue's live counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value: Some(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        match self.mode {
            QueueAbaMode::Lock => {
                let _g = self.lock.lock().unwrap();
                // SAFETY: lock held, tail is exclusively ours to extend.
                let tail: *mut Node<T> = word_to_ptr(self.tail.load(Ordering::Relaxed).0);
                unsafe { (*tail).next.store(node, Ordering::Relaxed) };
                self.tail.store((ptr_to_word(node), 0), Ordering::Relaxed);
            }
            QueueAbaMode::Tag | QueueAbaMode::Smr => {
                let guard = self.domain.register();
                loop {
                    let (tail_word, tail_tag) = self.tail.load(Ordering::Acquire);
                    let tail: *mut Node<T> = word_to_ptr(tail_word);
                    if guard.protect(0, tail).is_none() {
                        continue;
                    }
                    if self.tail.load(Ordering::Acquire).0 != tail_word {
                        continue;
                    }
                    // SAFETY: tail is hazard-protected, so it cannot have
                    // been retired while we dereference it.
                    let next = unsafe { (*tail).next.load(Ordering::Acquire) };
                    if next.is_null() {
                        // SAFETY: tail observed with a null next; attempt to link.
                        let r = unsafe {
                            (*tail).next.compare_exchange(
                                ptr::null_mut(),
                                node,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                        };
                        if r.is_ok() {
                            let _ = self.tail.compare_exchange(
                                (tail_word, tail_tag),
                                (ptr_to_word(node), tail_tag.wrapping_add(1)),
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            );
                            guard.clear(0);
                            break;
                        }
                    } else {
                        let _ = self.tail.compare_exchange(
                            (tail_word, tail_tag),
                            (ptr_to_word(next), tail_tag.wrapping_add(1)),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                    }
                }
            }
        }
        self.metrics.items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<T> {
        match self.mode {
            QueueAbaMode::Lock => {
                let _g = self.lock.lock().unwrap();
                let head: *mut Node<T> = word_to_ptr(self.head.load(Ordering::Relaxed).0);
                // SAFETY: head is the current dummy, exclusively accessed
                // under the lock.
                let next = unsafe { (*head).next.load(Ordering::Relaxed) };
                if next.is_null() {
                    return None;
                }
                self.head.store((ptr_to_word(next), 0), Ordering::Relaxed);
                // SAFETY: old head (dummy) is no longer reachable; we hold
                // the lock so no other thread can still be using it.
                let old_dummy = unsafe { Box::from_raw(head) };
                drop(old_dummy);
                // SAFETY: next becomes the new dummy; its value is taken
                // and replaced conceptually by leaving the node itself live
                // as the new sentinel. We read its value out.
                let value = unsafe { (*next).value.take() };
                self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                value
            }
            QueueAbaMode::Tag => {
                let guard = self.domain.register();
                loop {
                    let (head_word, head_tag) = self.head.load(Ordering::Acquire);
                    if guard.protect(0, word_to_ptr::<Node<T>>(head_word)).is_none() {
                        continue;
                    }
                    if self.head.load(Ordering::Acquire).0 != head_word {
                        continue;
                    }
                    let head: *mut Node<T> = word_to_ptr(head_word);
                    let (tail_word, _) = self.tail.load(Ordering::Acquire);
                    // SAFETY: head is hazard-protected.
                    let next = unsafe { (*head).next.load(Ordering::Acquire) };
                    if head_word == tail_word {
                        if next.is_null() {
                            guard.clear(0);
                            return None;
                        }
                        let (cur_tail_word, cur_tail_tag) = self.tail.load(Ordering::Acquire);
                        let _ = self.tail.compare_exchange(
                            (cur_tail_word, cur_tail_tag),
                            (ptr_to_word(next), cur_tail_tag.wrapping_add(1)),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                        continue;
                    }
                    if next.is_null() {
                        continue;
                    }
                    if guard.protect(1, next).is_none() {
                        continue;
                    }
                    if self
                        .head
                        .compare_exchange(
                            (head_word, head_tag),
                            (ptr_to_word(next), head_tag.wrapping_add(1)),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        guard.clear(0);
                        guard.clear(1);
                        // SAFETY: this thread won the CAS; defer reclamation
                        // of the old dummy since other threads may still
                        // hold a hazard pointer to it from an in-flight
                        // traversal.
                        let value = unsafe {
                            let v = (*next).value.take();
                            self.domain.retire(head.cast(), |p| {
                                unsafe { drop(Box::from_raw(p.cast::<Node<T>>())) };
                            });
                            v
                        };
                        self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                        return value;
                    }
                }
            }
            QueueAbaMode::Smr => {
                panic!("QueueAbaMode::Smr requires pop_with_smr(domain); plain pop() is not available in this mode");
            }
        }
    }

    /// Pop using an explicit SMR domain, for `QueueAbaMode::Smr`.
    pub fn pop_with_smr<S: Smr>(&self, domain: &S) -> Option<T> {
        assert_eq!(self.mode, QueueAbaMode::Smr, "pop_with_smr requires QueueAbaMode::Smr");
        let guard = domain.register();
        loop {
            let (head_word, head_tag) = self.head.load(Ordering::Acquire);
            if guard.protect(0, word_to_ptr::<Node<T>>(head_word)).is_none() {
                continue;
            }
            if self.head.load(Ordering::Acquire).0 != head_word {
                continue;
            }
            let head: *mut Node<T> = word_to_ptr(head_word);
            let (tail_word, _) = self.tail.load(Ordering::Acquire);
            // SAFETY: head is hazard-protected.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if head_word == tail_word {
                if next.is_null() {
                    guard.clear(0);
                    return None;
                }
                let (cur_tail_word, cur_tail_tag) = self.tail.load(Ordering::Acquire);
                let _ = self.tail.compare_exchange(
                    (cur_tail_word, cur_tail_tag),
                    (ptr_to_word(next), cur_tail_tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }
            if next.is_null() {
                continue;
            }
            if guard.protect(1, next).is_none() {
                continue;
            }
            if self
                .head
                .compare_exchange(
                    (head_word, head_tag),
                    (ptr_to_word(next), head_tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                guard.clear(0);
                guard.clear(1);
                // SAFETY: this thread won the CAS; defer reclamation of the
                // old dummy since other threads may still hold a hazard
                // pointer to it from an in-flight traversal.
                let value = unsafe {
                    let v = (*next).value.take();
                    domain.retire(head.cast(), |p| {
                        unsafe { drop(Box::from_raw(p.cast::<Node<T>>())) };
                    });
                    v
                };
                self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                return value;
            }
        }
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        let mut head: *mut Node<T> = word_to_ptr(*self.head.ptr_mut());
        while !head.is_null() {
            // SAFETY: sole owner at drop time, chain is acyclic.
            let node = unsafe { Box::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smr::HazardDomain;

    #[test]
    fn fifo_lock_mode() {
        let q: MsQueue<i32> = MsQueue::new(QueueAbaMode::Lock);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn fifo_tag_mode() {
        let q: MsQueue<i32> = MsQueue::new(QueueAbaMode::Tag);
        for i in 0..10 {
            q.push(i);
        }
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn metrics_track_push_pop_counts() {
        let q: MsQueue<i32> = MsQueue::new(QueueAbaMode::Tag);
        q.push(1);
        q.push(2);
        q.pop();
        let snap = q.metrics();
        assert_eq!(snap.items_enqueued, 2);
        assert_eq!(snap.items_dequeued, 1);
    }

    #[test]
    fn smr_mode_set_equality() {
        let q: MsQueue<i32> = MsQueue::new(QueueAbaMode::Smr);
        let domain = HazardDomain::new();
        for i in 0..10 {
            q.push(i);
        }
        let mut out = Vec::new();
        while let Some(v) = q.pop_with_smr(&domain) {
            out.push(v);
        }
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_mpmc_preserves_elements() {
        use std::sync::Arc;
        use std::thread;

        let q: Arc<MsQueue<u64>> = Arc::new(MsQueue::new(QueueAbaMode::Tag));
        let n = 2000u64;
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..n / 4 {
                        q.push(t * (n / 4) + i);
                    }
                })
            })
            .collect();
        for h in pushers {
            h.join().unwrap();
        }
        let mut out = Vec::new();
        while let Some(v) = q.pop() {
            out.push(v);
        }
        out.sort_unstable();
        assert_eq!(out, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn single_producer_preserves_fifo_order() {
        let q: MsQueue<u64> = MsQueue::new(QueueAbaMode::Tag);
        for i in 0..2000u64 {
            q.push(i);
        }
        for i in 0..2000u64 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn concurrent_tag_mode_poppers_drain_without_use_after_free() {
        use std::sync::Arc;
        use std::sync::Mutex as StdMutex;
        use std::thread;

        // Multiple threads pop concurrently from the same queue, forcing
        // the old-dummy retirement path to race against other threads that
        // may still hold a hazard pointer to the node being retired.
        let q: Arc<MsQueue<u64>> = Arc::new(MsQueue::new(QueueAbaMode::Tag));
        let n = 4000u64;
        for i in 0..n {
            q.push(i);
        }

        let out: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
        let poppers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                let out = Arc::clone(&out);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(v) = q.pop() {
                        mine.push(v);
                    }
                    out.lock().unwrap().extend(mine);
                })
            })
            .collect();
        for h in poppers {
            h.join().unwrap();
        }

        let mut got = out.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..n).collect::<Vec<_>>());
    }
}
