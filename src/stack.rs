//! Treiber stack with four ABA-defense flavors: a plain internal lock, a
//! tagged `(head, tag)` pair via double-word CAS, hazard-pointer safe memory
//! reclamation, and a single-CAS LL/SC-style mode.
//!
//! Nodes are caller-owned: `push` takes a value and `pop` hands ownership
//! back out, mirroring the freelist discipline of the original (no internal
//! arena, no hidden allocation beyond the one `Box` per element).
//!
//! A tag alone only defends the head-pointer CAS against ABA; it says
//! nothing about a thread that already holds a stale head pointer and is
//! about to dereference it while another thread concurrently pops and
//! frees that same node. Tag and Llsc modes therefore also route node
//! reclamation through an internal hazard-pointer domain, the same
//! mechanism `Smr` mode exposes explicitly: a popped node is retired, not
//! freed, until no thread's hazard slot still points at it.

use crate::config::StackAbaMode;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pr::DwCas;
use crate::smr::{HazardDomain, Smr, SmrGuard};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

fn ptr_to_word<T>(p: *mut T) -> u64 {
    p as usize as u64
}

fn word_to_ptr<T>(word: u64) -> *mut T {
    word as usize as *mut T
}

/// A Treiber stack parameterized by ABA-defense strategy.
pub struct Stack<T> {
    mode: StackAbaMode,
    // Tag and Smr modes: packed head pointer + generation tag, CAS'd
    // together via the portable double-word CAS.
    tagged_head: DwCas,
    // Lock mode.
    locked_head: Mutex<*mut Node<T>>,
    // Llsc mode: single pointer, no tag.
    llsc_head: AtomicPtr<Node<T>>,
    // Backs Tag and Llsc modes' internal deferred reclamation. Smr mode
    // ignores this and takes an explicit domain via `pop_with_smr` instead.
    domain: HazardDomain,
    metrics: Metrics,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    pub fn new(mode: StackAbaMode) -> Self {
        Self {
            mode,
            tagged_head: DwCas::new(0, 0),
            locked_head: Mutex::new(ptr::null_mut()),
            llsc_head: AtomicPtr::new(ptr::null_mut()),
            domain: HazardDomain::new(),
            metrics: Metrics::new(),
        }
    }

    /// Snapshot of this stack's live counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        match self.mode {
            StackAbaMode::Lock => {
                let mut head = self.locked_head.lock().unwrap();
                // SAFETY: node was just allocated above, still uniquely owned.
                unsafe { (*node).next = *head };
                *head = node;
            }
            StackAbaMode::Tag | StackAbaMode::Smr => loop {
                let (head_word, tag) = self.tagged_head.load(Ordering::Acquire);
                let head = word_to_ptr(head_word);
                // SAFETY: node uniquely owned until published below.
                unsafe { (*node).next = head };
                if self
                    .tagged_head
                    .compare_exchange(
                        (head_word, tag),
                        (ptr_to_word(node), tag.wrapping_add(1)),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break;
                }
            },
            StackAbaMode::Llsc => loop {
                let head = self.llsc_head.load(Ordering::Acquire);
                // SAFETY: node uniquely owned until published below.
                unsafe { (*node).next = head };
                if self
                    .llsc_head
                    .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            },
        }
        self.metrics.items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<T> {
        match self.mode {
            StackAbaMode::Lock => {
                let mut head = self.locked_head.lock().unwrap();
                if head.is_null() {
                    return None;
                }
                // SAFETY: node was pushed by `push` and is uniquely owned
                // by the lock holder.
                let node = unsafe { Box::from_raw(*head) };
                *head = node.next;
                self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                Some(node.value)
            }
            StackAbaMode::Tag => {
                let guard = self.domain.register();
                loop {
                    let (head_word, tag) = self.tagged_head.load(Ordering::Acquire);
                    if head_word == 0 {
                        return None;
                    }
                    let head: *mut Node<T> = word_to_ptr(head_word);
                    if guard.protect(0, head).is_none() {
                        continue;
                    }
                    // Re-verify head is still current now that it's
                    // published as a hazard; otherwise it may already have
                    // been retired before we protected it.
                    if self.tagged_head.load(Ordering::Acquire).0 != head_word {
                        continue;
                    }
                    // SAFETY: head is hazard-protected, so no concurrent
                    // retire can free it while we hold the guard.
                    let next = unsafe { (*head).next };
                    if self
                        .tagged_head
                        .compare_exchange(
                            (head_word, tag),
                            (ptr_to_word(next), tag.wrapping_add(1)),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        guard.clear(0);
                        // SAFETY: this thread won the CAS and exclusively
                        // owns the popped node's value; reclamation of the
                        // node itself is deferred since a losing concurrent
                        // pop may still hold a hazard pointer to it.
                        let value = unsafe {
                            let v = ptr::read(&(*head).value);
                            self.domain.retire(head.cast(), |p| {
                                unsafe { drop(Box::from_raw(p.cast::<Node<T>>())) };
                            });
                            v
                        };
                        self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                }
            }
            StackAbaMode::Smr => self.pop_smr_unregistered(),
            StackAbaMode::Llsc => {
                let guard = self.domain.register();
                loop {
                    let head = self.llsc_head.load(Ordering::Acquire);
                    if head.is_null() {
                        return None;
                    }
                    if guard.protect(0, head).is_none() {
                        continue;
                    }
                    if self.llsc_head.load(Ordering::Acquire) != head {
                        continue;
                    }
                    // SAFETY: head is hazard-protected; see struct docs on
                    // the ABA exposure this mode accepts in exchange for no
                    // tag (UAF itself is still guarded against via retire).
                    let next = unsafe { (*head).next };
                    if self
                        .llsc_head
                        .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        guard.clear(0);
                        let value = unsafe {
                            let v = ptr::read(&(*head).value);
                            self.domain.retire(head.cast(), |p| {
                                unsafe { drop(Box::from_raw(p.cast::<Node<T>>())) };
                            });
                            v
                        };
                        self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                }
            }
        }
    }

    fn pop_smr_unregistered(&self) -> Option<T> {
        panic!("StackAbaMode::Smr requires pop_with_smr(domain); plain pop() is not available in this mode");
    }

    /// Pop using an explicit SMR domain. LIFO order is not guaranteed under
    /// this mode: a helper thread's reclamation scan may race a concurrent
    /// push in ways that admit reordering relative to program order. Only
    /// set-equality between pushed and popped elements is guaranteed.
    pub fn pop_with_smr<S: Smr>(&self, domain: &S) -> Option<T> {
        assert_eq!(self.mode, StackAbaMode::Smr, "pop_with_smr requires AbaMode::Smr");
        let guard = domain.register();
        loop {
            let (head_word, tag) = self.tagged_head.load(Ordering::Acquire);
            if head_word == 0 {
                return None;
            }
            let head: *mut Node<T> = word_to_ptr(head_word);
            if guard.protect(0, head).is_none() {
                continue;
            }
            if self.tagged_head.load(Ordering::Acquire).0 != head_word {
                continue;
            }
            // SAFETY: head is hazard-protected, so it cannot be reclaimed
            // by another thread's retire/scan while we hold the guard.
            let next = unsafe { (*head).next };
            if self
                .tagged_head
                .compare_exchange(
                    (head_word, tag),
                    (ptr_to_word(next), tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                guard.clear(0);
                // SAFETY: this thread won the CAS; schedule reclamation
                // instead of freeing immediately, since other threads may
                // still hold a hazard pointer to `head`.
                let value = unsafe {
                    let v = ptr::read(&(*head).value);
                    domain.retire(head.cast(), |p| {
                        unsafe { drop(Box::from_raw(p.cast::<Node<T>>())) };
                    });
                    v
                };
                self.metrics.items_dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        while self.pop_for_drop().is_some() {}
    }
}

impl<T> Stack<T> {
    fn pop_for_drop(&mut self) -> Option<T> {
        match self.mode {
            StackAbaMode::Lock => {
                let head = *self.locked_head.get_mut().unwrap();
                if head.is_null() {
                    return None;
                }
                let node = unsafe { Box::from_raw(head) };
                *self.locked_head.get_mut().unwrap() = node.next;
                Some(node.value)
            }
            StackAbaMode::Tag | StackAbaMode::Smr => {
                let head_word = *self.tagged_head.ptr_mut();
                if head_word == 0 {
                    return None;
                }
                let head: *mut Node<T> = word_to_ptr(head_word);
                let node = unsafe { Box::from_raw(head) };
                *self.tagged_head.ptr_mut() = ptr_to_word(node.next);
                Some(node.value)
            }
            StackAbaMode::Llsc => {
                let head = *self.llsc_head.get_mut();
                if head.is_null() {
                    return None;
                }
                let node = unsafe { Box::from_raw(head) };
                *self.llsc_head.get_mut() = node.next;
                Some(node.value)
            }
        }
    }
}
