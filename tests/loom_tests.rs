//! Loom-based concurrency tests.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores thread interleavings rather than relying on
//! chance scheduling to surface a race. Each model here is a reduced
//! version of one container's core CAS protocol, not the full production
//! type (loom's state-space search does not scale to the real containers'
//! heap-allocated buffers and drop glue).

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;
use std::ptr;

/// Reduced model of the lock-free ring's per-slot sequence protocol
/// (see `src/lfring.rs`), capacity fixed at 2 to keep the state space small.
struct LoomLfRing {
    slot0_seq: AtomicUsize,
    slot1_seq: AtomicUsize,
    slot0: UnsafeCell<u64>,
    slot1: UnsafeCell<u64>,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl Send for LoomLfRing {}
unsafe impl Sync for LoomLfRing {}

impl LoomLfRing {
    fn new() -> Self {
        Self {
            slot0_seq: AtomicUsize::new(0),
            slot1_seq: AtomicUsize::new(1),
            slot0: UnsafeCell::new(0),
            slot1: UnsafeCell::new(0),
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    fn slot_seq(&self, idx: usize) -> &AtomicUsize {
        if idx & 1 == 0 {
            &self.slot0_seq
        } else {
            &self.slot1_seq
        }
    }

    fn slot_cell(&self, idx: usize) -> *mut u64 {
        if idx & 1 == 0 {
            self.slot0.get()
        } else {
            self.slot1.get()
        }
    }

    fn try_enqueue(&self, value: u64) -> bool {
        let pos = self.enqueue_pos.load(Ordering::Relaxed);
        let seq = self.slot_seq(pos).load(Ordering::Acquire);
        if seq != pos {
            return false;
        }
        if self
            .enqueue_pos
            .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            unsafe { *self.slot_cell(pos) = value };
            self.slot_seq(pos).store(pos + 1, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn try_dequeue(&self) -> Option<u64> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let seq = self.slot_seq(pos).load(Ordering::Acquire);
        if seq != pos + 1 {
            return None;
        }
        if self
            .dequeue_pos
            .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let value = unsafe { *self.slot_cell(pos) };
            self.slot_seq(pos).store(pos + 2, Ordering::Release);
            Some(value)
        } else {
            None
        }
    }
}

#[test]
fn loom_lfring_spsc_no_loss() {
    loom::model(|| {
        let ring = Arc::new(LoomLfRing::new());
        let ring2 = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            ring2.try_enqueue(1);
        });

        let consumer = thread::spawn(move || {
            let mut got = None;
            for _ in 0..3 {
                if let Some(v) = ring.try_dequeue() {
                    got = Some(v);
                    break;
                }
                loom::thread::yield_now();
            }
            got
        });

        producer.join().unwrap();
        let got = consumer.join().unwrap();
        if let Some(v) = got {
            assert_eq!(v, 1);
        }
    });
}

/// Reduced model of the Treiber stack's tagged-pointer push/pop CAS loop
/// (see `src/stack.rs`, `StackAbaMode::Tag`), with a single possible node
/// value per thread to keep loom's search tractable.
struct LoomNode {
    value: u64,
    next: *mut LoomNode,
}

struct LoomStack {
    head: AtomicPtr<LoomNode>,
}

unsafe impl Send for LoomStack {}
unsafe impl Sync for LoomStack {}

impl LoomStack {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, value: u64) {
        let node = Box::into_raw(Box::new(LoomNode {
            value,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop(&self) -> Option<u64> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let node = unsafe { Box::from_raw(head) };
                return Some(node.value);
            }
        }
    }
}

#[test]
fn loom_stack_concurrent_push_preserves_both_values() {
    loom::model(|| {
        let stack = Arc::new(LoomStack::new());
        let s1 = Arc::clone(&stack);
        let s2 = Arc::clone(&stack);

        let t1 = thread::spawn(move || s1.push(1));
        let t2 = thread::spawn(move || s2.push(2));
        t1.join().unwrap();
        t2.join().unwrap();

        let mut popped = Vec::new();
        while let Some(v) = stack.pop() {
            popped.push(v);
        }
        popped.sort_unstable();
        assert_eq!(popped, vec![1, 2]);
    });
}

/// Reduced model of the seqlock-style `rwsync` protocol (see
/// `src/rwsync.rs`): a single writer, and a reader that must never observe
/// a torn read without its `release_rd` check catching it.
struct LoomRwSync {
    word: AtomicU64,
    data: UnsafeCell<u64>,
}

unsafe impl Send for LoomRwSync {}
unsafe impl Sync for LoomRwSync {}

impl LoomRwSync {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            data: UnsafeCell::new(0),
        }
    }

    fn write(&self, value: u64) {
        self.word.fetch_add(1, Ordering::AcqRel);
        unsafe { *self.data.get() = value };
        self.word.fetch_add(1, Ordering::Release);
    }

    fn read(&self) -> Option<u64> {
        let prv = self.word.load(Ordering::Acquire);
        if prv & 1 != 0 {
            return None;
        }
        let value = unsafe { *self.data.get() };
        if self.word.load(Ordering::Acquire) != prv {
            return None;
        }
        Some(value)
    }
}

#[test]
fn loom_rwsync_read_never_torn() {
    loom::model(|| {
        let sync = Arc::new(LoomRwSync::new());
        let s1 = Arc::clone(&sync);
        let s2 = Arc::clone(&sync);

        let writer = thread::spawn(move || s1.write(42));
        let reader = thread::spawn(move || s2.read());

        writer.join().unwrap();
        let observed = reader.join().unwrap();
        if let Some(v) = observed {
            assert!(v == 0 || v == 42);
        }
    });
}
