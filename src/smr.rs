//! Safe memory reclamation seam.
//!
//! The reorder-buffer and rwlock families never need deferred reclamation,
//! but the SMR-flavored stack and queue do: a popped node cannot be freed
//! immediately because another thread may still hold a reference to it from
//! before the pop. `Smr` is the trait seam those containers are generic
//! over; [`HazardDomain`] is the one concrete hazard-pointer implementation
//! shipped in-tree so the SMR-flavored containers are actually exercisable.
//! Both the trait and the implementation are treated as a swappable service,
//! not as core container logic: callers may bring their own.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const HAZARDS_PER_THREAD: usize = 4;
const SCAN_THRESHOLD: usize = 2 * HAZARDS_PER_THREAD;

/// A safe-memory-reclamation domain: threads register, protect pointers
/// they're about to dereference, and retire pointers they've logically
/// removed but cannot yet free.
pub trait Smr {
    type Guard<'a>: SmrGuard
    where
        Self: 'a;

    fn register(&self) -> Self::Guard<'_>;
}

pub trait SmrGuard {
    /// Publish `ptr` in hazard slot `slot` (0..HAZARDS_PER_THREAD). Returns
    /// `None` if `slot` is out of range.
    fn protect<T>(&self, slot: usize, ptr: *mut T) -> Option<usize>;
    fn clear(&self, slot: usize);

    /// Defer reclamation of `ptr` until no registered thread still
    /// protects it. `free_fn` performs the actual drop/deallocation.
    ///
    /// # Safety
    /// `ptr` must be a valid, exclusively-owned pointer obtained from a
    /// container this domain reclaims for, and must not be reachable by
    /// any future container operation.
    unsafe fn retire(&self, ptr: *mut (), free_fn: unsafe fn(*mut ()));
}

struct RetiredNode {
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

struct HpRecord {
    hazards: [AtomicPtr<()>; HAZARDS_PER_THREAD],
    next: AtomicPtr<HpRecord>,
    active: AtomicUsize,
    retire_list: UnsafeCell<Vec<RetiredNode>>,
}

impl HpRecord {
    fn new() -> Self {
        Self {
            hazards: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicUsize::new(1),
            retire_list: UnsafeCell::new(Vec::new()),
        }
    }
}

/// A global hazard-pointer domain, shared by every thread that registers
/// with it. Typically one `HazardDomain` is shared across all SMR-flavored
/// containers in a process.
pub struct HazardDomain {
    records: AtomicPtr<HpRecord>,
}

impl HazardDomain {
    pub const fn new() -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn collect_hazards(&self) -> Vec<*mut ()> {
        let mut hazards = Vec::new();
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: records form a lock-free linked list whose nodes are
            // never freed (registrations are tombstoned, not removed).
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) != 0 {
                for hp in &record.hazards {
                    let p = hp.load(Ordering::Acquire);
                    if !p.is_null() {
                        hazards.push(p);
                    }
                }
            }
            current = record.next.load(Ordering::Acquire);
        }
        hazards
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Smr for HazardDomain {
    type Guard<'a> = HazardGuard<'a>;

    fn register(&self) -> HazardGuard<'_> {
        let record = Box::into_raw(Box::new(HpRecord::new()));
        loop {
            let head = self.records.load(Ordering::Relaxed);
            // SAFETY: record was just allocated and is not yet published.
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .records
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        HazardGuard { domain: self, record }
    }
}

pub struct HazardGuard<'a> {
    domain: &'a HazardDomain,
    record: *mut HpRecord,
}

impl SmrGuard for HazardGuard<'_> {
    fn protect<T>(&self, slot: usize, p: *mut T) -> Option<usize> {
        if slot >= HAZARDS_PER_THREAD {
            return None;
        }
        // SAFETY: record is owned by this guard for its lifetime.
        let record = unsafe { &*self.record };
        record.hazards[slot].store(p.cast(), Ordering::Release);
        crate::pr::fence_acquire();
        Some(slot)
    }

    fn clear(&self, slot: usize) {
        if slot < HAZARDS_PER_THREAD {
            let record = unsafe { &*self.record };
            record.hazards[slot].store(ptr::null_mut(), Ordering::Release);
        }
    }

    unsafe fn retire(&self, p: *mut (), free_fn: unsafe fn(*mut ())) {
        let record = &*self.record;
        let retire_list = &mut *record.retire_list.get();
        retire_list.push(RetiredNode { ptr: p, free_fn });
        if retire_list.len() >= SCAN_THRESHOLD {
            self.scan();
        }
    }
}

impl HazardGuard<'_> {
    fn clear_all(&self) {
        let record = unsafe { &*self.record };
        for hp in &record.hazards {
            hp.store(ptr::null_mut(), Ordering::Release);
        }
    }

    pub fn scan(&self) {
        let hazards = self.domain.collect_hazards();
        let record = unsafe { &*self.record };
        let retire_list = unsafe { &mut *record.retire_list.get() };
        retire_list.retain(|node| {
            if hazards.contains(&node.ptr) {
                true
            } else {
                // SAFETY: node is absent from every thread's hazard set,
                // so no reader can be mid-dereference of it.
                unsafe { (node.free_fn)(node.ptr) };
                false
            }
        });
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        self.clear_all();
        let record = unsafe { &*self.record };
        record.active.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_protect_retire_scan() {
        let domain = HazardDomain::new();
        let guard = domain.register();
        let boxed = Box::into_raw(Box::new(42i32));
        guard.protect(0, boxed);
        guard.clear(0);
        unsafe {
            guard.retire(boxed.cast(), |p| unsafe { drop(Box::from_raw(p.cast::<i32>())) });
        }
        guard.scan();
    }

    #[test]
    fn protected_pointer_survives_scan() {
        let domain = HazardDomain::new();
        let guard = domain.register();
        let boxed = Box::into_raw(Box::new(7i32));
        guard.protect(0, boxed);
        unsafe {
            guard.retire(boxed.cast(), |p| unsafe { drop(Box::from_raw(p.cast::<i32>())) });
        }
        // still protected: scan must not free it.
        guard.scan();
        guard.clear(0);
        guard.scan();
    }
}
