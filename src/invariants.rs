//! Debug assertion macros for container invariants.
//!
//! These macros provide runtime checks for the invariants documented for each
//! container. They are only active in debug builds (`#[cfg(debug_assertions)]`),
//! so there is zero overhead in release builds.

// =============================================================================
// INV-SEQ-01: Bounded Count
// =============================================================================

/// Assert that count does not exceed capacity.
///
/// **Invariant**: `0 ≤ (tail - head) ≤ capacity`
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "INV-SEQ-01 violated: count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that head does not advance past tail.
macro_rules! debug_assert_head_not_past_tail {
    ($new_head:expr, $tail:expr) => {
        debug_assert!(
            $new_head <= $tail,
            "INV-SEQ-01 violated: advancing head {} beyond tail {}",
            $new_head,
            $tail
        )
    };
}

// =============================================================================
// INV-SEQ-02: Monotonic Progress
// =============================================================================

/// Assert that a sequence-like quantity only increases.
///
/// Used for ring head/tail advancement, the anti-replay per-slot watermark,
/// and the lax reorder buffer's retirement stream.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "INV-SEQ-02 violated: {} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// INV-SEQ-03: No Wrap-Around
// =============================================================================

/// Assert that a `u64` sequence counter hasn't wrapped.
macro_rules! debug_assert_no_wrap {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new > $old || $old.wrapping_sub($new) > (1u64 << 32),
            "INV-SEQ-03 potential wrap detected: {} went from {} to {} (delta: {})",
            $name,
            $old,
            $new,
            $new.wrapping_sub($old)
        )
    };
}

// =============================================================================
// INV-INIT-01: Initialized Range Check
// =============================================================================

/// Assert that a slot index falls within the initialized `[head, tail)` range.
macro_rules! debug_assert_initialized_read {
    ($pos:expr, $head:expr, $tail:expr) => {
        debug_assert!(
            $pos >= $head && $pos < $tail,
            "INV-INIT-01 violated: reading slot at seq {} outside initialized range [{}, {})",
            $pos,
            $head,
            $tail
        )
    };
}

// =============================================================================
// INV-RES-03: Pointer Validity
// =============================================================================

macro_rules! debug_assert_valid_ring_ptr {
    ($ptr:expr) => {
        debug_assert!(!$ptr.is_null(), "INV-RES-03 violated: null ring pointer")
    };
}

// =============================================================================
// INV-ORD-03: Per-Producer FIFO
// =============================================================================

macro_rules! debug_assert_fifo_count {
    ($producer_id:expr, $old_count:expr, $new_count:expr) => {
        debug_assert!(
            $new_count >= $old_count,
            "INV-ORD-03 violated: producer {} consumption count went from {} to {}",
            $producer_id,
            $old_count,
            $new_count
        )
    };
}

// =============================================================================
// INV-REC-01: Recursive Lock Depth Discipline
// =============================================================================

/// Assert that a recursive-lock thread stack never exceeds its bounded depth.
macro_rules! debug_assert_recursive_depth {
    ($depth:expr, $max:expr) => {
        debug_assert!(
            $depth <= $max,
            "INV-REC-01 violated: recursive lock depth {} exceeds bound {}",
            $depth,
            $max
        )
    };
}

// =============================================================================
// INV-ROB-01: Lax Reorder Buffer In-Order Retirement
// =============================================================================

/// Assert that the retirement callback observes a non-decreasing sequence
/// number stream (ties allowed, one per element sharing a slot).
macro_rules! debug_assert_rob_retire_order {
    ($old_sn:expr, $new_sn:expr) => {
        debug_assert!(
            $new_sn >= $old_sn,
            "INV-ROB-01 violated: retirement sn went from {} to {}",
            $old_sn,
            $new_sn
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_fifo_count;
pub(crate) use debug_assert_head_not_past_tail;
pub(crate) use debug_assert_initialized_read;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_no_wrap;
pub(crate) use debug_assert_recursive_depth;
pub(crate) use debug_assert_rob_retire_order;
pub(crate) use debug_assert_valid_ring_ptr;
