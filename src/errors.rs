//! Process-wide error reporting and allocation error types.
//!
//! Three channels are used across this crate: a plain [`Result`] return for
//! allocation-time validation, a per-container status enum (see
//! [`crate::linklist::LinklistStatus`]), and this module's named-error
//! dispatch for invariant violations discovered deep inside a lock-free
//! protocol (a null element pushed, an unbalanced recursive-lock release).

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

/// Error raised by a container's `alloc`/`new` when the caller-supplied
/// sizing or mode flags are invalid.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("capacity must be a power of two, got {0}")]
    NotPowerOfTwo(usize),
    #[error("capacity {0} is zero")]
    ZeroCapacity,
    #[error("window size must be a power of two, got {0}")]
    InvalidWindowSize(usize),
    #[error("ring buffer mode combination is not supported: lock-free consumer cannot pair with a non-blocking producer")]
    IncompatibleModes,
}

/// A process-wide handler invoked when a container detects a programming
/// error that it cannot report through its return value (a null element,
/// an over-released recursive lock, a write-after-read recursion).
///
/// The handler receives the module name, a short error tag, and an
/// auxiliary value, mirroring the three-argument error-report contract.
/// It returns nothing: a handler that wants abort-like behavior calls
/// [`std::process::abort`] or `panic!` itself, rather than returning a
/// status code for the call site to interpret.
pub type ErrorHandler = fn(module: &str, err: &str, val: usize);

fn default_handler(module: &str, err: &str, val: usize) {
    eprintln!("syncprims-rs: [{module}] {err} (val={val})");
}

static HANDLER: OnceLock<AtomicPtr<()>> = OnceLock::new();

fn handler_cell() -> &'static AtomicPtr<()> {
    HANDLER.get_or_init(|| AtomicPtr::new(default_handler as *mut ()))
}

/// Install a new process-wide error handler, returning the previous one.
pub fn install(handler: ErrorHandler) -> ErrorHandler {
    let prior = handler_cell().swap(handler as *mut (), Ordering::AcqRel);
    // SAFETY: only ever stores function pointers cast from `ErrorHandler`.
    unsafe { std::mem::transmute::<*mut (), ErrorHandler>(prior) }
}

/// Report a named error to the currently installed handler.
pub(crate) fn report(module: &str, err: &str, val: usize) {
    let raw = handler_cell().load(Ordering::Acquire);
    // SAFETY: only ever stores function pointers cast from `ErrorHandler`.
    let handler: ErrorHandler = unsafe { std::mem::transmute(raw) };
    handler(module, err, val);
}
