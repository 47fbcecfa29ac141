//! External interruption of long reads.
//!
//! A read polls its [`Interrupt`] before every bounded wait. The embedding caller holds a
//! [`CancelToken`] (e.g., set from a Ctrl-C handler) and cancels it to make the read unwind
//! promptly.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Something a read can ask whether it should stop.
pub trait Interrupt {
    /// Return `true` if the read in progress should unwind now.
    fn is_interrupted(&self) -> bool;
}

/// An interrupt that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverInterrupt;

impl Interrupt for NeverInterrupt {
    fn is_interrupted(&self) -> bool {
        false
    }
}

impl Interrupt for AtomicBool {
    fn is_interrupted(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// A cloneable cancellation flag shared between a handle and whoever may cancel its reads.
///
/// Cancelling is sticky: all reads through the handle are interrupted until [`CancelToken::reset`]
/// is called.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that reads using this token stop.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Re-arm the token after a cancellation was handled.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether the token is currently cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Interrupt for CancelToken {
    fn is_interrupted(&self) -> bool {
        self.is_cancelled()
    }
}
