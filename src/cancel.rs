//! Cancellation tokens for search and indexing operations.
//!
//! Long-running loops check the token between batches rather than on every
//! item; `check_sparse` only touches the atomic every `CANCEL_CHECK_INTERVAL`
//! iterations to keep the hot path free of shared reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often candidate-iteration loops observe cancellation.
/// A power of 2 so the modulo reduces to a bitwise AND.
pub const CANCEL_CHECK_INTERVAL: usize = 64;

/// A cooperative cancellation token shared between an operation and its owner.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Observed at the next suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns true once `cancel` has been called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Some(())` while the token is still active.
    ///
    /// The `Option` shape enables `?`-style early returns from functions
    /// that report cancellation as `None`.
    #[inline]
    pub fn check(&self) -> Option<()> {
        if self.is_cancelled() {
            None
        } else {
            Some(())
        }
    }

    /// Sparse check: only reads the flag every `CANCEL_CHECK_INTERVAL`
    /// iterations of `counter`.
    #[inline]
    pub fn check_sparse(&self, counter: usize) -> Option<()> {
        if counter & (CANCEL_CHECK_INTERVAL - 1) == 0 {
            self.check()
        } else {
            Some(())
        }
    }
}
