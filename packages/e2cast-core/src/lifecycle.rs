//! Process lifecycle coordination.
//!
//! A single [`Lifecycle`] value is shared by the API layer and the
//! background tasks: the API checks [`Lifecycle::is_draining`] to answer
//! `503` during shutdown, and background tasks watch the cancellation
//! token to wind down.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Shared running/draining state for the whole process.
pub struct Lifecycle {
    draining: AtomicBool,
    shutdown: CancellationToken,
}

impl Lifecycle {
    /// Creates a running (non-draining) lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            draining: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether shutdown has begun. New intents are refused once true.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Begins shutdown: flips the draining flag and cancels the token.
    ///
    /// Returns `true` on the first call, `false` if already draining.
    pub fn begin_shutdown(&self) -> bool {
        let first = self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.shutdown.cancel();
        }
        first
    }

    /// Token cancelled when shutdown begins. Background tasks select on
    /// `token.cancelled()` alongside their work.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_shutdown_is_one_shot() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_draining());
        assert!(lifecycle.begin_shutdown());
        assert!(lifecycle.is_draining());
        assert!(!lifecycle.begin_shutdown());
        assert!(lifecycle.shutdown_token().is_cancelled());
    }
}
