//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than a concrete
//! channel, enabling testing and alternative delivery implementations.

use super::{CacheEvent, SessionEvent};

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a session lifecycle event.
    fn emit_session(&self, event: SessionEvent);

    /// Emits a VOD cache event.
    fn emit_cache(&self, event: CacheEvent);
}

/// No-op emitter for tests and embedded use.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_session(&self, _event: SessionEvent) {
        // No-op
    }

    fn emit_cache(&self, _event: CacheEvent) {
        // No-op
    }
}

/// Logging emitter; the default in the standalone server.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_session(&self, event: SessionEvent) {
        tracing::debug!(?event, "session_event");
    }

    fn emit_cache(&self, event: CacheEvent) {
        tracing::debug!(?event, "cache_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Reason, SessionState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test emitter that counts events.
    struct CountingEventEmitter {
        session_count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_session(&self, _event: SessionEvent) {
            self.session_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_cache(&self, _event: CacheEvent) {}
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = CountingEventEmitter {
            session_count: AtomicUsize::new(0),
        };
        emitter.emit_session(SessionEvent::StateChanged {
            session_id: "s1".to_string(),
            state: SessionState::Failed,
            reason: Reason::Stall,
            timestamp: 0,
        });
        assert_eq!(emitter.session_count.load(Ordering::SeqCst), 1);
    }
}
