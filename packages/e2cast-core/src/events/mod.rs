//! Domain events published by the control plane.
//!
//! Events decouple the orchestrator, sweeper and cache from whatever
//! transport surfaces them (logs today; an operator feed tomorrow).

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::session::{Reason, SessionState};

/// Session lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// A session record was created for an accepted intent.
    #[serde(rename_all = "camelCase")]
    Created {
        session_id: String,
        service_ref: String,
        timestamp: u64,
    },
    /// A session moved to a new lifecycle state.
    #[serde(rename_all = "camelCase")]
    StateChanged {
        session_id: String,
        state: SessionState,
        reason: Reason,
        timestamp: u64,
    },
    /// The sweeper removed a terminal session and its artifacts.
    #[serde(rename_all = "camelCase")]
    Swept {
        session_id: String,
        timestamp: u64,
    },
}

/// VOD cache events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CacheEvent {
    /// An entry was evicted (TTL or disk pressure).
    #[serde(rename_all = "camelCase")]
    Evicted {
        recording_id: String,
        size_bytes: u64,
        pressure: bool,
        timestamp: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_millis;

    #[test]
    fn session_event_serializes_tagged() {
        let event = SessionEvent::StateChanged {
            session_id: "s1".to_string(),
            state: SessionState::Ready,
            reason: Reason::None,
            timestamp: now_millis(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["state"], "READY");
        assert_eq!(json["reason"], "R_NONE");
    }
}
