//! Durable-optional K/V storage for sessions, idempotency records and leases.
//!
//! Three backends sit behind one [`SessionStore`] trait:
//!
//! - `memory` - process-local maps behind one mutex; the default.
//! - `btree` - embedded B-tree ([`redb`]), durable across restarts.
//! - `lsm` - embedded log-structured store ([`sled`]).
//!
//! The two compound operations (`put_session_with_idempotency`,
//! `try_acquire_lease`) are atomic in every backend: concurrent callers
//! serialize through the backend's transaction mechanism, never through
//! check-then-act in the caller.

mod btree;
mod lsm;
mod memory;

pub use btree::BtreeStore;
pub use lsm::LsmStore;
pub use memory::MemoryStore;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Session;
use crate::utils::now_millis;

/// Storage failure. Every variant maps to reason `R_STORE` at the FSM.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend I/O failed (disk, transaction, corruption).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored value failed to (de)serialize.
    #[error("storage codec error: {0}")]
    Codec(String),

    /// The selected backend requires `store_path` and none was configured.
    #[error("store backend '{0}' requires store_path")]
    MissingPath(&'static str),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A TTL lease record as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Owning session id.
    pub owner: String,
    /// Acquisition timestamp (Unix millis).
    pub acquired_at: u64,
    /// Expiry timestamp (Unix millis); expiry is checked lazily on acquire.
    pub expires_at: u64,
    /// Bumped each time ownership changes hands.
    pub epoch: u64,
}

impl LeaseRecord {
    fn expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a `try_acquire_lease` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOutcome {
    /// Whether the caller now holds the lease.
    pub acquired: bool,
    /// The owner after the call (the caller on success, the holder on contention).
    pub current_owner: String,
    /// Expiry of the lease after the call (Unix millis).
    pub expires_at: u64,
}

/// An idempotency mapping as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Session the canonical intent key maps to.
    pub session_id: String,
    /// Creation timestamp (Unix millis).
    pub created_at: u64,
    /// Expiry timestamp (Unix millis).
    pub expires_at: u64,
}

/// Outcome of the atomic put-or-get admission operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// The session id the intent maps to (new or pre-existing).
    pub session_id: String,
    /// `true` iff this call created the session.
    pub created: bool,
}

/// Storage contract for sessions, idempotency records and leases.
///
/// Implementations are embedded and synchronous; callers in async context
/// invoke them inline (writes are small and bounded).
pub trait SessionStore: Send + Sync {
    /// Atomic write-through of a session record.
    fn put_session(&self, session: &Session) -> StoreResult<()>;

    /// Consistent read; `None` if absent or swept.
    fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;

    /// Idempotent delete.
    fn delete_session(&self, id: &str) -> StoreResult<()>;

    /// Terminal sessions with `updated_at` strictly below the cutoff.
    /// May be approximate where the backend lacks indexes.
    fn list_terminal_older_than(&self, cutoff_millis: u64) -> StoreResult<Vec<Session>>;

    /// All sessions currently in the store (API listing; bounded by retention).
    fn list_sessions(&self) -> StoreResult<Vec<Session>>;

    /// Atomic put-or-get keyed by the canonical intent digest.
    ///
    /// If `key` maps to an unexpired record, returns that session id with
    /// `created=false` and writes nothing. Otherwise writes the session and
    /// the mapping in one transaction and returns `created=true`. Two
    /// concurrent callers with the same key never both observe `created`.
    fn put_session_with_idempotency(
        &self,
        session: &Session,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<AdmissionOutcome>;

    /// Atomic try-acquire. Re-acquisition by the current owner refreshes the
    /// TTL and reports `acquired=true`; expired leases are claimed in place.
    fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<LeaseOutcome>;

    /// Releases a lease iff `owner` holds it; otherwise a no-op.
    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()>;

    /// Bulk flush of every lease. Called once at startup, before any intent
    /// is accepted: this process is the single writer, so no surviving lease
    /// can belong to a live peer.
    fn delete_all_leases(&self) -> StoreResult<()>;
}

/// Pure helper shared by all backends: decides what `try_acquire_lease`
/// should do given the current record (if any).
///
/// Returns `(new_record_to_write, outcome)`; `None` means leave the record
/// untouched (contention).
fn lease_acquire_decision(
    current: Option<LeaseRecord>,
    owner: &str,
    ttl: Duration,
    now: u64,
) -> (Option<LeaseRecord>, LeaseOutcome) {
    let expires_at = now + ttl.as_millis() as u64;
    match current {
        Some(rec) if rec.owner == owner => {
            // Re-entrant refresh.
            let refreshed = LeaseRecord {
                expires_at,
                ..rec.clone()
            };
            (
                Some(refreshed),
                LeaseOutcome {
                    acquired: true,
                    current_owner: owner.to_string(),
                    expires_at,
                },
            )
        }
        Some(rec) if !rec.expired_at(now) => (
            None,
            LeaseOutcome {
                acquired: false,
                current_owner: rec.owner.clone(),
                expires_at: rec.expires_at,
            },
        ),
        prior => {
            // Free, or expired and claimed in place.
            let epoch = prior.map(|r| r.epoch + 1).unwrap_or(1);
            let rec = LeaseRecord {
                owner: owner.to_string(),
                acquired_at: now,
                expires_at,
                epoch,
            };
            (
                Some(rec),
                LeaseOutcome {
                    acquired: true,
                    current_owner: owner.to_string(),
                    expires_at,
                },
            )
        }
    }
}

/// Selects and opens a store backend by name.
///
/// `memory` ignores `path`; `btree` and `lsm` require it.
pub fn open_store(
    backend: &str,
    path: Option<&Path>,
) -> StoreResult<Arc<dyn SessionStore>> {
    match backend {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "btree" => {
            let path = path.ok_or(StoreError::MissingPath("btree"))?;
            Ok(Arc::new(BtreeStore::open(path)?))
        }
        "lsm" => {
            let path = path.ok_or(StoreError::MissingPath("lsm"))?;
            Ok(Arc::new(LsmStore::open(path)?))
        }
        other => Err(StoreError::Backend(format!(
            "unknown store backend '{other}' (expected memory|btree|lsm)"
        ))),
    }
}

/// Current time helper kept local so backends agree on the clock.
pub(crate) fn store_now() -> u64 {
    now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Profile, Reason, SessionState};

    fn session(id: &str) -> Session {
        Session::new(id.into(), "1:0:19:1:1:1:1:0:0:0:".into(), Profile::default(), None)
    }

    /// Runs the full contract against one backend.
    fn exercise_store(store: &dyn SessionStore) {
        // put / get / delete
        let s = session("s1");
        store.put_session(&s).unwrap();
        let got = store.get_session("s1").unwrap().unwrap();
        assert_eq!(got.id, "s1");
        assert_eq!(got.state, SessionState::New);
        assert!(store.get_session("missing").unwrap().is_none());
        store.delete_session("s1").unwrap();
        store.delete_session("s1").unwrap(); // idempotent
        assert!(store.get_session("s1").unwrap().is_none());

        // idempotent admission
        let ttl = Duration::from_secs(60);
        let first = store
            .put_session_with_idempotency(&session("a1"), "key-1", ttl)
            .unwrap();
        assert!(first.created);
        assert_eq!(first.session_id, "a1");
        let second = store
            .put_session_with_idempotency(&session("a2"), "key-1", ttl)
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.session_id, "a1");
        // a2 must not have been written
        assert!(store.get_session("a2").unwrap().is_none());
        // distinct key admits normally
        let third = store
            .put_session_with_idempotency(&session("a3"), "key-2", ttl)
            .unwrap();
        assert!(third.created);

        // leases
        let ttl = Duration::from_secs(30);
        let got = store.try_acquire_lease("tuner:0", "a1", ttl).unwrap();
        assert!(got.acquired);
        let contended = store.try_acquire_lease("tuner:0", "a3", ttl).unwrap();
        assert!(!contended.acquired);
        assert_eq!(contended.current_owner, "a1");
        // re-entrant refresh
        let refreshed = store.try_acquire_lease("tuner:0", "a1", ttl).unwrap();
        assert!(refreshed.acquired);
        assert!(refreshed.expires_at >= got.expires_at);
        // release by non-owner is a no-op
        store.release_lease("tuner:0", "a3").unwrap();
        assert!(!store.try_acquire_lease("tuner:0", "a3", ttl).unwrap().acquired);
        // release by owner frees the key
        store.release_lease("tuner:0", "a1").unwrap();
        assert!(store.try_acquire_lease("tuner:0", "a3", ttl).unwrap().acquired);

        // startup flush
        store.delete_all_leases().unwrap();
        assert!(store.try_acquire_lease("tuner:0", "a1", ttl).unwrap().acquired);

        // terminal listing
        let mut old = session("old1");
        old.transition(SessionState::Failed, Reason::Stall).unwrap();
        old.updated_at = 1_000; // long in the past
        store.put_session(&old).unwrap();
        let found = store.list_terminal_older_than(2_000).unwrap();
        assert!(found.iter().any(|s| s.id == "old1"));
        let none = store.list_terminal_older_than(500).unwrap();
        assert!(!none.iter().any(|s| s.id == "old1"));
        // live sessions are never listed as sweep candidates
        assert!(!found.iter().any(|s| s.id == "a1"));
    }

    #[test]
    fn memory_store_contract() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn btree_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = BtreeStore::open(&dir.path().join("sessions.redb")).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn lsm_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = LsmStore::open(dir.path()).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn expired_lease_is_claimed_in_place() {
        let now = store_now();
        let prior = LeaseRecord {
            owner: "dead".into(),
            acquired_at: now - 60_000,
            expires_at: now - 30_000,
            epoch: 3,
        };
        let (write, outcome) =
            lease_acquire_decision(Some(prior), "alive", Duration::from_secs(30), now);
        assert!(outcome.acquired);
        let rec = write.unwrap();
        assert_eq!(rec.owner, "alive");
        assert_eq!(rec.epoch, 4);
    }

    #[test]
    fn open_store_rejects_unknown_backend() {
        assert!(matches!(
            open_store("postgres", None),
            Err(StoreError::Backend(_))
        ));
        assert!(matches!(
            open_store("btree", None),
            Err(StoreError::MissingPath("btree"))
        ));
    }
}
