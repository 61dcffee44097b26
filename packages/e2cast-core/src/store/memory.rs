//! In-memory store backend (the default).
//!
//! All three record families live behind a single mutex, which makes the
//! compound operations trivially atomic. Nothing survives a restart, which
//! matches the ephemerality contract of live intents.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    lease_acquire_decision, store_now, AdmissionOutcome, IdempotencyRecord, LeaseOutcome,
    LeaseRecord, SessionStore, StoreResult,
};
use crate::session::Session;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    idempotency: HashMap<String, IdempotencyRecord>,
    leases: HashMap<String, LeaseRecord>,
}

/// Process-local store; the `memory` backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn put_session(&self, session: &Session) -> StoreResult<()> {
        self.inner
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.inner.lock().sessions.remove(id);
        Ok(())
    }

    fn list_terminal_older_than(&self, cutoff_millis: u64) -> StoreResult<Vec<Session>> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_terminal() && s.updated_at < cutoff_millis)
            .cloned()
            .collect())
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        Ok(self.inner.lock().sessions.values().cloned().collect())
    }

    fn put_session_with_idempotency(
        &self,
        session: &Session,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<AdmissionOutcome> {
        let now = store_now();
        let mut inner = self.inner.lock();

        if let Some(rec) = inner.idempotency.get(key) {
            if rec.expires_at > now {
                return Ok(AdmissionOutcome {
                    session_id: rec.session_id.clone(),
                    created: false,
                });
            }
        }

        inner.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                session_id: session.id.clone(),
                created_at: now,
                expires_at: now + ttl.as_millis() as u64,
            },
        );
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(AdmissionOutcome {
            session_id: session.id.clone(),
            created: true,
        })
    }

    fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<LeaseOutcome> {
        let now = store_now();
        let mut inner = self.inner.lock();
        let current = inner.leases.get(key).cloned();
        let (write, outcome) = lease_acquire_decision(current, owner, ttl, now);
        if let Some(rec) = write {
            inner.leases.insert(key.to_string(), rec);
        }
        Ok(outcome)
    }

    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.leases.get(key).is_some_and(|rec| rec.owner == owner) {
            inner.leases.remove(key);
        }
        Ok(())
    }

    fn delete_all_leases(&self) -> StoreResult<()> {
        self.inner.lock().leases.clear();
        Ok(())
    }
}
