//! Embedded B-tree store backend (`btree`), backed by redb.
//!
//! One table per record family; records are JSON strings. The compound
//! operations execute inside a single write transaction, which gives the
//! serializability the admission path depends on.

use std::path::Path;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::{
    lease_acquire_decision, store_now, AdmissionOutcome, IdempotencyRecord, LeaseOutcome,
    LeaseRecord, SessionStore, StoreError, StoreResult,
};
use crate::session::Session;

const SESSIONS: TableDefinition<&str, &str> = TableDefinition::new("sessions");
const IDEMPOTENCY: TableDefinition<&str, &str> = TableDefinition::new("idempotency");
const LEASES: TableDefinition<&str, &str> = TableDefinition::new("leases");

/// redb-backed store; the `btree` backend.
pub struct BtreeStore {
    db: Database,
}

fn backend<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl BtreeStore {
    /// Opens (or creates) the database file and ensures all tables exist.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(backend)?;
        // Tables must exist before the first read transaction touches them.
        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(SESSIONS).map_err(backend)?;
            txn.open_table(IDEMPOTENCY).map_err(backend)?;
            txn.open_table(LEASES).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(Self { db })
    }

    fn read_lease(
        table: &impl ReadableTable<&'static str, &'static str>,
        key: &str,
    ) -> StoreResult<Option<LeaseRecord>> {
        match table.get(key).map_err(backend)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }
}

impl SessionStore for BtreeStore {
    fn put_session(&self, session: &Session) -> StoreResult<()> {
        let json = serde_json::to_string(session)?;
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(backend)?;
            table
                .insert(session.id.as_str(), json.as_str())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(SESSIONS).map_err(backend)?;
        match table.get(id).map_err(backend)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(backend)?;
            table.remove(id).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    fn list_terminal_older_than(&self, cutoff_millis: u64) -> StoreResult<Vec<Session>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_terminal() && s.updated_at < cutoff_millis)
            .collect())
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(SESSIONS).map_err(backend)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            out.push(serde_json::from_str(value.value())?);
        }
        Ok(out)
    }

    fn put_session_with_idempotency(
        &self,
        session: &Session,
        key: &str,
        ttl: Duration,
    ) -> StoreResult<AdmissionOutcome> {
        let now = store_now();
        let txn = self.db.begin_write().map_err(backend)?;
        let outcome;
        {
            let mut idem = txn.open_table(IDEMPOTENCY).map_err(backend)?;
            let existing: Option<IdempotencyRecord> = match idem.get(key).map_err(backend)? {
                Some(guard) => Some(serde_json::from_str(guard.value())?),
                None => None,
            };
            if let Some(rec) = existing.filter(|rec| rec.expires_at > now) {
                // Mapping still valid; write nothing.
                drop(idem);
                txn.abort().map_err(backend)?;
                return Ok(AdmissionOutcome {
                    session_id: rec.session_id,
                    created: false,
                });
            }

            let record = IdempotencyRecord {
                session_id: session.id.clone(),
                created_at: now,
                expires_at: now + ttl.as_millis() as u64,
            };
            idem.insert(key, serde_json::to_string(&record)?.as_str())
                .map_err(backend)?;
            let mut sessions = txn.open_table(SESSIONS).map_err(backend)?;
            sessions
                .insert(session.id.as_str(), serde_json::to_string(session)?.as_str())
                .map_err(backend)?;
            outcome = AdmissionOutcome {
                session_id: session.id.clone(),
                created: true,
            };
        }
        txn.commit().map_err(backend)?;
        Ok(outcome)
    }

    fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<LeaseOutcome> {
        let now = store_now();
        let txn = self.db.begin_write().map_err(backend)?;
        let outcome;
        {
            let mut table = txn.open_table(LEASES).map_err(backend)?;
            let current = Self::read_lease(&table, key)?;
            let (write, decided) = lease_acquire_decision(current, owner, ttl, now);
            if let Some(rec) = write {
                table
                    .insert(key, serde_json::to_string(&rec)?.as_str())
                    .map_err(backend)?;
            }
            outcome = decided;
        }
        txn.commit().map_err(backend)?;
        Ok(outcome)
    }

    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(LEASES).map_err(backend)?;
            let current = Self::read_lease(&table, key)?;
            if current.is_some_and(|rec| rec.owner == owner) {
                table.remove(key).map_err(backend)?;
            }
        }
        txn.commit().map_err(backend)
    }

    fn delete_all_leases(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            // redb has no truncate; recreate the table instead.
            txn.delete_table(LEASES).map_err(backend)?;
            txn.open_table(LEASES).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }
}
