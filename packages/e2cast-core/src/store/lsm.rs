//! Embedded log-structured store backend (`lsm`), backed by sled.
//!
//! One tree per record family; records are JSON bytes. The compound
//! operations run as sled transactions (single- or multi-tree), which
//! retry internally on conflict, so concurrent admission calls serialize.

use std::path::Path;
use std::time::Duration;

use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use super::{
    lease_acquire_decision, store_now, AdmissionOutcome, IdempotencyRecord, LeaseOutcome,
    LeaseRecord, SessionStore, StoreError, StoreResult,
};
use crate::session::Session;

/// sled-backed store; the `lsm` backend.
pub struct LsmStore {
    _db: sled::Db,
    sessions: sled::Tree,
    idempotency: sled::Tree,
    leases: sled::Tree,
}

fn backend<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn abort_codec(err: serde_json::Error) -> ConflictableTransactionError<String> {
    ConflictableTransactionError::Abort(err.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(Into::into)
}

impl LsmStore {
    /// Opens (or creates) the database directory and its trees.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path).map_err(backend)?;
        let sessions = db.open_tree("sessions").map_err(backend)?;
        let idempotency = db.open_tree("idempotency").map_err(backend)?;
        let leases = db.open_tree("leases").map_err(backend)?;
        Ok(Self {
            _db: db,
            sessions,
            idempotency,
            leases,
        })
    }
}

impl SessionStore for LsmStore {
    fn put_session(&self, session: &Session) -> StoreResult<()> {
        let json = serde_json::to_vec(session)?;
        self.sessions
            .insert(session.id.as_bytes(), json)
            .map_err(backend)?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        match self.sessions.get(id.as_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.sessions.remove(id.as_bytes()).map_err(backend)?;
        Ok(())
    }

    fn list_terminal_older_than(&self, cutoff_millis: u64) -> StoreResult<Vec<Session>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_terminal() && s.updated_at < cutoff_millis)
            .collect())
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            let (_, bytes) = entry.map_err(backend)?;
            out.push(decode(&bytes)?);
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
        let result = (&self.sessions, &self.idempotency).transaction(|(sessions, idem)| {
            if let Some(bytes) = idem.get(key.as_bytes())? {
                let rec: IdempotencyRecord =
                    serde_json::from_slice(&bytes).map_err(abort_codec)?;
                if rec.expires_at > now {
                    return Ok(AdmissionOutcome {
                        session_id: rec.session_id,
                        created: false,
                    });
                }
            }

            let record = IdempotencyRecord {
                session_id: session.id.clone(),
                created_at: now,
                expires_at: now + ttl.as_millis() as u64,
            };
            idem.insert(
                key.as_bytes(),
                serde_json::to_vec(&record).map_err(abort_codec)?,
            )?;
            sessions.insert(
                session.id.as_bytes(),
                serde_json::to_vec(session).map_err(abort_codec)?,
            )?;
            Ok(AdmissionOutcome {
                session_id: session.id.clone(),
                created: true,
            })
        });
        result.map_err(backend)
    }

    fn try_acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<LeaseOutcome> {
        let now = store_now();
        let result = self.leases.transaction(|tx| {
            let current: Option<LeaseRecord> = match tx.get(key.as_bytes())? {
                Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(abort_codec)?),
                None => None,
            };
            let (write, outcome) = lease_acquire_decision(current, owner, ttl, now);
            if let Some(rec) = write {
                tx.insert(
                    key.as_bytes(),
                    serde_json::to_vec(&rec).map_err(abort_codec)?,
                )?;
            }
            Ok(outcome)
        });
        result.map_err(backend)
    }

    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()> {
        let owner = owner.to_string();
        let result = self.leases.transaction(|tx| {
            if let Some(bytes) = tx.get(key.as_bytes())? {
                let rec: LeaseRecord = serde_json::from_slice(&bytes).map_err(abort_codec)?;
                if rec.owner == owner {
                    tx.remove(key.as_bytes())?;
                }
            }
            Ok(())
        });
        result.map_err(backend)
    }

    fn delete_all_leases(&self) -> StoreResult<()> {
        self.leases.clear().map_err(backend)
    }
}
