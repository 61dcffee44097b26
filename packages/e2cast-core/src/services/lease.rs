//! Lease management for tuner slots and per-service deduplication.
//!
//! Two lease families guard the scarce resources:
//!
//! - `service:<sRef>` - prevents two sessions from tuning the same channel.
//! - `tuner:<slot>` - enforces the hard per-slot capacity.
//!
//! Acquisition is strictly try-acquire through the store's atomic
//! operation; there is no probe-then-acquire anywhere, so no TOCTOU
//! window. Contention is returned to the caller as a structured outcome -
//! the orchestrator turns it into a terminal state, it is never retried
//! here.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::metrics::Metrics;
use crate::store::{SessionStore, StoreError};

/// Lease failure.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Another session holds a required lease.
    #[error("lease {key} is held by session {holder}")]
    Busy { key: String, holder: String },

    /// The store failed underneath.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The pair of leases a running session holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLeases {
    /// `service:<sRef>` dedup lease key.
    pub service_key: String,
    /// `tuner:<slot>` capacity lease key.
    pub tuner_key: String,
    /// The slot backing `tuner_key`.
    pub slot: u32,
}

/// Acquires, renews and releases session leases against the store.
pub struct LeaseManager {
    store: Arc<dyn SessionStore>,
    slots: Vec<u32>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl LeaseManager {
    /// Creates a manager over the configured tuner slots.
    pub fn new(
        store: Arc<dyn SessionStore>,
        slots: Vec<u32>,
        ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            slots,
            ttl,
            metrics,
        }
    }

    fn service_key(service_ref: &str) -> String {
        format!("service:{service_ref}")
    }

    fn tuner_key(slot: u32) -> String {
        format!("tuner:{slot}")
    }

    /// Renewal cadence: a third of the TTL, so two renewals can be missed
    /// before the lease lapses.
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Wipes every lease. Called once at startup before intents are
    /// accepted; this process is the single lease writer, so nothing on
    /// disk can belong to a live peer.
    pub fn flush_all(&self) -> Result<(), StoreError> {
        log::info!("[Lease] Flushing all prior leases");
        self.store.delete_all_leases()
    }

    /// Acquires the service-dedup lease and one tuner slot for `session_id`.
    ///
    /// On tuner exhaustion the service lease is rolled back so a failed
    /// admission leaves nothing behind.
    pub fn acquire_for_session(
        &self,
        session_id: &str,
        service_ref: &str,
    ) -> Result<HeldLeases, LeaseError> {
        let service_key = Self::service_key(service_ref);
        let outcome = self
            .store
            .try_acquire_lease(&service_key, session_id, self.ttl)?;
        if !outcome.acquired {
            self.metrics.lease_outcomes.with_label_values(&["busy"]).inc();
            return Err(LeaseError::Busy {
                key: service_key,
                holder: outcome.current_owner,
            });
        }

        for &slot in &self.slots {
            let tuner_key = Self::tuner_key(slot);
            let outcome = self
                .store
                .try_acquire_lease(&tuner_key, session_id, self.ttl)?;
            if outcome.acquired {
                self.metrics
                    .lease_outcomes
                    .with_label_values(&["acquired"])
                    .inc();
                log::debug!(
                    "[Lease] Session {} holds {} and {}",
                    session_id,
                    service_key,
                    tuner_key
                );
                return Ok(HeldLeases {
                    service_key,
                    tuner_key,
                    slot,
                });
            }
        }

        // No slot free: roll the dedup lease back.
        self.store.release_lease(&service_key, session_id)?;
        self.metrics.lease_outcomes.with_label_values(&["busy"]).inc();
        Err(LeaseError::Busy {
            key: "tuner:*".to_string(),
            holder: String::new(),
        })
    }

    /// Refreshes both leases for their owner. A refresh that comes back
    /// unacquired means the lease lapsed and another session took it.
    pub fn renew(&self, session_id: &str, held: &HeldLeases) -> Result<(), LeaseError> {
        for key in [&held.service_key, &held.tuner_key] {
            let outcome = self.store.try_acquire_lease(key, session_id, self.ttl)?;
            if !outcome.acquired {
                return Err(LeaseError::Busy {
                    key: key.clone(),
                    holder: outcome.current_owner,
                });
            }
        }
        Ok(())
    }

    /// Releases both leases; no-op for keys not held by `session_id`.
    pub fn release(&self, session_id: &str, held: &HeldLeases) -> Result<(), StoreError> {
        self.store.release_lease(&held.service_key, session_id)?;
        self.store.release_lease(&held.tuner_key, session_id)?;
        log::debug!("[Lease] Session {} released its leases", session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(slots: Vec<u32>) -> LeaseManager {
        LeaseManager::new(
            Arc::new(MemoryStore::new()),
            slots,
            Duration::from_secs(30),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn acquires_service_and_first_free_slot() {
        let manager = manager(vec![0, 1]);
        let held = manager.acquire_for_session("s1", "ref-a").unwrap();
        assert_eq!(held.service_key, "service:ref-a");
        assert_eq!(held.tuner_key, "tuner:0");
        assert_eq!(held.slot, 0);

        // Second session on a different channel takes the next slot.
        let held2 = manager.acquire_for_session("s2", "ref-b").unwrap();
        assert_eq!(held2.slot, 1);
    }

    #[test]
    fn same_channel_is_deduplicated() {
        let manager = manager(vec![0, 1]);
        manager.acquire_for_session("s1", "ref-a").unwrap();
        let err = manager.acquire_for_session("s2", "ref-a").unwrap_err();
        match err {
            LeaseError::Busy { key, holder } => {
                assert_eq!(key, "service:ref-a");
                assert_eq!(holder, "s1");
            }
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn tuner_exhaustion_rolls_back_the_service_lease() {
        let manager = manager(vec![0]);
        manager.acquire_for_session("s1", "ref-a").unwrap();

        let err = manager.acquire_for_session("s2", "ref-b").unwrap_err();
        assert!(matches!(err, LeaseError::Busy { .. }));

        // The rolled-back service lease must not block a later attempt
        // once the tuner frees up.
        let held = manager.acquire_for_session("s1b", "ref-b");
        assert!(held.is_err()); // still no slot
        let first = HeldLeases {
            service_key: "service:ref-a".into(),
            tuner_key: "tuner:0".into(),
            slot: 0,
        };
        manager.release("s1", &first).unwrap();
        manager.acquire_for_session("s2", "ref-b").unwrap();
    }

    #[test]
    fn renew_refreshes_both_keys() {
        let manager = manager(vec![0]);
        let held = manager.acquire_for_session("s1", "ref-a").unwrap();
        manager.renew("s1", &held).unwrap();
        // A foreign session cannot renew someone else's leases.
        let err = manager.renew("s2", &held).unwrap_err();
        assert!(matches!(err, LeaseError::Busy { .. }));
    }

    #[test]
    fn flush_all_clears_prior_owners() {
        let manager = manager(vec![0]);
        manager.acquire_for_session("old", "ref-a").unwrap();
        manager.flush_all().unwrap();
        manager.acquire_for_session("new", "ref-a").unwrap();
    }

    #[test]
    fn renew_interval_is_a_third_of_ttl() {
        let manager = manager(vec![0]);
        assert_eq!(manager.renew_interval(), Duration::from_secs(10));
    }
}
