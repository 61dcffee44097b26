//! Session intake and worker registry.
//!
//! The orchestrator sits between the intent API and the per-session
//! workers. Admission is centralized here: the API computes nothing but
//! the request shape; the orchestrator canonicalizes the intent, runs the
//! atomic put-or-get against the store, and - only for newly created
//! sessions - publishes a start event that its own intake loop turns into
//! a worker task. Leases are acquired by the worker, never at the API
//! boundary, so contention surfaces as a terminal session state instead
//! of an HTTP error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::worker::{SessionWorker, WorkerDeps};
use super::{Profile, Reason, Session, SessionState};
use crate::error::{E2castError, E2castResult};
use crate::events::SessionEvent;
use crate::idempotency::intent_key;
use crate::store::AdmissionOutcome;
use crate::utils::{new_session_id, now_millis};

/// Event published for each newly created session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionEvent {
    /// The session to pick up.
    pub session_id: String,
}

/// Handle to a running worker.
struct ActiveHandle {
    stop: CancellationToken,
    touch: Arc<AtomicU64>,
}

/// Intake, admission and worker registry.
pub struct Orchestrator {
    deps: Arc<WorkerDeps>,
    active: Arc<DashMap<String, ActiveHandle>>,
    tx: mpsc::UnboundedSender<StartSessionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StartSessionEvent>>>,
    idempotency_ttl: Duration,
    worker_enabled: bool,
}

impl Orchestrator {
    /// Creates the orchestrator; `run` starts the intake loop.
    pub fn new(deps: Arc<WorkerDeps>, worker_enabled: bool, idempotency_ttl: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            deps,
            active: Arc::new(DashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            idempotency_ttl,
            worker_enabled,
        }
    }

    /// Admits a play intent: canonical key, atomic put-or-get, at most one
    /// start event per key.
    ///
    /// Always yields a session id on success; concurrent identical intents
    /// converge on the same id with exactly one event published.
    pub fn admit(
        &self,
        service_ref: &str,
        profile_json: &serde_json::Value,
        start_ms: Option<u64>,
    ) -> E2castResult<AdmissionOutcome> {
        let profile: Profile = serde_json::from_value(profile_json.clone())
            .map_err(|e| E2castError::InvalidRequest(format!("invalid profile: {e}")))?;
        let key = intent_key(service_ref, profile_json, start_ms);

        let session = Session::new(
            new_session_id(),
            service_ref.to_string(),
            profile,
            start_ms,
        );
        let outcome = self
            .deps
            .store
            .put_session_with_idempotency(&session, &key, self.idempotency_ttl)?;

        if outcome.created {
            self.deps.emitter.emit_session(SessionEvent::Created {
                session_id: outcome.session_id.clone(),
                service_ref: service_ref.to_string(),
                timestamp: now_millis(),
            });
            log::info!(
                "[Orchestrator] Admitted session {} for {}",
                outcome.session_id,
                service_ref
            );
            // The receiver only drops after shutdown, when admissions are
            // already refused upstream; a send failure is harmless then.
            let _ = self.tx.send(StartSessionEvent {
                session_id: outcome.session_id.clone(),
            });
        } else {
            log::debug!(
                "[Orchestrator] Intent deduplicated onto session {}",
                outcome.session_id
            );
        }
        Ok(outcome)
    }

    /// Routes a stop intent.
    ///
    /// Running sessions drain gracefully; sessions that never reached a
    /// worker are cancelled in place; stopping an already-terminal session
    /// is idempotent.
    pub fn request_stop(&self, session_id: &str) -> E2castResult<()> {
        if let Some(handle) = self.active.get(session_id) {
            handle.stop.cancel();
            return Ok(());
        }
        match self.deps.store.get_session(session_id)? {
            None => Err(E2castError::SessionNotFound(session_id.to_string())),
            Some(session) if session.is_terminal() => Ok(()),
            Some(mut session) => {
                // Not picked up (worker disabled or backlog): cancel directly.
                if session
                    .transition(SessionState::Cancelled, Reason::ClientStop)
                    .is_ok()
                {
                    self.deps.store.put_session(&session)?;
                    self.deps.emitter.emit_session(SessionEvent::StateChanged {
                        session_id: session.id.clone(),
                        state: SessionState::Cancelled,
                        reason: Reason::ClientStop,
                        timestamp: session.updated_at,
                    });
                }
                Ok(())
            }
        }
    }

    /// Records a playlist fetch for the idle gate.
    pub fn touch(&self, session_id: &str) {
        if let Some(handle) = self.active.get(session_id) {
            handle.touch.store(now_millis(), Ordering::Relaxed);
        }
    }

    /// Number of currently running workers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Intake loop: turns start events into worker tasks until shutdown.
    ///
    /// # Panics
    /// Panics if called twice; the intake receiver is single-consumer.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("Orchestrator::run called twice");
        if !self.worker_enabled {
            log::warn!("[Orchestrator] Worker disabled; sessions will not start");
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.worker_enabled {
                continue;
            }

            let stop = CancellationToken::new();
            let touch = Arc::new(AtomicU64::new(now_millis()));
            self.active.insert(
                event.session_id.clone(),
                ActiveHandle {
                    stop: stop.clone(),
                    touch: Arc::clone(&touch),
                },
            );

            let worker = SessionWorker::new(
                Arc::clone(&self.deps),
                event.session_id.clone(),
                stop,
                shutdown.clone(),
                touch,
            );
            let active = Arc::clone(&self.active);
            let session_id = event.session_id;
            tokio::spawn(async move {
                worker.run().await;
                active.remove(&session_id);
            });
        }
        log::info!("[Orchestrator] Intake loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::metrics::Metrics;
    use crate::probe::MediaProbe;
    use crate::receiver::{ReceiverResult, StreamResolver};
    use crate::services::LeaseManager;
    use crate::session::worker::WorkerConfig;
    use crate::state::Config;
    use crate::store::{MemoryStore, SessionStore};
    use serde_json::json;

    struct StaticResolver(String);

    #[async_trait::async_trait]
    impl StreamResolver for StaticResolver {
        async fn resolve(
            &self,
            _service_ref: &str,
            _cancel: &CancellationToken,
        ) -> ReceiverResult<String> {
            Ok(self.0.clone())
        }
    }

    fn test_deps(store: Arc<dyn SessionStore>) -> Arc<WorkerDeps> {
        let metrics = Arc::new(Metrics::new());
        let config = Config::default();
        Arc::new(WorkerDeps {
            store: Arc::clone(&store),
            leases: Arc::new(LeaseManager::new(
                store,
                vec![0],
                Duration::from_secs(30),
                Arc::clone(&metrics),
            )),
            resolver: Arc::new(StaticResolver("http://box:8001/ref".into())),
            probe: Arc::new(MediaProbe::new("ffprobe".into(), Duration::from_secs(5))),
            config: WorkerConfig::from(&config),
            metrics,
            emitter: Arc::new(NoopEventEmitter),
        })
    }

    fn orchestrator(store: Arc<dyn SessionStore>) -> Orchestrator {
        // Worker disabled: admission behavior is what these tests cover.
        Orchestrator::new(test_deps(store), false, Duration::from_secs(60))
    }

    #[test]
    fn identical_intents_converge_on_one_session() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let profile = json!({"codec": "h264"});

        let first = orch.admit("1:0:19:1:1:1:1:0:0:0:", &profile, None).unwrap();
        let second = orch.admit("1:0:19:1:1:1:1:0:0:0:", &profile, None).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.session_id, second.session_id);
        // Exactly one start event was queued.
        let mut rx = orch.rx.lock().take().unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_id, first.session_id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn profile_key_order_is_irrelevant() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(Arc::clone(&store));

        let a = orch
            .admit("ref", &json!({"codec": "h264", "maxHeight": 720}), None)
            .unwrap();
        let b = orch
            .admit("ref", &json!({"maxHeight": 720, "codec": "h264"}), None)
            .unwrap();
        assert_eq!(a.session_id, b.session_id);
    }

    #[test]
    fn distinct_channels_get_distinct_sessions() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let profile = json!({"codec": "h264"});

        let a = orch.admit("ref-a", &profile, None).unwrap();
        let b = orch.admit("ref-b", &profile, None).unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn malformed_profile_is_rejected() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let err = orch
            .admit("ref", &json!({"codec": 42}), None)
            .unwrap_err();
        assert!(matches!(err, E2castError::InvalidRequest(_)));
    }

    #[test]
    fn stop_on_unknown_session_is_not_found() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(store);
        assert!(matches!(
            orch.request_stop("nope"),
            Err(E2castError::SessionNotFound(_))
        ));
    }

    #[test]
    fn stop_on_unpicked_session_cancels_it() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(Arc::clone(&store));
        let outcome = orch.admit("ref", &json!({"codec": "h264"}), None).unwrap();

        orch.request_stop(&outcome.session_id).unwrap();
        let session = store.get_session(&outcome.session_id).unwrap().unwrap();
        assert_eq!(session.state, SessionState::Cancelled);
        assert_eq!(session.reason, Reason::ClientStop);

        // Idempotent.
        orch.request_stop(&outcome.session_id).unwrap();
    }
}
