//! Per-session orchestration worker.
//!
//! One worker task owns one session from pickup to terminal state. All
//! session mutation flows through this task; the API only ever enqueues
//! events (start, stop) and reads.
//!
//! Phase structure mirrors the lifecycle: acquire leases (NEW), resolve
//! and probe the source (STARTING), spawn the encoder and gate on the
//! first playable artifact set (PRIMING), then serve until stop, idle,
//! stall or encoder death (READY/DRAINING/STOPPING).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::encoder::{
    build_args, classify_exit, run_encoder, EncoderError, EncoderOutput, EncoderSpec, Strategy,
    SupervisorTimeouts,
};
use crate::events::{EventEmitter, SessionEvent};
use crate::hls::SessionDir;
use crate::metrics::Metrics;
use crate::probe::{decide, MediaProbe, RemuxDecision};
use crate::receiver::StreamResolver;
use crate::services::{HeldLeases, LeaseError, LeaseManager};
use crate::session::{Reason, Session, SessionState};
use crate::state::Config;
use crate::store::SessionStore;
use crate::utils::now_millis;

/// Timeouts and paths the worker needs, snapshotted from [`Config`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub encoder_bin: PathBuf,
    pub hls_root: PathBuf,
    pub tune_timeout: Duration,
    pub package_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub stall_grace: Duration,
    pub stall_timeout: Duration,
    pub graceful_kill: Duration,
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            encoder_bin: config.encoder_bin.clone(),
            hls_root: config.hls_root.clone(),
            tune_timeout: Duration::from_secs(config.tune_timeout_secs),
            package_timeout: Duration::from_secs(config.package_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            stall_grace: Duration::from_secs(config.stall_grace_secs),
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            graceful_kill: Duration::from_secs(config.graceful_kill_timeout_secs),
        }
    }
}

/// Shared dependencies of all workers.
pub struct WorkerDeps {
    pub store: Arc<dyn SessionStore>,
    pub leases: Arc<LeaseManager>,
    pub resolver: Arc<dyn StreamResolver>,
    pub probe: Arc<MediaProbe>,
    pub config: WorkerConfig,
    pub metrics: Arc<Metrics>,
    pub emitter: Arc<dyn EventEmitter>,
}

/// A running session worker.
pub struct SessionWorker {
    deps: Arc<WorkerDeps>,
    session_id: String,
    /// Client stop intent (graceful drain).
    stop: CancellationToken,
    /// Process shutdown (hard cancel).
    shutdown: CancellationToken,
    /// Unix millis of the last playlist fetch; drives the idle gate.
    touch: Arc<AtomicU64>,
}

impl SessionWorker {
    pub fn new(
        deps: Arc<WorkerDeps>,
        session_id: String,
        stop: CancellationToken,
        shutdown: CancellationToken,
        touch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            deps,
            session_id,
            stop,
            shutdown,
            touch,
        }
    }

    /// Persists a transition, recording metrics and emitting the event.
    fn persist(&self, session: &mut Session, to: SessionState, reason: Reason) {
        let from = session.state;
        if let Err(e) = session.transition(to, reason) {
            log::error!("[Worker] {}: {}", self.session_id, e);
            return;
        }
        self.deps
            .metrics
            .record_transition(from.as_str(), to.as_str());
        self.deps.emitter.emit_session(SessionEvent::StateChanged {
            session_id: session.id.clone(),
            state: to,
            reason,
            timestamp: session.updated_at,
        });
        log::info!(
            "[Worker] Session {}: {} -> {} ({})",
            session.id,
            from.as_str(),
            to.as_str(),
            reason.as_str()
        );
        if let Err(e) = self.deps.store.put_session(session) {
            log::error!("[Worker] Failed to persist session {}: {}", session.id, e);
        }
    }

    fn fail(&self, session: &mut Session, reason: Reason) {
        self.persist(session, SessionState::Failed, reason);
    }

    /// Releases leases and removes artifacts where appropriate.
    async fn teardown(&self, session: &Session, held: Option<&HeldLeases>, remove_artifacts: bool) {
        if let Some(held) = held {
            if let Err(e) = self.deps.leases.release(&session.id, held) {
                log::warn!("[Worker] Lease release failed for {}: {}", session.id, e);
            }
        }
        if remove_artifacts {
            if let Some(dir) = session
                .hls_dir
                .as_deref()
                .map(PathBuf::from)
                .filter(|d| d.exists())
            {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    log::warn!(
                        "[Worker] Artifact removal failed for {} (sweeper will retry): {}",
                        session.id,
                        e
                    );
                }
            }
        }
    }

    /// Runs the session to a terminal state.
    pub async fn run(self) {
        let mut session = match self.deps.store.get_session(&self.session_id) {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::error!("[Worker] Session {} vanished before pickup", self.session_id);
                return;
            }
            Err(e) => {
                log::error!("[Worker] Cannot load session {}: {}", self.session_id, e);
                return;
            }
        };
        if session.is_terminal() {
            return;
        }

        // ── Leases (NEW -> STARTING | FAILED) ────────────────────────────────
        let held = match self
            .deps
            .leases
            .acquire_for_session(&session.id, &session.service_ref)
        {
            Ok(held) => held,
            Err(LeaseError::Busy { key, holder }) => {
                log::info!(
                    "[Worker] Session {} lost lease contention on {} (holder {})",
                    session.id,
                    key,
                    holder
                );
                self.fail(&mut session, Reason::LeaseBusy);
                return;
            }
            Err(LeaseError::Store(e)) => {
                log::error!("[Worker] Lease acquisition store error: {}", e);
                self.fail(&mut session, Reason::Store);
                return;
            }
        };
        session.leases = vec![held.service_key.clone(), held.tuner_key.clone()];
        session.owner_worker = Some(format!("worker-{}", session.id));
        self.persist(&mut session, SessionState::Starting, Reason::None);

        match self.drive(&mut session, &held).await {
            Ok(()) => {}
            Err((state, reason)) => self.persist(&mut session, state, reason),
        }

        // Clean stops remove artifacts immediately; failures leave the
        // directory (with its diagnostics) for the sweeper.
        let remove_artifacts = session.state == SessionState::Stopped;
        self.teardown(&session, Some(&held), remove_artifacts).await;
    }

    /// STARTING through terminal. Errors return the terminal transition to
    /// apply.
    async fn drive(
        &self,
        session: &mut Session,
        held: &HeldLeases,
    ) -> Result<(), (SessionState, Reason)> {
        let config = &self.deps.config;

        // ── Resolve the source (STARTING) ────────────────────────────────────
        let source_url = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err((SessionState::Cancelled, Reason::Cancelled));
            }
            _ = self.stop.cancelled() => {
                return Err((SessionState::Cancelled, Reason::Cancelled));
            }
            resolved = tokio::time::timeout(
                config.tune_timeout,
                self.deps.resolver.resolve(&session.service_ref, &self.shutdown),
            ) => match resolved {
                Ok(Ok(url)) => url,
                Ok(Err(e)) => {
                    log::warn!("[Worker] Tune failed for {}: {}", session.id, e);
                    return Err((SessionState::Failed, Reason::TuneFailed));
                }
                Err(_) => {
                    log::warn!("[Worker] Tune timed out for {}", session.id);
                    return Err((SessionState::Failed, Reason::TuneFailed));
                }
            }
        };

        // ── Probe and decide ─────────────────────────────────────────────────
        let strategy = match self.deps.probe.probe(&source_url).await {
            Ok(report) => match decide(&report, &session.profile) {
                RemuxDecision::Copy => Strategy::DefaultRemux,
                RemuxDecision::Transcode(trigger) => {
                    log::info!("[Worker] Session {} transcodes ({:?})", session.id, trigger);
                    Strategy::Transcode
                }
                RemuxDecision::Unsupported(why) => {
                    log::warn!("[Worker] Session {} unsupported: {}", session.id, why);
                    return Err((SessionState::Failed, Reason::UnsupportedMedia));
                }
            },
            Err(e) => {
                log::warn!("[Worker] Probe failed for {}: {}", session.id, e);
                return Err((SessionState::Failed, Reason::FfmpegStartFailed));
            }
        };

        // ── Artifact directory + encoder spawn (-> PRIMING) ──────────────────
        let Some(dir) = SessionDir::new(&config.hls_root, &session.id) else {
            return Err((SessionState::Failed, Reason::Store));
        };
        if let Err(e) = dir.create().await {
            log::error!("[Worker] Cannot create {}: {}", dir.path().display(), e);
            return Err((SessionState::Failed, Reason::Store));
        }
        session.hls_dir = Some(dir.path().to_string_lossy().into_owned());

        let spec = EncoderSpec {
            bin: config.encoder_bin.clone(),
            args: build_args(
                strategy,
                &source_url,
                &EncoderOutput::Hls {
                    dir: dir.path(),
                    segment_secs: session.profile.segment_secs,
                    container: session.profile.container,
                },
            ),
            strategy,
        };
        let timeouts = SupervisorTimeouts {
            stall_grace: config.stall_grace,
            stall_timeout: config.stall_timeout,
            graceful_kill: config.graceful_kill,
            // Live sessions have no end-of-input; they end on stop, idle,
            // stall or child exit.
            wall_clock: None,
        };

        let progress_mark = Arc::new(AtomicU64::new(0));
        let encoder_cancel = CancellationToken::new();
        let encoder = run_encoder(&spec, timeouts, &encoder_cancel, Some(Arc::clone(&progress_mark)));
        tokio::pin!(encoder);

        self.persist(session, SessionState::Priming, Reason::None);

        // ── Gate on the first playable artifact set (PRIMING -> READY) ───────
        tokio::select! {
            result = &mut encoder => {
                // Encoder died before anything was playable.
                return Err(self.map_encoder_end(result, strategy));
            }
            gated = dir.wait_until_playable(config.package_timeout, &self.shutdown) => {
                match gated {
                    Ok(()) => {}
                    Err(crate::hls::PublishError::Cancelled) => {
                        encoder_cancel.cancel();
                        let _ = (&mut encoder).await;
                        return Err((SessionState::Cancelled, Reason::Cancelled));
                    }
                    Err(_) => {
                        log::warn!("[Worker] Session {} never became playable", session.id);
                        encoder_cancel.cancel();
                        let _ = (&mut encoder).await;
                        return Err((SessionState::Failed, Reason::PackagerFailed));
                    }
                }
            }
            _ = self.stop.cancelled() => {
                encoder_cancel.cancel();
                let _ = (&mut encoder).await;
                return Err((SessionState::Cancelled, Reason::Cancelled));
            }
        }

        self.touch.store(now_millis(), Ordering::Relaxed);
        self.persist(session, SessionState::Ready, Reason::None);
        let ready_latency = now_millis().saturating_sub(session.created_at);
        self.deps
            .metrics
            .time_to_ready_secs
            .observe(ready_latency as f64 / 1000.0);

        // ── Serve (READY) ────────────────────────────────────────────────────
        let drain_reason = {
            let mut renew = tokio::time::interval(self.deps.leases.renew_interval());
            renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut idle_check = tokio::time::interval(Duration::from_secs(1));
            idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                // Persist the freshest encoder progress mark opportunistically.
                let mark = progress_mark.load(Ordering::Relaxed);
                if mark > session.last_progress_at {
                    session.last_progress_at = mark;
                }

                tokio::select! {
                    result = &mut encoder => {
                        return Err(self.map_encoder_end(result, strategy));
                    }
                    _ = renew.tick() => {
                        if let Err(e) = self.deps.leases.renew(&session.id, held) {
                            log::error!(
                                "[Worker] Lease renewal lost for {}: {}",
                                session.id,
                                e
                            );
                            encoder_cancel.cancel();
                            let _ = (&mut encoder).await;
                            return Err((SessionState::Failed, Reason::LeaseBusy));
                        }
                    }
                    _ = idle_check.tick() => {
                        let last = self.touch.load(Ordering::Relaxed);
                        let idle_for = now_millis().saturating_sub(last);
                        if idle_for > config.idle_timeout.as_millis() as u64 {
                            log::info!(
                                "[Worker] Session {} idle for {}ms, draining",
                                session.id,
                                idle_for
                            );
                            break Reason::Idle;
                        }
                    }
                    _ = self.stop.cancelled() => break Reason::ClientStop,
                    _ = self.shutdown.cancelled() => {
                        encoder_cancel.cancel();
                        let _ = (&mut encoder).await;
                        return Err((SessionState::Cancelled, Reason::Cancelled));
                    }
                }
            }
        };

        // ── Drain (READY -> DRAINING -> [STOPPING ->] STOPPED) ───────────────
        self.persist(session, SessionState::Draining, drain_reason);
        encoder_cancel.cancel();
        let drained =
            tokio::time::timeout(config.drain_timeout, &mut encoder).await;
        let _ = dir.finalize_playlist().await;
        match drained {
            Ok(_) => {
                self.persist(session, SessionState::Stopped, drain_reason);
            }
            Err(_) => {
                // Encoder ignored the drain window; force teardown.
                self.persist(session, SessionState::Stopping, drain_reason);
                let _ = (&mut encoder).await;
                self.persist(session, SessionState::Stopped, drain_reason);
            }
        }
        Ok(())
    }

    /// Maps an encoder completion during PRIMING/READY to a terminal
    /// transition.
    fn map_encoder_end(
        &self,
        result: Result<crate::encoder::EncoderRun, EncoderError>,
        strategy: Strategy,
    ) -> (SessionState, Reason) {
        match result {
            // A live encoder exiting cleanly still ends the session: the
            // upstream closed on us.
            Ok(_) => (SessionState::Failed, Reason::EncoderUnknown),
            Err(EncoderError::Stalled { .. }) => {
                self.deps
                    .metrics
                    .encoder_stalls
                    .with_label_values(&[strategy.as_str()])
                    .inc();
                (SessionState::Failed, Reason::Stall)
            }
            Err(EncoderError::Exited { code, stderr_tail }) => {
                let reason = classify_exit(code, &stderr_tail)
                    .map(|verdict| verdict.reason)
                    .unwrap_or(Reason::EncoderUnknown);
                log::warn!(
                    "[Worker] Session {} encoder exited {} ({})",
                    self.session_id,
                    code,
                    reason.as_str()
                );
                (SessionState::Failed, reason)
            }
            Err(EncoderError::Cancelled) => (SessionState::Cancelled, Reason::Cancelled),
            Err(EncoderError::Spawn(e)) => {
                log::error!("[Worker] Encoder spawn failed: {}", e);
                (SessionState::Failed, Reason::FfmpegStartFailed)
            }
            Err(EncoderError::WallClockExceeded { .. }) => {
                (SessionState::Failed, Reason::EncoderUnknown)
            }
        }
    }
}
