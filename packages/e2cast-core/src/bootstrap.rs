//! Service wiring.
//!
//! `bootstrap_services` builds the full control plane from a validated
//! [`Config`]: store, lease manager (with the startup lease flush),
//! receiver client, probe, orchestrator, sweeper and VOD cache. The
//! caller then starts the background tasks and hands the
//! [`crate::api::AppState`] to the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::auth::AuthPolicy;
use crate::api::AppState;
use crate::events::{EventEmitter, LoggingEventEmitter};
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::probe::{probe_bin_for, MediaProbe};
use crate::receiver::{ReceiverClient, ReceiverError};
use crate::services::{LeaseManager, Sweeper};
use crate::session::{Orchestrator, WorkerConfig, WorkerDeps};
use crate::state::Config;
use crate::store::{open_store, StoreError};
use crate::vod::{RemuxBuilder, VodCache};

/// Deduplication window for identical intents (seconds).
///
/// Long enough to absorb a thundering herd of identical play requests,
/// short enough that a channel restarted minutes later gets a fresh
/// session instead of a stale terminal one.
const INTENT_DEDUP_TTL_SECS: u64 = 60;

/// Bootstrap failure.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The store backend could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The receiver client could not be constructed.
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
}

/// The wired control plane.
pub struct BootstrappedServices {
    pub store: Arc<dyn crate::store::SessionStore>,
    pub leases: Arc<LeaseManager>,
    pub receiver: Arc<ReceiverClient>,
    pub orchestrator: Arc<Orchestrator>,
    pub sweeper: Arc<Sweeper>,
    pub vod_cache: Arc<VodCache>,
    pub remux_builder: Arc<RemuxBuilder>,
    pub lifecycle: Arc<Lifecycle>,
    pub metrics: Arc<Metrics>,
    pub emitter: Arc<dyn EventEmitter>,
    worker_enabled: bool,
    vod_sweep_interval: Duration,
}

/// Builds every service from the configuration.
///
/// Flushes all prior leases before returning: no intent is accepted until
/// the lease table is known-clean.
pub fn bootstrap_services(config: &Config) -> Result<BootstrappedServices, BootstrapError> {
    config.validate().map_err(BootstrapError::Config)?;

    let metrics = Arc::new(Metrics::new());
    let emitter: Arc<dyn EventEmitter> = Arc::new(LoggingEventEmitter);
    let lifecycle = Arc::new(Lifecycle::new());

    let store = open_store(&config.store_backend, config.store_path.as_deref())?;
    log::info!("[Bootstrap] Store backend: {}", config.store_backend);

    let leases = Arc::new(LeaseManager::new(
        Arc::clone(&store),
        config.effective_tuner_slots(),
        Duration::from_secs(config.lease_ttl_secs),
        Arc::clone(&metrics),
    ));
    // Single-writer process: nothing surviving a restart can be valid.
    leases.flush_all()?;

    let receiver = Arc::new(ReceiverClient::new(
        &config.receiver_base_url,
        Duration::from_secs(config.tune_timeout_secs),
        config.receiver_retries,
        Duration::from_millis(config.receiver_max_backoff_ms),
    )?);

    let probe = Arc::new(MediaProbe::new(
        probe_bin_for(&config.encoder_bin),
        Duration::from_secs(config.tune_timeout_secs),
    ));

    let deps = Arc::new(WorkerDeps {
        store: Arc::clone(&store),
        leases: Arc::clone(&leases),
        resolver: Arc::clone(&receiver) as Arc<dyn crate::receiver::StreamResolver>,
        probe: Arc::clone(&probe),
        config: WorkerConfig::from(config),
        metrics: Arc::clone(&metrics),
        emitter: Arc::clone(&emitter),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        deps,
        config.worker_enabled,
        Duration::from_secs(INTENT_DEDUP_TTL_SECS),
    ));

    let sweeper = Arc::new(Sweeper::new(
        Arc::clone(&store),
        config.hls_root.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        Duration::from_secs(config.session_retention_secs),
        Duration::from_secs(config.file_retention_secs()),
        Arc::clone(&metrics),
        Arc::clone(&emitter),
    ));

    let vod_cache = Arc::new(VodCache::new(
        config.vod_cache_root.clone(),
        Duration::from_secs(config.vod_ttl_secs),
        config.vod_free_low_bytes,
        config.vod_free_high_bytes,
        Arc::clone(&metrics),
        Arc::clone(&emitter),
    ));
    vod_cache.remove_stale_locks();

    let remux_builder = Arc::new(RemuxBuilder::new(
        Arc::clone(&vod_cache),
        MediaProbe::new(
            probe_bin_for(&config.encoder_bin),
            Duration::from_secs(config.tune_timeout_secs),
        ),
        config.encoder_bin.clone(),
        Duration::from_secs(config.stall_grace_secs),
        Duration::from_secs(config.stall_timeout_secs),
        Duration::from_secs(config.graceful_kill_timeout_secs),
        Arc::clone(&metrics),
    ));

    Ok(BootstrappedServices {
        store,
        leases,
        receiver,
        orchestrator,
        sweeper,
        vod_cache,
        remux_builder,
        lifecycle,
        metrics,
        emitter,
        worker_enabled: config.worker_enabled,
        vod_sweep_interval: Duration::from_secs(config.sweep_interval_secs),
    })
}

impl BootstrappedServices {
    /// Spawns the orchestrator intake loop, the session sweeper and the
    /// VOD cache sweeper. All wind down on the lifecycle shutdown token.
    pub fn start_background_tasks(&self) {
        let shutdown = self.lifecycle.shutdown_token();

        tokio::spawn(Arc::clone(&self.orchestrator).run(shutdown.clone()));
        tokio::spawn(Arc::clone(&self.sweeper).run(shutdown.clone()));

        let cache = Arc::clone(&self.vod_cache);
        let interval = self.vod_sweep_interval;
        tokio::spawn(run_vod_sweeper(cache, interval, shutdown));
    }

    /// Builds the HTTP layer state.
    #[must_use]
    pub fn app_state(&self, config: Arc<RwLock<Config>>) -> AppState {
        let (auth_token, scopes, hls_root) = {
            let config = config.read();
            (
                config.auth_token.clone(),
                config.scopes.clone(),
                config.hls_root.clone(),
            )
        };
        if auth_token.is_empty() {
            log::warn!("[Bootstrap] auth_token is empty - the API is unauthenticated");
        }
        AppState {
            store: Arc::clone(&self.store),
            orchestrator: Arc::clone(&self.orchestrator),
            lifecycle: Arc::clone(&self.lifecycle),
            auth: Arc::new(AuthPolicy::new(auth_token, scopes)),
            hls_root,
            config,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Begins graceful shutdown: refuse new intents, cancel workers and
    /// background tasks.
    pub fn shutdown(&self) {
        log::info!("[Bootstrap] Shutting down");
        self.lifecycle.begin_shutdown();
    }

    /// Whether the orchestrator worker runs in this process.
    #[must_use]
    pub fn worker_enabled(&self) -> bool {
        self.worker_enabled
    }
}

async fn run_vod_sweeper(cache: Arc<VodCache>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let evicted = cache.sweep();
                if evicted > 0 {
                    log::info!("[VodCache] Sweep evicted {} entries", evicted);
                }
            }
        }
    }
}
