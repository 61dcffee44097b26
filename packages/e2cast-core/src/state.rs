//! Core application configuration.
//!
//! [`Config`] is a process-wide snapshot taken at startup. A small subset
//! of fields is hot-reloadable (see [`Config::merge_reloadable`]); the
//! server binary re-reads its file on SIGHUP and merges that subset in.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the orchestrator worker acquires tuners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Real tuner slots from `tuner_slots`.
    #[default]
    Standard,
    /// Mocked single slot for development without hardware.
    Virtual,
}

/// Configuration for the e2cast control plane.
///
/// All fields have safe defaults except `receiver_base_url` and
/// `auth_token`, which deployments must set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Server
    /// Port for the HTTP control plane.
    pub preferred_port: u16,

    // Worker
    /// Whether the orchestrator worker runs (false = admission-only node).
    pub worker_enabled: bool,
    /// Tuner acquisition mode.
    pub worker_mode: WorkerMode,

    // Store
    /// Store backend: `memory` | `btree` | `lsm`.
    pub store_backend: String,
    /// Directory/file for the embedded backends.
    pub store_path: Option<PathBuf>,

    // Receiver
    /// Base URL of the receiver's Web API (OpenWebif).
    pub receiver_base_url: String,
    /// Hardware tuner slots available to sessions.
    pub tuner_slots: Vec<u32>,
    /// Deadline for resolving + settling a tune (seconds).
    pub tune_timeout_secs: u64,
    /// Receiver request retry attempts.
    pub receiver_retries: u32,
    /// Backoff cap for receiver retries (milliseconds).
    pub receiver_max_backoff_ms: u64,

    // Encoder
    /// Path to the encoder binary.
    pub encoder_bin: PathBuf,
    /// Grace between SIGTERM and SIGKILL when stopping the encoder (seconds).
    pub graceful_kill_timeout_secs: u64,
    /// No-progress window after which a live encoder is killed (seconds).
    pub stall_timeout_secs: u64,
    /// Startup grace before stall detection engages (seconds).
    pub stall_grace_secs: u64,

    // HLS
    /// Root directory for session artifact sets.
    pub hls_root: PathBuf,
    /// Deadline for the first playable artifact set (seconds).
    pub package_timeout_secs: u64,
    /// No-playlist-fetch window after READY before draining (seconds).
    pub idle_timeout_secs: u64,
    /// Deadline for a drain to complete before forced teardown (seconds).
    pub drain_timeout_secs: u64,

    // Sweeper
    /// Interval between sweep passes (seconds).
    pub sweep_interval_secs: u64,
    /// Age past which terminal sessions are deleted (seconds).
    pub session_retention_secs: u64,
    /// Age past which orphan directories are deleted (seconds);
    /// defaults to `session_retention_secs` when unset.
    pub file_retention_secs: Option<u64>,

    // Leases
    /// Lease TTL for tuner and service-dedup keys (seconds).
    pub lease_ttl_secs: u64,

    // Auth
    /// Bearer token for the control plane. Empty disables auth (dev only).
    pub auth_token: String,
    /// Scopes granted to the token.
    pub scopes: Vec<String>,

    // VOD cache
    /// Directory for remuxed recordings.
    pub vod_cache_root: PathBuf,
    /// Free-space low water mark triggering eviction (bytes).
    pub vod_free_low_bytes: u64,
    /// Bytes to free once eviction triggers.
    pub vod_free_high_bytes: u64,
    /// TTL for cached remuxes (seconds).
    pub vod_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_port: 8088,
            worker_enabled: true,
            worker_mode: WorkerMode::Standard,
            store_backend: "memory".to_string(),
            store_path: None,
            receiver_base_url: "http://127.0.0.1:80".to_string(),
            tuner_slots: Vec::new(),
            tune_timeout_secs: 10,
            receiver_retries: 3,
            receiver_max_backoff_ms: 4_000,
            encoder_bin: PathBuf::from("ffmpeg"),
            graceful_kill_timeout_secs: 5,
            stall_timeout_secs: 90,
            stall_grace_secs: 30,
            hls_root: PathBuf::from("/var/lib/e2cast/hls"),
            package_timeout_secs: 30,
            idle_timeout_secs: 120,
            drain_timeout_secs: 10,
            sweep_interval_secs: 300,
            session_retention_secs: 24 * 60 * 60,
            file_retention_secs: None,
            lease_ttl_secs: 30,
            auth_token: String::new(),
            scopes: vec!["v3:read".to_string(), "v3:write".to_string()],
            vod_cache_root: PathBuf::from("/var/lib/e2cast/vod"),
            vod_free_low_bytes: 5 * 1024 * 1024 * 1024,
            vod_free_high_bytes: 1024 * 1024 * 1024,
            vod_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Validates startup-critical settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_enabled
            && self.worker_mode == WorkerMode::Standard
            && self.tuner_slots.is_empty()
        {
            return Err(
                "tuner_slots must not be empty in standard worker mode (set worker_mode: virtual \
                 for development without hardware)"
                    .to_string(),
            );
        }
        if self.store_backend != "memory" && self.store_path.is_none() {
            return Err(format!(
                "store_backend '{}' requires store_path",
                self.store_backend
            ));
        }
        if self.lease_ttl_secs == 0 {
            return Err("lease_ttl_secs must be >= 1".to_string());
        }
        if self.stall_timeout_secs == 0 {
            return Err("stall_timeout_secs must be >= 1".to_string());
        }
        Ok(())
    }

    /// Tuner slots after applying the worker-mode policy: virtual mode
    /// substitutes a single mocked slot when none are configured.
    #[must_use]
    pub fn effective_tuner_slots(&self) -> Vec<u32> {
        if self.tuner_slots.is_empty() && self.worker_mode == WorkerMode::Virtual {
            vec![0]
        } else {
            self.tuner_slots.clone()
        }
    }

    /// Orphan-file retention, defaulting to the session retention.
    #[must_use]
    pub fn file_retention_secs(&self) -> u64 {
        self.file_retention_secs
            .unwrap_or(self.session_retention_secs)
    }

    /// Copies the hot-reloadable subset of `other` into `self`.
    ///
    /// Anything affecting admission, storage identity or lease ownership is
    /// deliberately NOT reloadable; those require a restart.
    pub fn merge_reloadable(&mut self, other: &Config) {
        self.idle_timeout_secs = other.idle_timeout_secs;
        self.sweep_interval_secs = other.sweep_interval_secs;
        self.session_retention_secs = other.session_retention_secs;
        self.file_retention_secs = other.file_retention_secs;
        self.vod_free_low_bytes = other.vod_free_low_bytes;
        self.vod_free_high_bytes = other.vod_free_high_bytes;
        self.vod_ttl_secs = other.vod_ttl_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_mode_requires_tuner_slots() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut with_slots = Config::default();
        with_slots.tuner_slots = vec![0, 1];
        assert!(with_slots.validate().is_ok());
    }

    #[test]
    fn virtual_mode_mocks_a_slot() {
        let mut config = Config::default();
        config.worker_mode = WorkerMode::Virtual;
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_tuner_slots(), vec![0]);
    }

    #[test]
    fn embedded_backend_requires_path() {
        let mut config = Config::default();
        config.tuner_slots = vec![0];
        config.store_backend = "btree".to_string();
        assert!(config.validate().is_err());
        config.store_path = Some(PathBuf::from("/tmp/e2cast.redb"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_retention_defaults_to_session_retention() {
        let mut config = Config::default();
        assert_eq!(config.file_retention_secs(), config.session_retention_secs);
        config.file_retention_secs = Some(60);
        assert_eq!(config.file_retention_secs(), 60);
    }

    #[test]
    fn merge_reloadable_leaves_identity_fields_alone() {
        let mut base = Config::default();
        let mut updated = Config::default();
        updated.idle_timeout_secs = 30;
        updated.store_backend = "lsm".to_string();
        updated.auth_token = "changed".to_string();

        base.merge_reloadable(&updated);
        assert_eq!(base.idle_timeout_secs, 30);
        assert_eq!(base.store_backend, "memory");
        assert_eq!(base.auth_token, "");
    }
}
