//! Recording-to-MP4 remux builds with the fallback ladder.
//!
//! Unlike live sessions (which only ever escalate HEVC-without-support to
//! a transcode, decided up front by the probe), recording remuxes walk a
//! ladder on failure: default arguments, then the DTS-tolerant fallback
//! arguments, then a full transcode - each step taken only when the
//! stderr classifier says it can help.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::VodCache;
use crate::encoder::supervisor::dynamic_remux_timeout;
use crate::encoder::{
    build_args, classify_exit, run_encoder, EncoderError, EncoderOutput, EncoderSpec, RetryHint,
    Strategy, SupervisorTimeouts,
};
use crate::metrics::Metrics;
use crate::probe::{decide, MediaProbe, ProbeError, ProbeReport, RemuxDecision};
use crate::session::{Profile, Reason};
use crate::utils::now_millis;

/// Remux failure.
#[derive(Debug, Error)]
pub enum VodError {
    /// The recording id fails the identifier grammar.
    #[error("invalid recording id: {0}")]
    InvalidId(String),

    /// Another process/task is building this key right now.
    #[error("a build for {0} is already in progress")]
    BuildInProgress(String),

    /// Probing the source failed.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// The source cannot be served at all.
    #[error("unsupported source: {0}")]
    Unsupported(&'static str),

    /// All ladder steps failed (or the failure was terminal).
    #[error("remux failed ({}): {detail}", reason.as_str())]
    Encoder { reason: Reason, detail: String },

    /// Filesystem trouble around the cache entry.
    #[error("remux I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A finished build.
#[derive(Debug, Clone)]
pub struct RemuxOutcome {
    /// Path of the playable MP4.
    pub path: PathBuf,
    /// Strategy that produced it (`default` for cache hits of unknown origin).
    pub strategy: Strategy,
    /// Whether the file was already cached.
    pub cached: bool,
}

/// Success sidecar (`.meta.json`), operator diagnostics only.
#[derive(Debug, Serialize)]
struct MetaSidecar<'a> {
    strategy: &'a str,
    source: &'a str,
    video_codec: Option<&'a str>,
    audio_codecs: &'a [String],
    reason: &'a str,
    started_at: u64,
    completed_at: u64,
}

/// Next ladder step after a failed attempt, or `None` when terminal.
fn next_strategy(current: Strategy, hint: RetryHint) -> Option<Strategy> {
    match (current, hint) {
        (Strategy::DefaultRemux, RetryHint::Fallback) => Some(Strategy::FallbackRemux),
        (Strategy::DefaultRemux, RetryHint::Transcode) => Some(Strategy::Transcode),
        (Strategy::FallbackRemux, RetryHint::Transcode) => Some(Strategy::Transcode),
        // Repeating the same (or an earlier) step cannot help.
        _ => None,
    }
}

/// Builds cache entries for recordings.
pub struct RemuxBuilder {
    cache: Arc<VodCache>,
    probe: MediaProbe,
    encoder_bin: PathBuf,
    stall_grace: Duration,
    stall_timeout: Duration,
    graceful_kill: Duration,
    metrics: Arc<Metrics>,
}

impl RemuxBuilder {
    /// Creates a builder over the cache.
    pub fn new(
        cache: Arc<VodCache>,
        probe: MediaProbe,
        encoder_bin: PathBuf,
        stall_grace: Duration,
        stall_timeout: Duration,
        graceful_kill: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            probe,
            encoder_bin,
            stall_grace,
            stall_timeout,
            graceful_kill,
            metrics,
        }
    }

    /// Returns the cached MP4 for `recording_id`, building it if needed.
    pub async fn build(
        &self,
        recording_id: &str,
        input: &Path,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> Result<RemuxOutcome, VodError> {
        let target = self
            .cache
            .entry_path(recording_id)
            .ok_or_else(|| VodError::InvalidId(recording_id.to_string()))?;

        if target.is_file() {
            self.cache.record_access(recording_id);
            return Ok(RemuxOutcome {
                path: target,
                strategy: Strategy::DefaultRemux,
                cached: true,
            });
        }

        let _lock = self
            .cache
            .acquire_build_lock(recording_id)?
            .ok_or_else(|| VodError::BuildInProgress(recording_id.to_string()))?;

        // Lost race: the previous holder may have finished while we waited.
        if target.is_file() {
            self.cache.record_access(recording_id);
            return Ok(RemuxOutcome {
                path: target,
                strategy: Strategy::DefaultRemux,
                cached: true,
            });
        }

        let input_str = input.to_string_lossy().into_owned();
        let report = self.probe.probe(&input_str).await?;
        let initial = match decide(&report, profile) {
            RemuxDecision::Copy => Strategy::DefaultRemux,
            RemuxDecision::Transcode(trigger) => {
                log::info!(
                    "[VodRemux] {} needs transcode ({:?})",
                    recording_id,
                    trigger
                );
                Strategy::Transcode
            }
            RemuxDecision::Unsupported(why) => return Err(VodError::Unsupported(why)),
        };

        let wall_clock = dynamic_remux_timeout(report.size_bytes);
        let started_at = now_millis();
        let tmp = target.with_extension("mp4.tmp");
        let mut strategy = initial;

        loop {
            let spec = EncoderSpec {
                bin: self.encoder_bin.clone(),
                args: build_args(strategy, &input_str, &EncoderOutput::Mp4 { path: &tmp }),
                strategy,
            };
            let timeouts = SupervisorTimeouts {
                stall_grace: self.stall_grace,
                stall_timeout: self.stall_timeout,
                graceful_kill: self.graceful_kill,
                wall_clock: Some(wall_clock),
            };

            match run_encoder(&spec, timeouts, cancel, None).await {
                Ok(_run) => {
                    tokio::fs::rename(&tmp, &target).await?;
                    self.cache.record_access(recording_id);
                    self.write_meta(recording_id, strategy, &input_str, &report, started_at)
                        .await;
                    log::info!(
                        "[VodRemux] Built {} with {} strategy",
                        recording_id,
                        strategy.as_str()
                    );
                    return Ok(RemuxOutcome {
                        path: target,
                        strategy,
                        cached: false,
                    });
                }
                Err(EncoderError::Exited { code, stderr_tail }) => {
                    let verdict = classify_exit(code, &stderr_tail)
                        .expect("nonzero exit always classifies");
                    match next_strategy(strategy, verdict.retry) {
                        Some(next) => {
                            log::warn!(
                                "[VodRemux] {} failed with {} ({}), retrying with {}",
                                recording_id,
                                strategy.as_str(),
                                verdict.reason.as_str(),
                                next.as_str()
                            );
                            self.metrics
                                .encoder_retries
                                .with_label_values(&[strategy.as_str()])
                                .inc();
                            let _ = tokio::fs::remove_file(&tmp).await;
                            strategy = next;
                        }
                        None => {
                            let _ = tokio::fs::remove_file(&tmp).await;
                            self.write_err(recording_id, strategy, verdict.reason, &stderr_tail)
                                .await;
                            return Err(VodError::Encoder {
                                reason: verdict.reason,
                                detail: format!("exit {code}"),
                            });
                        }
                    }
                }
                Err(EncoderError::Stalled { stderr_tail }) => {
                    self.metrics
                        .encoder_stalls
                        .with_label_values(&[strategy.as_str()])
                        .inc();
                    let _ = tokio::fs::remove_file(&tmp).await;
                    self.write_err(recording_id, strategy, Reason::Stall, &stderr_tail)
                        .await;
                    return Err(VodError::Encoder {
                        reason: Reason::Stall,
                        detail: "no encoder progress".to_string(),
                    });
                }
                Err(EncoderError::WallClockExceeded { limit, stderr_tail }) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    self.write_err(recording_id, strategy, Reason::EncoderUnknown, &stderr_tail)
                        .await;
                    return Err(VodError::Encoder {
                        reason: Reason::EncoderUnknown,
                        detail: format!("wall clock limit {limit:?} exceeded"),
                    });
                }
                Err(EncoderError::Cancelled) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(VodError::Encoder {
                        reason: Reason::Cancelled,
                        detail: "cancelled".to_string(),
                    });
                }
                Err(EncoderError::Spawn(e)) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(VodError::Encoder {
                        reason: Reason::FfmpegStartFailed,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    async fn write_meta(
        &self,
        recording_id: &str,
        strategy: Strategy,
        source: &str,
        report: &ProbeReport,
        started_at: u64,
    ) {
        let sidecar = MetaSidecar {
            strategy: strategy.as_str(),
            source,
            video_codec: report.video_codec.as_deref(),
            audio_codecs: &report.audio_codecs,
            reason: "ok",
            started_at,
            completed_at: now_millis(),
        };
        let path = self.cache.meta_path(recording_id);
        match serde_json::to_vec_pretty(&sidecar) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json).await {
                    log::warn!("[VodRemux] Failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!("[VodRemux] Failed to encode meta sidecar: {}", e),
        }
    }

    async fn write_err(
        &self,
        recording_id: &str,
        strategy: Strategy,
        reason: Reason,
        stderr_tail: &str,
    ) {
        let body = format!(
            "strategy: {}\nreason: {}\n---\n{}\n",
            strategy.as_str(),
            reason.as_str(),
            stderr_tail
        );
        let path = self.cache.err_path(recording_id);
        if let Err(e) = tokio::fs::write(&path, body).await {
            log::warn!("[VodRemux] Failed to write {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─────────────────────────────────────────────────────────────────────────
    // Ladder Table
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn ladder_escalates_default_to_fallback_to_transcode() {
        assert_eq!(
            next_strategy(Strategy::DefaultRemux, RetryHint::Fallback),
            Some(Strategy::FallbackRemux)
        );
        assert_eq!(
            next_strategy(Strategy::DefaultRemux, RetryHint::Transcode),
            Some(Strategy::Transcode)
        );
        assert_eq!(
            next_strategy(Strategy::FallbackRemux, RetryHint::Transcode),
            Some(Strategy::Transcode)
        );
    }

    #[test]
    fn ladder_never_repeats_or_descends() {
        assert_eq!(
            next_strategy(Strategy::FallbackRemux, RetryHint::Fallback),
            None
        );
        assert_eq!(next_strategy(Strategy::Transcode, RetryHint::Fallback), None);
        assert_eq!(next_strategy(Strategy::Transcode, RetryHint::Transcode), None);
        for strategy in [
            Strategy::DefaultRemux,
            Strategy::FallbackRemux,
            Strategy::Transcode,
        ] {
            assert_eq!(next_strategy(strategy, RetryHint::Terminal), None);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Build Flow (fake encoder)
    // ─────────────────────────────────────────────────────────────────────────

    #[cfg(unix)]
    mod with_fake_encoder {
        use super::*;
        use crate::events::NoopEventEmitter;
        use std::os::unix::fs::PermissionsExt;

        /// Writes an executable script into `dir` and returns its path.
        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// Fake ffprobe reporting a clean H.264 + AAC source.
        fn fake_probe(dir: &Path) -> PathBuf {
            write_script(
                dir,
                "fake-ffprobe",
                "#!/bin/sh\n\
                 cat <<'EOF'\n\
                 {\"streams\":[{\"codec_type\":\"video\",\"codec_name\":\"h264\",\
                 \"pix_fmt\":\"yuv420p\",\"height\":720},\
                 {\"codec_type\":\"audio\",\"codec_name\":\"aac\"}],\
                 \"format\":{\"duration\":\"60.0\",\"size\":\"1000000\"}}\n\
                 EOF\n",
            )
        }

        /// Fake encoder: fails with a DTS error unless `igndts` appears in
        /// the arguments; on success writes the output file (last arg).
        fn dts_flaky_encoder(dir: &Path) -> PathBuf {
            write_script(
                dir,
                "fake-ffmpeg",
                "#!/bin/sh\n\
                 for a; do last=$a; done\n\
                 case \"$*\" in\n\
                 *igndts*) echo out_time_us=1000000; echo data > \"$last\"; exit 0;;\n\
                 *) echo 'Non-monotonous DTS in output stream 0:0' >&2; exit 1;;\n\
                 esac\n",
            )
        }

        fn builder(bin_dir: &Path, cache_dir: &Path) -> RemuxBuilder {
            let metrics = Arc::new(Metrics::new());
            let cache = Arc::new(VodCache::new(
                cache_dir.to_path_buf(),
                Duration::from_secs(3600),
                0,
                1024,
                Arc::clone(&metrics),
                Arc::new(NoopEventEmitter),
            ));
            RemuxBuilder::new(
                cache,
                MediaProbe::new(fake_probe(bin_dir), Duration::from_secs(5)),
                dts_flaky_encoder(bin_dir),
                Duration::from_millis(100),
                Duration::from_secs(5),
                Duration::from_millis(500),
                metrics,
            )
        }

        #[tokio::test]
        async fn dts_failure_falls_back_and_records_the_strategy() {
            let bin = tempfile::tempdir().unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let input = bin.path().join("rec.ts");
            std::fs::write(&input, b"ts").unwrap();

            let builder = builder(bin.path(), cache_dir.path());
            let cancel = CancellationToken::new();
            let outcome = builder
                .build("rec-1", &input, &Profile::default(), &cancel)
                .await
                .unwrap();

            assert!(!outcome.cached);
            assert_eq!(outcome.strategy, Strategy::FallbackRemux);
            assert!(outcome.path.is_file());

            let meta =
                std::fs::read_to_string(cache_dir.path().join("rec-1.mp4.meta.json")).unwrap();
            assert!(meta.contains("\"strategy\": \"fallback\""));
            // One retry was counted against the default strategy.
            assert_eq!(
                builder
                    .metrics
                    .encoder_retries
                    .with_label_values(&["default"])
                    .get(),
                1
            );
        }

        #[tokio::test]
        async fn second_build_is_served_from_cache() {
            let bin = tempfile::tempdir().unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let input = bin.path().join("rec.ts");
            std::fs::write(&input, b"ts").unwrap();

            let builder = builder(bin.path(), cache_dir.path());
            let cancel = CancellationToken::new();
            builder
                .build("rec-1", &input, &Profile::default(), &cancel)
                .await
                .unwrap();
            let second = builder
                .build("rec-1", &input, &Profile::default(), &cancel)
                .await
                .unwrap();
            assert!(second.cached);
        }

        #[tokio::test]
        async fn concurrent_build_is_refused_by_the_lock() {
            let bin = tempfile::tempdir().unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let input = bin.path().join("rec.ts");
            std::fs::write(&input, b"ts").unwrap();

            let builder = builder(bin.path(), cache_dir.path());
            let held = builder.cache.acquire_build_lock("rec-1").unwrap().unwrap();
            let cancel = CancellationToken::new();
            let err = builder
                .build("rec-1", &input, &Profile::default(), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, VodError::BuildInProgress(_)));
            drop(held);
        }

        #[tokio::test]
        async fn invalid_recording_id_is_refused() {
            let bin = tempfile::tempdir().unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let builder = builder(bin.path(), cache_dir.path());
            let cancel = CancellationToken::new();
            let err = builder
                .build("../evil", Path::new("/dev/null"), &Profile::default(), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, VodError::InvalidId(_)));
        }
    }
}
