//! Encoder child-process supervision.
//!
//! One supervisor invocation owns one child process for its entire life:
//! spawn, progress tracking, stall detection, kill escalation, and exit
//! classification. The caller gets back either a completed run or a typed
//! failure with the bounded stderr tail attached; the child never outlives
//! the call (`kill_on_drop` covers panics and cancellation).
//!
//! Stall detection watches encoder *progress* (`out_time_us` from the
//! `-progress` stream), not wall-clock time: an encoder that merely slows
//! down keeps its session alive, one that stops advancing gets killed
//! after the stall window. A grace period from spawn tolerates slow
//! starts (tuner locking, input probing).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::Strategy;
use crate::protocol_constants::{
    REMUX_TIMEOUT_BASELINE_SECS, REMUX_TIMEOUT_CAP_SECS, REMUX_TIMEOUT_PER_GIB_SECS,
    STDERR_CHUNK_MAX_BYTES, STDERR_TAIL_CHUNKS,
};
use crate::utils::now_millis;

/// What to run.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    /// Encoder binary.
    pub bin: PathBuf,
    /// Full argument vector (see [`super::build_args`]).
    pub args: Vec<String>,
    /// Strategy label carried through to metrics and sidecars.
    pub strategy: Strategy,
}

/// Supervision windows.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimeouts {
    /// Grace from spawn before stall detection engages.
    pub stall_grace: Duration,
    /// No-progress window after which the child is killed.
    pub stall_timeout: Duration,
    /// SIGTERM-to-SIGKILL escalation window.
    pub graceful_kill: Duration,
    /// End-to-end wall-clock limit; `None` for live sessions, which only
    /// terminate on stop/idle/stall/exit.
    pub wall_clock: Option<Duration>,
}

/// A successful run.
#[derive(Debug)]
pub struct EncoderRun {
    /// Strategy that produced the output.
    pub strategy: Strategy,
    /// Bounded stderr tail (diagnostics; may be non-empty on success).
    pub stderr_tail: String,
    /// Last progress position observed (microseconds of output time).
    pub last_out_time_us: u64,
}

/// A failed run.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The child never started (or its handles failed).
    #[error("encoder process error: {0}")]
    Spawn(#[from] std::io::Error),

    /// Progress stopped advancing past the stall window.
    #[error("encoder stalled (no progress for the stall window)")]
    Stalled {
        /// Bounded stderr tail.
        stderr_tail: String,
    },

    /// The dynamic wall-clock limit elapsed (recording remux only).
    #[error("encoder exceeded wall-clock limit {limit:?}")]
    WallClockExceeded {
        limit: Duration,
        stderr_tail: String,
    },

    /// The session context was cancelled; the child was torn down.
    #[error("encoder cancelled")]
    Cancelled,

    /// The child exited nonzero.
    #[error("encoder exited with status {code}")]
    Exited {
        code: i32,
        stderr_tail: String,
    },
}

/// Dynamic wall-clock timeout for a recording remux:
/// `baseline (20 min) + 1 min per GiB of input`, capped at 2 h.
#[must_use]
pub fn dynamic_remux_timeout(size_bytes: Option<u64>) -> Duration {
    const GIB: u64 = 1024 * 1024 * 1024;
    let gib = size_bytes.unwrap_or(0).div_ceil(GIB);
    let secs = (REMUX_TIMEOUT_BASELINE_SECS + gib * REMUX_TIMEOUT_PER_GIB_SECS)
        .min(REMUX_TIMEOUT_CAP_SECS);
    Duration::from_secs(secs)
}

/// Extracts `out_time_us` from one progress line, ignoring `N/A`.
fn parse_out_time_us(line: &str) -> Option<u64> {
    line.strip_prefix("out_time_us=")?.trim().parse().ok()
}

/// Clamps a stderr line to the chunk budget on a char boundary.
fn truncate_chunk(mut line: String) -> String {
    if line.len() > STDERR_CHUNK_MAX_BYTES {
        let mut cut = STDERR_CHUNK_MAX_BYTES;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
    }
    line
}

type TailBuffer = Arc<Mutex<VecDeque<String>>>;

fn collect_tail(tail: &TailBuffer) -> String {
    tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
}

/// Kills the child: SIGTERM, then SIGKILL after the grace window.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // Give the encoder a chance to flush its playlist/moov.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            log::warn!("[Encoder] Child ignored SIGTERM for {:?}, escalating", grace);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

/// Runs one encoder invocation under full supervision.
///
/// `progress_mark`, when given, receives a Unix-millis timestamp on every
/// progress advance; the orchestrator persists it on the session record.
pub async fn run_encoder(
    spec: &EncoderSpec,
    timeouts: SupervisorTimeouts,
    cancel: &CancellationToken,
    progress_mark: Option<Arc<AtomicU64>>,
) -> Result<EncoderRun, EncoderError> {
    log::debug!(
        "[Encoder] Spawning {} ({} strategy, {} args)",
        spec.bin.display(),
        spec.strategy.as_str(),
        spec.args.len()
    );

    let mut child = Command::new(&spec.bin)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // stderr tail collector: bounded chunks, bounded count.
    let tail: TailBuffer = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_CHUNKS)));
    let stderr = child.stderr.take().expect("stderr piped");
    let tail_writer = Arc::clone(&tail);
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = tail_writer.lock();
            if buf.len() >= STDERR_TAIL_CHUNKS {
                buf.pop_front();
            }
            buf.push_back(truncate_chunk(line));
        }
    });

    let stdout = child.stdout.take().expect("stdout piped");
    let mut progress_lines = BufReader::new(stdout).lines();

    let started = Instant::now();
    let mut last_advance = started;
    let mut last_out_time_us: u64 = 0;
    let mut check = tokio::time::interval(Duration::from_millis(500));
    check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child, timeouts.graceful_kill).await;
                stderr_task.abort();
                return Err(EncoderError::Cancelled);
            }

            line = progress_lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(us) = parse_out_time_us(&line) {
                        if us > last_out_time_us {
                            last_out_time_us = us;
                            last_advance = Instant::now();
                            if let Some(mark) = &progress_mark {
                                mark.store(now_millis(), Ordering::Relaxed);
                            }
                        }
                    }
                }
                // EOF or read error: the child is exiting.
                Ok(None) | Err(_) => break,
            },

            _ = check.tick() => {
                let now = Instant::now();
                if let Some(limit) = timeouts.wall_clock {
                    if now >= started + limit {
                        log::warn!(
                            "[Encoder] Wall-clock limit {:?} exceeded ({} strategy)",
                            limit,
                            spec.strategy.as_str()
                        );
                        terminate(&mut child, timeouts.graceful_kill).await;
                        stderr_task.abort();
                        return Err(EncoderError::WallClockExceeded {
                            limit,
                            stderr_tail: collect_tail(&tail),
                        });
                    }
                }
                // The stall clock starts at the end of the grace period, so a
                // single early progress event does not arm detection ahead of
                // a slow tuner lock.
                let stall_basis = last_advance.max(started + timeouts.stall_grace);
                if now >= stall_basis + timeouts.stall_timeout {
                    log::warn!(
                        "[Encoder] Progress stalled at out_time_us={} ({} strategy)",
                        last_out_time_us,
                        spec.strategy.as_str()
                    );
                    terminate(&mut child, timeouts.graceful_kill).await;
                    stderr_task.abort();
                    return Err(EncoderError::Stalled {
                        stderr_tail: collect_tail(&tail),
                    });
                }
            }
        }
    }

    // Progress stream closed; bound the wait for the actual exit.
    let status = match tokio::time::timeout(timeouts.graceful_kill, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            stderr_task.abort();
            return Err(EncoderError::Spawn(e));
        }
        Err(_) => {
            // stdout closed but the process lingers: treat as a stall.
            terminate(&mut child, timeouts.graceful_kill).await;
            stderr_task.abort();
            return Err(EncoderError::Stalled {
                stderr_tail: collect_tail(&tail),
            });
        }
    };

    // Reader hits EOF once the child is gone; join it for a complete tail.
    let _ = stderr_task.await;
    let stderr_tail = collect_tail(&tail);

    if status.success() {
        Ok(EncoderRun {
            strategy: spec.strategy,
            stderr_tail,
            last_out_time_us,
        })
    } else {
        Err(EncoderError::Exited {
            code: status.code().unwrap_or(-1),
            stderr_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_time_parsing() {
        assert_eq!(parse_out_time_us("out_time_us=5000000"), Some(5_000_000));
        assert_eq!(parse_out_time_us("out_time_us=N/A"), None);
        assert_eq!(parse_out_time_us("progress=continue"), None);
        assert_eq!(parse_out_time_us("frame=42"), None);
    }

    #[test]
    fn chunk_truncation_respects_char_boundaries() {
        let long = "x".repeat(2 * STDERR_CHUNK_MAX_BYTES);
        assert_eq!(truncate_chunk(long).len(), STDERR_CHUNK_MAX_BYTES);

        // Multi-byte char straddling the cut must not split.
        let mut tricky = "a".repeat(STDERR_CHUNK_MAX_BYTES - 1);
        tricky.push('ü');
        let out = truncate_chunk(tricky);
        assert!(out.len() <= STDERR_CHUNK_MAX_BYTES);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn dynamic_timeout_scales_with_size() {
        const GIB: u64 = 1024 * 1024 * 1024;
        assert_eq!(dynamic_remux_timeout(None), Duration::from_secs(20 * 60));
        assert_eq!(
            dynamic_remux_timeout(Some(3 * GIB)),
            Duration::from_secs(20 * 60 + 3 * 60)
        );
        // Partial GiB rounds up.
        assert_eq!(
            dynamic_remux_timeout(Some(GIB + 1)),
            Duration::from_secs(20 * 60 + 2 * 60)
        );
        // Pathological sizes hit the cap.
        assert_eq!(
            dynamic_remux_timeout(Some(1000 * GIB)),
            Duration::from_secs(2 * 60 * 60)
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn sh_spec(script: &str, strategy: Strategy) -> EncoderSpec {
            EncoderSpec {
                bin: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
                strategy,
            }
        }

        fn quick_timeouts() -> SupervisorTimeouts {
            SupervisorTimeouts {
                stall_grace: Duration::from_millis(100),
                stall_timeout: Duration::from_millis(400),
                graceful_kill: Duration::from_millis(500),
                wall_clock: None,
            }
        }

        #[tokio::test]
        async fn clean_exit_reports_progress() {
            let spec = sh_spec(
                "echo out_time_us=1000000; echo out_time_us=2000000; echo progress=end",
                Strategy::DefaultRemux,
            );
            let cancel = CancellationToken::new();
            let run = run_encoder(&spec, quick_timeouts(), &cancel, None)
                .await
                .unwrap();
            assert_eq!(run.last_out_time_us, 2_000_000);
            assert_eq!(run.strategy, Strategy::DefaultRemux);
        }

        #[tokio::test]
        async fn nonzero_exit_carries_stderr_tail() {
            let spec = sh_spec(
                "echo 'Non-monotonous DTS in output stream 0:0' >&2; exit 1",
                Strategy::DefaultRemux,
            );
            let cancel = CancellationToken::new();
            let err = run_encoder(&spec, quick_timeouts(), &cancel, None)
                .await
                .unwrap_err();
            match err {
                EncoderError::Exited { code, stderr_tail } => {
                    assert_eq!(code, 1);
                    assert!(stderr_tail.contains("Non-monotonous DTS"));
                }
                other => panic!("expected Exited, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn silent_child_is_stalled_and_killed() {
            // Emits one progress event then sleeps far past the stall window.
            let spec = sh_spec("echo out_time_us=1000000; sleep 30", Strategy::DefaultRemux);
            let cancel = CancellationToken::new();
            let started = std::time::Instant::now();
            let err = run_encoder(&spec, quick_timeouts(), &cancel, None)
                .await
                .unwrap_err();
            assert!(matches!(err, EncoderError::Stalled { .. }));
            // Killed promptly after grace + stall window, not after the sleep.
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn cancellation_tears_the_child_down() {
            let spec = sh_spec("sleep 30", Strategy::DefaultRemux);
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                canceller.cancel();
            });
            let started = std::time::Instant::now();
            let err = run_encoder(&spec, quick_timeouts(), &cancel, None)
                .await
                .unwrap_err();
            assert!(matches!(err, EncoderError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn wall_clock_limit_fires_without_progress_stall() {
            // Keeps progressing, but the wall-clock budget is tiny.
            let spec = sh_spec(
                "i=0; while true; do i=$((i+1000000)); echo out_time_us=$i; sleep 0.1; done",
                Strategy::DefaultRemux,
            );
            let timeouts = SupervisorTimeouts {
                wall_clock: Some(Duration::from_millis(800)),
                ..quick_timeouts()
            };
            let cancel = CancellationToken::new();
            let err = run_encoder(&spec, timeouts, &cancel, None).await.unwrap_err();
            assert!(matches!(err, EncoderError::WallClockExceeded { .. }));
        }

        #[tokio::test]
        async fn progress_mark_is_updated() {
            let spec = sh_spec(
                "echo out_time_us=1000000; echo progress=end",
                Strategy::DefaultRemux,
            );
            let cancel = CancellationToken::new();
            let mark = Arc::new(AtomicU64::new(0));
            run_encoder(&spec, quick_timeouts(), &cancel, Some(Arc::clone(&mark)))
                .await
                .unwrap();
            assert!(mark.load(Ordering::Relaxed) > 0);
        }
    }
}
