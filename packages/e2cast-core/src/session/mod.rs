//! Session model: lifecycle states, reason codes, and the transition table.
//!
//! A [`Session`] is the unit of work of the control plane. It is created by
//! the intent API in [`SessionState::New`], mutated exclusively by the worker
//! task that owns it, and deleted by the sweeper once terminal and aged out.
//!
//! The transition table is the single source of truth for legal lifecycle
//! moves; [`Session::transition`] refuses everything else.

mod orchestrator;
mod worker;

pub use orchestrator::{Orchestrator, StartSessionEvent};
pub use worker::{SessionWorker, WorkerConfig, WorkerDeps};

use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

/// Lifecycle states of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// Accepted, not yet picked up by a worker.
    New,
    /// Leases held, tuning and encoder spawn in progress.
    Starting,
    /// Encoder running, waiting for the first playable artifact set.
    Priming,
    /// Playlist and at least one segment are on disk; playback possible.
    Ready,
    /// Stop requested or idle; encoder winding down.
    Draining,
    /// Teardown of child process and leases in progress.
    Stopping,
    /// Clean end state.
    Stopped,
    /// Error end state; `reason` is non-empty.
    Failed,
    /// Cancelled end state.
    Cancelled,
}

impl SessionState {
    /// Terminal states have no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` appears in the lifecycle transition table.
    ///
    /// `Failed` and `Cancelled` are reachable from every non-terminal state
    /// (worker error / cancel); everything else is enumerated explicitly.
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Self::Failed | Self::Cancelled) {
            return true;
        }
        matches!(
            (self, to),
            (Self::New, Self::Starting)
                | (Self::Starting, Self::Priming)
                | (Self::Priming, Self::Ready)
                | (Self::Ready, Self::Draining)
                | (Self::Draining, Self::Stopping)
                | (Self::Draining, Self::Stopped)
                | (Self::Stopping, Self::Stopped)
        )
    }

    /// Short lowercase label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Priming => "priming",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Machine-readable reason codes attached to state transitions.
///
/// `None` while a session is live; terminal sessions always carry a
/// non-`None` reason except for clean client stops, which carry
/// `ClientStop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reason {
    #[default]
    #[serde(rename = "R_NONE")]
    None,
    #[serde(rename = "R_LEASE_BUSY")]
    LeaseBusy,
    #[serde(rename = "R_TUNE_FAILED")]
    TuneFailed,
    #[serde(rename = "R_FFMPEG_START_FAILED")]
    FfmpegStartFailed,
    #[serde(rename = "R_PACKAGER_FAILED")]
    PackagerFailed,
    #[serde(rename = "R_STALL")]
    Stall,
    #[serde(rename = "R_DTS")]
    Dts,
    #[serde(rename = "R_TS_UNSET")]
    TsUnset,
    #[serde(rename = "R_INVALID_DURATION")]
    InvalidDuration,
    #[serde(rename = "R_ENCODER_UNKNOWN")]
    EncoderUnknown,
    #[serde(rename = "R_STORE")]
    Store,
    #[serde(rename = "R_CLIENT_STOP")]
    ClientStop,
    #[serde(rename = "R_IDLE")]
    Idle,
    #[serde(rename = "R_CANCELLED")]
    Cancelled,
    #[serde(rename = "R_UNSUPPORTED_MEDIA")]
    UnsupportedMedia,
}

impl Reason {
    /// Wire representation (`R_*`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "R_NONE",
            Self::LeaseBusy => "R_LEASE_BUSY",
            Self::TuneFailed => "R_TUNE_FAILED",
            Self::FfmpegStartFailed => "R_FFMPEG_START_FAILED",
            Self::PackagerFailed => "R_PACKAGER_FAILED",
            Self::Stall => "R_STALL",
            Self::Dts => "R_DTS",
            Self::TsUnset => "R_TS_UNSET",
            Self::InvalidDuration => "R_INVALID_DURATION",
            Self::EncoderUnknown => "R_ENCODER_UNKNOWN",
            Self::Store => "R_STORE",
            Self::ClientStop => "R_CLIENT_STOP",
            Self::Idle => "R_IDLE",
            Self::Cancelled => "R_CANCELLED",
            Self::UnsupportedMedia => "R_UNSUPPORTED_MEDIA",
        }
    }
}

/// Segment container requested by the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentContainer {
    /// Fragmented MP4: `init.mp4` + `.m4s` segments.
    #[default]
    Fmp4,
    /// MPEG-TS segments (`.ts`).
    MpegTs,
}

/// Encoding profile carried by a play intent.
///
/// All fields default so `{"codec":"h264"}` is a complete profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    /// Target video codec family.
    pub codec: String,
    /// Resolution cap (vertical pixels); sources above this are transcoded.
    pub max_height: u32,
    /// Segment duration handed to the encoder (seconds).
    pub segment_secs: u32,
    /// Segment container.
    pub container: SegmentContainer,
    /// Whether the client family can decode HEVC. Chrome cannot, which is
    /// why this defaults off.
    pub allow_hevc: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            codec: "h264".to_string(),
            max_height: 1080,
            segment_secs: 4,
            container: SegmentContainer::Fmp4,
            allow_hevc: false,
        }
    }
}

/// A streaming session record as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque id matching `[A-Za-z0-9_-]+`, unique for the process lifetime.
    pub id: String,
    /// Receiver service reference (opaque handle).
    pub service_ref: String,
    /// Encoding profile.
    pub profile: Profile,
    /// Catch-up start position (milliseconds), absent for live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<u64>,
    /// Lifecycle state; mutated only through [`Session::transition`].
    pub state: SessionState,
    /// Reason code for the most recent transition.
    pub reason: Reason,
    /// Creation timestamp (Unix millis).
    pub created_at: u64,
    /// Last mutation timestamp (Unix millis); monotonically non-decreasing.
    pub updated_at: u64,
    /// Id of the worker task that owns this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_worker: Option<String>,
    /// Lease keys currently held on behalf of this session (0..=2).
    #[serde(default)]
    pub leases: Vec<String>,
    /// Artifact directory under the HLS root, once allocated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_dir: Option<String>,
    /// Last observed encoder progress timestamp (Unix millis).
    #[serde(default)]
    pub last_progress_at: u64,
}

/// Error returned for a transition not present in the lifecycle table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl Session {
    /// Creates a session in `NEW` for an accepted intent.
    #[must_use]
    pub fn new(id: String, service_ref: String, profile: Profile, start_ms: Option<u64>) -> Self {
        let now = now_millis();
        Self {
            id,
            service_ref,
            profile,
            start_ms,
            state: SessionState::New,
            reason: Reason::None,
            created_at: now,
            updated_at: now,
            owner_worker: None,
            leases: Vec::new(),
            hls_dir: None,
            last_progress_at: 0,
        }
    }

    /// Applies a state transition, enforcing the lifecycle table and the
    /// monotonic `updated_at` invariant.
    pub fn transition(&mut self, to: SessionState, reason: Reason) -> Result<(), IllegalTransition> {
        if !self.state.can_transition(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.reason = reason;
        self.updated_at = self.updated_at.max(now_millis());
        Ok(())
    }

    /// Whether the session has reached an end state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
