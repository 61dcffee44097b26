//! HLS artifact publication and the playable-on-READY gate.
//!
//! The encoder writes segments through temp files and renames them into
//! place (`temp_file` flag), so a visible playlist only ever references
//! files that exist. This module adds the second half of the invariant:
//! READY is not announced until the playlist AND at least one media
//! segment are on disk, verified by a short-cadence filesystem probe.
//!
//! Nothing here deletes segments: the DVR window stays open for the whole
//! session, and teardown belongs to the sweeper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::protocol_constants::{
    HLS_INIT_NAME, HLS_PLAYLIST_NAME, HLS_SEGMENT_PREFIX, MIME_HLS_PLAYLIST, MIME_MP4, MIME_MPEGTS,
    READY_PROBE_INTERVAL_MS,
};
use crate::utils::is_valid_id;

/// Publication failure.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The first playable artifact set did not appear within the deadline.
    #[error("no playable artifact set within {0:?}")]
    Timeout(Duration),

    /// The session context was cancelled while waiting.
    #[error("publication wait cancelled")]
    Cancelled,

    /// Filesystem error while probing or finalizing.
    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of servable asset inside a session directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// `index.m3u8`
    Playlist,
    /// `init.mp4`
    Init,
    /// `seg_NNNNNN.m4s`
    SegmentFmp4,
    /// `seg_NNNNNN.ts`
    SegmentTs,
}

impl AssetKind {
    /// Exact MIME type for the asset.
    ///
    /// Segments and init are `video/mp4` - never `video/iso.segment`,
    /// which Chrome's MSE rejects.
    #[must_use]
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Playlist => MIME_HLS_PLAYLIST,
            Self::Init | Self::SegmentFmp4 => MIME_MP4,
            Self::SegmentTs => MIME_MPEGTS,
        }
    }
}

/// Classifies a requested asset filename, refusing anything outside the
/// fixed artifact grammar (this doubles as the traversal guard for the
/// serving path).
#[must_use]
pub fn classify_asset(name: &str) -> Option<AssetKind> {
    if name == HLS_PLAYLIST_NAME {
        return Some(AssetKind::Playlist);
    }
    if name == HLS_INIT_NAME {
        return Some(AssetKind::Init);
    }
    let rest = name.strip_prefix(HLS_SEGMENT_PREFIX)?;
    let (digits, ext) = rest.split_once('.')?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match ext {
        "m4s" => Some(AssetKind::SegmentFmp4),
        "ts" => Some(AssetKind::SegmentTs),
        _ => None,
    }
}

/// Per-session artifact paths under the HLS root.
#[derive(Debug, Clone)]
pub struct SessionDir {
    dir: PathBuf,
}

impl SessionDir {
    /// Resolves the directory for `session_id`, refusing ids outside the
    /// identifier grammar.
    pub fn new(hls_root: &Path, session_id: &str) -> Option<Self> {
        if !is_valid_id(session_id) {
            return None;
        }
        Some(Self {
            dir: hls_root.join("sessions").join(session_id),
        })
    }

    /// The directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of the playlist.
    #[must_use]
    pub fn playlist(&self) -> PathBuf {
        self.dir.join(HLS_PLAYLIST_NAME)
    }

    /// Path of a validated asset; `None` for names outside the grammar.
    #[must_use]
    pub fn asset(&self, name: &str) -> Option<(PathBuf, AssetKind)> {
        let kind = classify_asset(name)?;
        Some((self.dir.join(name), kind))
    }

    /// Creates the directory tree.
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Whether a playable artifact set exists: playlist plus at least one
    /// media segment.
    #[must_use]
    pub fn is_playable(&self) -> bool {
        if !self.playlist().is_file() {
            return false;
        }
        has_segment(&self.dir)
    }

    /// Blocks until the artifact set is playable, polling at the readiness
    /// cadence, bounded by `deadline` and cancellation.
    pub async fn wait_until_playable(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let mut probe = tokio::time::interval(Duration::from_millis(READY_PROBE_INTERVAL_MS));
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let give_up = tokio::time::Instant::now() + deadline;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                _ = probe.tick() => {
                    if self.is_playable() {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= give_up {
                        return Err(PublishError::Timeout(deadline));
                    }
                }
            }
        }
    }

    /// Appends `#EXT-X-ENDLIST` to the playlist via write-temp-then-rename,
    /// marking the stream finished for players. Idempotent.
    pub async fn finalize_playlist(&self) -> Result<(), PublishError> {
        let playlist = self.playlist();
        let Ok(mut content) = tokio::fs::read_to_string(&playlist).await else {
            // Nothing was ever published; nothing to finalize.
            return Ok(());
        };
        if content.contains("#EXT-X-ENDLIST") {
            return Ok(());
        }
        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str("#EXT-X-ENDLIST\n");

        let tmp = self.dir.join(".index.m3u8.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &playlist).await?;
        Ok(())
    }
}

fn has_segment(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if matches!(
                classify_asset(name),
                Some(AssetKind::SegmentFmp4 | AssetKind::SegmentTs)
            ) {
                return true;
            }
        }
    }
    false
}
