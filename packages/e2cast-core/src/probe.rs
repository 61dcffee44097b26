//! Media probing and the remux decision.
//!
//! Runs the encoder suite's probe binary (`ffprobe`) against a source URL
//! or file and reduces its JSON report to the handful of facts the
//! pipeline cares about: codec, pixel depth, interlacing, audio codecs,
//! duration, size. [`decide`] then maps a report + profile to a
//! [`RemuxDecision`] as a pure function - no side effects, trivially
//! testable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::session::Profile;

/// Probe failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe binary could not be spawned.
    #[error("failed to spawn probe: {0}")]
    Spawn(#[from] std::io::Error),

    /// The probe ran past its deadline.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The probe exited nonzero.
    #[error("probe exited with status {0}")]
    Failed(i32),

    /// The probe output was not parseable.
    #[error("probe output parse error: {0}")]
    Parse(String),
}

/// Reduced media facts extracted from the probe report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    /// Video codec name (`h264`, `hevc`, ...); `None` when no video track.
    pub video_codec: Option<String>,
    /// Pixel format (`yuv420p`, `yuv420p10le`, ...).
    pub pix_fmt: Option<String>,
    /// Inferred bit depth; 8 when nothing says otherwise.
    pub bit_depth: u8,
    /// Whether the video is interlaced.
    pub interlaced: bool,
    /// Vertical resolution.
    pub height: Option<u32>,
    /// Audio codec per track, in stream order.
    pub audio_codecs: Vec<String>,
    /// Container duration (seconds).
    pub duration_secs: Option<f64>,
    /// Container size (bytes); absent for live sources.
    pub size_bytes: Option<u64>,
}

/// What to do with a source, given a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxDecision {
    /// Copy the video stream, normalize audio.
    Copy,
    /// Re-encode video to H.264.
    Transcode(TranscodeTrigger),
    /// A hard constraint failed; the session cannot proceed.
    Unsupported(&'static str),
}

/// Why a transcode was chosen over a copy-remux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeTrigger {
    /// HEVC source, client family without HEVC decode.
    HevcUnsupported,
    /// 10-bit (or deeper) pixel format.
    HighBitDepth,
    /// Interlaced source.
    Interlaced,
    /// Source resolution exceeds the profile cap.
    ResolutionCap,
    /// Audio outside AAC/MP3.
    AudioCodec,
    /// Video codec outside H.264/HEVC.
    VideoCodec,
}

/// Maps a probe report and profile to a remux decision.
#[must_use]
pub fn decide(report: &ProbeReport, profile: &Profile) -> RemuxDecision {
    let Some(video) = report.video_codec.as_deref() else {
        return RemuxDecision::Unsupported("no video track");
    };

    match video {
        "h264" => {}
        "hevc" if profile.allow_hevc => {}
        "hevc" => return RemuxDecision::Transcode(TranscodeTrigger::HevcUnsupported),
        _ => return RemuxDecision::Transcode(TranscodeTrigger::VideoCodec),
    }
    if report.bit_depth > 8 {
        return RemuxDecision::Transcode(TranscodeTrigger::HighBitDepth);
    }
    if report.interlaced {
        return RemuxDecision::Transcode(TranscodeTrigger::Interlaced);
    }
    if report.height.is_some_and(|h| h > profile.max_height) {
        return RemuxDecision::Transcode(TranscodeTrigger::ResolutionCap);
    }
    if report
        .audio_codecs
        .iter()
        .any(|codec| !matches!(codec.as_str(), "aac" | "mp3"))
    {
        return RemuxDecision::Transcode(TranscodeTrigger::AudioCodec);
    }
    RemuxDecision::Copy
}

/// Derives the probe binary path from the encoder binary path.
///
/// `ffmpeg` becomes its sibling `ffprobe`; anything else is assumed to
/// accept the same name with a `probe` suffix convention and falls back
/// to plain `ffprobe` on the PATH.
#[must_use]
pub fn probe_bin_for(encoder_bin: &Path) -> PathBuf {
    if encoder_bin.file_name().is_some_and(|n| n == "ffmpeg") {
        encoder_bin.with_file_name("ffprobe")
    } else {
        PathBuf::from("ffprobe")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ffprobe JSON shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    pix_fmt: Option<String>,
    bits_per_raw_sample: Option<String>,
    field_order: Option<String>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

fn pix_fmt_depth_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})(?:le|be)$").expect("valid regex"))
}

/// Infers bit depth: pixel-format suffix first (`yuv420p10le` -> 10),
/// then `bits_per_raw_sample`, then 8.
fn infer_bit_depth(pix_fmt: Option<&str>, bits_per_raw_sample: Option<&str>) -> u8 {
    if let Some(pix_fmt) = pix_fmt {
        if let Some(caps) = pix_fmt_depth_regex().captures(pix_fmt) {
            if let Ok(depth) = caps[1].parse::<u8>() {
                return depth;
            }
        }
    }
    bits_per_raw_sample
        .and_then(|s| s.parse::<u8>().ok())
        .unwrap_or(8)
}

fn is_interlaced(field_order: Option<&str>) -> bool {
    matches!(field_order, Some("tt" | "bb" | "tb" | "bt" | "interlaced"))
}

/// Parses raw ffprobe JSON into a [`ProbeReport`].
fn parse_report(json: &str) -> Result<ProbeReport, ProbeError> {
    let output: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let mut report = ProbeReport {
        bit_depth: 8,
        ..ProbeReport::default()
    };
    for stream in &output.streams {
        match stream.codec_type.as_deref() {
            Some("video") if report.video_codec.is_none() => {
                report.video_codec = stream.codec_name.clone();
                report.pix_fmt = stream.pix_fmt.clone();
                report.bit_depth = infer_bit_depth(
                    stream.pix_fmt.as_deref(),
                    stream.bits_per_raw_sample.as_deref(),
                );
                report.interlaced = is_interlaced(stream.field_order.as_deref());
                report.height = stream.height;
            }
            Some("audio") => {
                if let Some(codec) = &stream.codec_name {
                    report.audio_codecs.push(codec.clone());
                }
            }
            _ => {}
        }
    }
    if let Some(format) = &output.format {
        report.duration_secs = format.duration.as_deref().and_then(|d| d.parse().ok());
        report.size_bytes = format.size.as_deref().and_then(|s| s.parse().ok());
    }
    Ok(report)
}

/// Runs the probe binary against `input` with a deadline.
pub struct MediaProbe {
    probe_bin: PathBuf,
    timeout: Duration,
}

impl MediaProbe {
    /// Creates a probe runner.
    #[must_use]
    pub fn new(probe_bin: PathBuf, timeout: Duration) -> Self {
        Self { probe_bin, timeout }
    }

    /// Probes `input` (URL or path) and returns the reduced report.
    pub async fn probe(&self, input: &str) -> Result<ProbeReport, ProbeError> {
        let child = Command::new(&self.probe_bin)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ProbeError::Failed(output.status.code().unwrap_or(-1)));
        }
        parse_report(&String::from_utf8_lossy(&output.stdout))
    }
}
