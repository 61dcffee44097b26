//! Encoder command-line construction.
//!
//! Three strategies, each a pure function from input/output/profile to an
//! argument vector. The source receiver's timing metadata is actively
//! wrong in practice, so every strategy regenerates timestamps
//! (`+genpts`) - "copy timing" is not an option here.

use std::path::Path;

use crate::protocol_constants::{HLS_PLAYLIST_NAME, HLS_SEGMENT_PATTERN};
use crate::session::SegmentContainer;

/// Argument-construction strategy, escalated by the fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Video copy with regenerated timestamps.
    DefaultRemux,
    /// Video copy, additionally ignoring DTS and forcing CFR output;
    /// handles non-monotonic DTS streams.
    FallbackRemux,
    /// Full H.264 re-encode.
    Transcode,
}

impl Strategy {
    /// Label used in metrics and sidecar metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultRemux => "default",
            Self::FallbackRemux => "fallback",
            Self::Transcode => "transcode",
        }
    }
}

/// Where the encoder writes.
#[derive(Debug, Clone)]
pub enum EncoderOutput<'a> {
    /// Live HLS into a session directory.
    Hls {
        dir: &'a Path,
        segment_secs: u32,
        container: SegmentContainer,
    },
    /// Single MP4 file (recording remux).
    Mp4 { path: &'a Path },
}

fn push_strs(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Builds the full argument vector for one encoder invocation.
#[must_use]
pub fn build_args(strategy: Strategy, input: &str, output: &EncoderOutput<'_>) -> Vec<String> {
    let mut args = Vec::with_capacity(48);

    // Global: quiet stderr except real warnings, progress on stdout.
    push_strs(
        &mut args,
        &[
            "-hide_banner",
            "-nostdin",
            "-nostats",
            "-loglevel",
            "warning",
            "-progress",
            "pipe:1",
            "-y",
        ],
    );

    // Input flags per strategy. The receiver's PTS/DTS/PCR cannot be
    // trusted, so timestamps are always regenerated.
    match strategy {
        Strategy::DefaultRemux | Strategy::Transcode => {
            push_strs(
                &mut args,
                &["-fflags", "+genpts+discardcorrupt", "-err_detect", "ignore_err"],
            );
        }
        Strategy::FallbackRemux => {
            push_strs(
                &mut args,
                &[
                    "-fflags",
                    "+genpts+discardcorrupt+igndts",
                    "-err_detect",
                    "ignore_err",
                ],
            );
        }
    }

    push_strs(&mut args, &["-i", input]);
    push_strs(&mut args, &["-avoid_negative_ts", "make_zero"]);

    // Video.
    match strategy {
        Strategy::DefaultRemux | Strategy::FallbackRemux => {
            push_strs(&mut args, &["-c:v", "copy"]);
        }
        Strategy::Transcode => {
            push_strs(
                &mut args,
                &[
                    "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p",
                ],
            );
        }
    }
    if strategy == Strategy::FallbackRemux {
        push_strs(&mut args, &["-vsync", "cfr"]);
    }

    // Audio: always normalized to AAC stereo 48kHz. The most restrictive
    // common client (Chrome) dictates the policy; passing source AC-3/MP2
    // through produces silent playback there.
    push_strs(
        &mut args,
        &["-c:a", "aac", "-ac", "2", "-ar", "48000", "-b:a", "192k"],
    );

    match output {
        EncoderOutput::Mp4 { path } => {
            push_strs(&mut args, &["-movflags", "+faststart", "-f", "mp4"]);
            args.push(path.to_string_lossy().into_owned());
        }
        EncoderOutput::Hls {
            dir,
            segment_secs,
            container,
        } => {
            push_strs(&mut args, &["-f", "hls"]);
            push_strs(&mut args, &["-hls_time", &segment_secs.to_string()]);
            // EVENT playlist, full DVR window, no encoder-side deletion:
            // segment lifetime belongs to the sweeper.
            push_strs(&mut args, &["-hls_playlist_type", "event"]);
            push_strs(&mut args, &["-hls_list_size", "0"]);
            push_strs(
                &mut args,
                &[
                    "-hls_flags",
                    "append_list+omit_endlist+independent_segments+program_date_time+temp_file",
                ],
            );
            match container {
                SegmentContainer::Fmp4 => {
                    push_strs(&mut args, &["-hls_segment_type", "fmp4"]);
                    push_strs(&mut args, &["-hls_fmp4_init_filename", "init.mp4"]);
                    args.push("-hls_segment_filename".to_string());
                    args.push(dir.join(HLS_SEGMENT_PATTERN).to_string_lossy().into_owned());
                }
                SegmentContainer::MpegTs => {
                    args.push("-hls_segment_filename".to_string());
                    args.push(
                        dir.join(HLS_SEGMENT_PATTERN.replace(".m4s", ".ts"))
                            .to_string_lossy()
                            .into_owned(),
                    );
                }
            }
            args.push(dir.join(HLS_PLAYLIST_NAME).to_string_lossy().into_owned());
        }
    }

    args
}
