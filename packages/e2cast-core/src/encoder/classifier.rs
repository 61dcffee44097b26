//! Encoder stderr classification.
//!
//! ffmpeg reports most failures only as free-text stderr plus a nonzero
//! exit. This module reduces the retained stderr tail to a structured
//! verdict: a reason code for the FSM and a retry hint for the recording
//! fallback ladder. Matching is case-insensitive substring; the catalog
//! is small and deliberate - every entry was earned in the field.

use crate::session::Reason;

/// What the caller should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Retry with the fallback remux arguments (timestamp damage).
    Fallback,
    /// Retry with full transcode arguments (codec/bit-depth/decode damage).
    Transcode,
    /// Do not retry.
    Terminal,
}

/// Structured classification of one encoder exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Reason code for the FSM.
    pub reason: Reason,
    /// Ladder hint for the recording remux path.
    pub retry: RetryHint,
}

/// Patterns that indicate broken timestamps, fixable by the fallback
/// remux arguments.
const DTS_PATTERNS: &[&str] = &["non-monotonous dts", "non monotonically increasing dts"];

/// Patterns that indicate decode-level damage, fixable only by a full
/// transcode.
const BROKEN_PATTERNS: &[&str] = &[
    "invalid data found when processing input",
    "error while decoding",
    "could not find codec parameters",
];

/// Patterns that are noise on dirty transport streams; ignored when the
/// child still exits 0.
const NON_FATAL_PATTERNS: &[&str] = &[
    "pes packet size mismatch",
    "packet corrupt",
    "incomplete frame",
];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classifies an encoder exit from its status code and stderr tail.
///
/// A zero exit is success regardless of what stderr grumbled about -
/// the non-fatal catalog exists precisely because dirty DVB streams
/// produce those lines on every run.
#[must_use]
pub fn classify_exit(exit_code: i32, stderr_tail: &str) -> Option<Verdict> {
    if exit_code == 0 {
        return None;
    }
    let tail = stderr_tail.to_ascii_lowercase();

    if contains_any(&tail, DTS_PATTERNS) {
        return Some(Verdict {
            reason: Reason::Dts,
            retry: RetryHint::Fallback,
        });
    }
    if tail.contains("timestamps are unset") {
        return Some(Verdict {
            reason: Reason::TsUnset,
            retry: RetryHint::Fallback,
        });
    }
    if tail.contains("packet with invalid duration") {
        return Some(Verdict {
            reason: Reason::InvalidDuration,
            retry: RetryHint::Terminal,
        });
    }
    if contains_any(&tail, BROKEN_PATTERNS) {
        return Some(Verdict {
            reason: Reason::EncoderUnknown,
            retry: RetryHint::Transcode,
        });
    }
    if contains_any(&tail, NON_FATAL_PATTERNS) {
        // Only noise was captured, but the exit was still nonzero.
        return Some(Verdict {
            reason: Reason::EncoderUnknown,
            retry: RetryHint::Terminal,
        });
    }
    Some(Verdict {
        reason: Reason::EncoderUnknown,
        retry: RetryHint::Terminal,
    })
}
