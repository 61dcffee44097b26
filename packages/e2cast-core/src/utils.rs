//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Generates a new opaque session id.
///
/// The id is a 32-character lowercase hex token, which satisfies the
/// `[A-Za-z0-9_-]+` identifier grammar used everywhere ids cross a
/// filesystem or URL boundary.
#[must_use]
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Validates an identifier against `^[A-Za-z0-9_-]+$`.
///
/// Used as the path-traversal guard wherever an id names a directory under
/// the HLS root: the sweeper refuses to touch children with names outside
/// this grammar, and the API refuses to serve them.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
