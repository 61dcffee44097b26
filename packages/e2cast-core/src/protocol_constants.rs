//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external contracts (HLS, HTTP, the receiver's
//! Web API, client player quirks) and changing them breaks playback.

// ─────────────────────────────────────────────────────────────────────────────
// HTTP API
// ─────────────────────────────────────────────────────────────────────────────

/// API version advertised in the `X-API-Version` response header.
pub const API_VERSION: &str = "3";

/// Scope required for read operations (session state, HLS assets).
pub const SCOPE_READ: &str = "v3:read";

/// Scope required for write operations (intents, stop).
pub const SCOPE_WRITE: &str = "v3:write";

/// `Retry-After` seconds suggested while the control plane is draining.
pub const DRAINING_RETRY_AFTER_SECS: u64 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// MIME Types
// ─────────────────────────────────────────────────────────────────────────────

/// Playlist MIME type. Apple's registered type; some players refuse
/// `audio/x-mpegurl` for fMP4 HLS.
pub const MIME_HLS_PLAYLIST: &str = "application/vnd.apple.mpegurl";

/// MIME type for both `init.mp4` and `.m4s` media segments.
///
/// Chrome's MSE rejects `video/iso.segment`, so everything fragmented-MP4
/// is served as plain `video/mp4`.
pub const MIME_MP4: &str = "video/mp4";

/// MIME type for MPEG-TS segments (`.ts` profile).
pub const MIME_MPEGTS: &str = "video/mp2t";

// ─────────────────────────────────────────────────────────────────────────────
// HLS Artifacts
// ─────────────────────────────────────────────────────────────────────────────

/// Playlist filename inside a session directory.
pub const HLS_PLAYLIST_NAME: &str = "index.m3u8";

/// Init segment filename (fMP4 mode only).
pub const HLS_INIT_NAME: &str = "init.mp4";

/// Segment filename template handed to the encoder (six-digit counter).
pub const HLS_SEGMENT_PATTERN: &str = "seg_%06d.m4s";

/// Prefix shared by all media segments.
pub const HLS_SEGMENT_PREFIX: &str = "seg_";

/// Cadence for the readiness probe that gates READY (milliseconds).
///
/// The publisher polls for playlist + first segment at this interval;
/// anything above 250ms adds visible latency to time-to-playback.
pub const READY_PROBE_INTERVAL_MS: u64 = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Receiver (Enigma2 OpenWebif)
// ─────────────────────────────────────────────────────────────────────────────

/// Settle delay between stream-URL resolution and the encoder connection
/// (milliseconds).
///
/// The receiver's WebAPI answers before the per-channel data port accepts
/// connections; connecting immediately yields a black screen on encrypted
/// channels routed through the secondary relay. 3 seconds was measured
/// against a Vu+ Duo 4K and an Octagon SF8008.
pub const POST_TUNE_SETTLE_MS: u64 = 3000;

/// Base delay for receiver request backoff (milliseconds).
pub const RECEIVER_BACKOFF_BASE_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Encoder Supervision
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum bytes retained per stderr chunk before truncation.
///
/// ffmpeg repeats some warnings thousands of times per second on corrupt
/// transport streams; unbounded capture has filled disks in the field.
pub const STDERR_CHUNK_MAX_BYTES: usize = 500;

/// Maximum stderr chunks retained in the tail ring buffer.
pub const STDERR_TAIL_CHUNKS: usize = 32;

/// Baseline wall-clock timeout for recording remux (seconds): 20 minutes.
pub const REMUX_TIMEOUT_BASELINE_SECS: u64 = 20 * 60;

/// Additional wall-clock allowance per GiB of input (seconds).
pub const REMUX_TIMEOUT_PER_GIB_SECS: u64 = 60;

/// Hard cap on the dynamic remux timeout (seconds): 2 hours.
pub const REMUX_TIMEOUT_CAP_SECS: u64 = 2 * 60 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// VOD Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Stale-lock TTL for per-recording build locks (seconds): 30 minutes.
pub const VOD_LOCK_STALE_SECS: u64 = 30 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in logs and sidecar metadata.
pub const APP_NAME: &str = "e2cast";
