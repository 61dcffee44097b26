//! VOD remux side-path: recording-to-MP4 builds and the disk-pressure cache.
//!
//! Recordings are remuxed once into a cache of `<recordingId>.mp4` files.
//! The cache honors a TTL and evicts LRU under disk pressure; builds are
//! serialized per key by PID-stamped lock files with a stale-lock TTL.

mod cache;
mod remux;

pub use cache::{BuildLock, VodCache};
pub use remux::{RemuxBuilder, RemuxOutcome, VodError};
