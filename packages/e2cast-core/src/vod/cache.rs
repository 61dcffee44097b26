//! Disk-pressure cache for remuxed recordings.
//!
//! Two eviction rules, applied by [`VodCache::sweep`]:
//!
//! - TTL: entries older than `vod_ttl` go regardless of pressure.
//! - Pressure: when free space drops below the low-water mark, LRU
//!   entries are evicted until the high-water amount has been freed.
//!
//! Access recency lives in memory (updated on every serve) with file
//! mtime as the cold-start fallback, so a restart does not flush the
//! cache order entirely.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use std::sync::Arc;
use sysinfo::Disks;

use crate::events::{CacheEvent, EventEmitter};
use crate::metrics::Metrics;
use crate::protocol_constants::VOD_LOCK_STALE_SECS;
use crate::utils::{is_valid_id, now_millis};

/// Guard for an in-progress build; removes the lock file on drop.
pub struct BuildLock {
    path: PathBuf,
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("[VodCache] Failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// The cache of remuxed MP4 files.
pub struct VodCache {
    root: PathBuf,
    ttl: Duration,
    free_low: u64,
    free_high: u64,
    /// recording id -> last access (Unix millis). In-memory recency layer.
    access: DashMap<String, u64>,
    metrics: Arc<Metrics>,
    emitter: Arc<dyn EventEmitter>,
}

impl VodCache {
    /// Creates the cache over `root` (created on first build).
    pub fn new(
        root: PathBuf,
        ttl: Duration,
        free_low: u64,
        free_high: u64,
        metrics: Arc<Metrics>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            root,
            ttl,
            free_low,
            free_high,
            access: DashMap::new(),
            metrics,
            emitter,
        }
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cached MP4 for a recording; `None` for invalid ids.
    #[must_use]
    pub fn entry_path(&self, recording_id: &str) -> Option<PathBuf> {
        if !is_valid_id(recording_id) {
            return None;
        }
        Some(self.root.join(format!("{recording_id}.mp4")))
    }

    pub(crate) fn lock_path(&self, recording_id: &str) -> PathBuf {
        self.root.join(format!("{recording_id}.mp4.lock"))
    }

    pub(crate) fn meta_path(&self, recording_id: &str) -> PathBuf {
        self.root.join(format!("{recording_id}.mp4.meta.json"))
    }

    pub(crate) fn err_path(&self, recording_id: &str) -> PathBuf {
        self.root.join(format!("{recording_id}.mp4.err.log"))
    }

    /// Records a serve for LRU ordering.
    pub fn record_access(&self, recording_id: &str) {
        self.access
            .insert(recording_id.to_string(), now_millis());
    }

    /// Takes the per-key build lock.
    ///
    /// A stale lock (older than the lock TTL, likely a crashed builder)
    /// is removed and the acquisition retried once; a fresh lock means a
    /// build is genuinely running elsewhere.
    pub fn acquire_build_lock(&self, recording_id: &str) -> std::io::Result<Option<BuildLock>> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.lock_path(recording_id);
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Some(BuildLock { path }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path) {
                        log::warn!(
                            "[VodCache] Removing stale build lock {}",
                            path.display()
                        );
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn lock_is_stale(&self, path: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age > Duration::from_secs(VOD_LOCK_STALE_SECS))
    }

    /// Removes all stale locks. Called once at startup.
    pub fn remove_stale_locks(&self) {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "lock") && self.lock_is_stale(&path) {
                log::info!("[VodCache] Removing stale lock {}", path.display());
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    /// Free bytes on the filesystem holding the cache root.
    ///
    /// Longest-prefix match against the mounted disks; `u64::MAX` when
    /// nothing matches (pressure eviction then never fires, which is the
    /// safe direction).
    fn free_bytes(&self) -> u64 {
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| self.root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .unwrap_or(u64::MAX)
    }

    fn list_entries(&self) -> Vec<(String, PathBuf, u64, u64)> {
        // (id, path, size, last_access_millis)
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".mp4") else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime_millis = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let last_access = self
                .access
                .get(id)
                .map(|r| *r.value())
                .unwrap_or(mtime_millis);
            out.push((id.to_string(), path, metadata.len(), last_access));
        }
        out
    }

    fn evict(&self, id: &str, path: &Path, size: u64, pressure: bool) {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("[VodCache] Failed to evict {}: {}", path.display(), e);
            return;
        }
        // Sidecars follow the entry.
        let _ = std::fs::remove_file(self.meta_path(id));
        let _ = std::fs::remove_file(self.err_path(id));
        self.access.remove(id);
        let cause = if pressure { "pressure" } else { "ttl" };
        self.metrics.cache_evictions.with_label_values(&[cause]).inc();
        self.emitter.emit_cache(CacheEvent::Evicted {
            recording_id: id.to_string(),
            size_bytes: size,
            pressure,
            timestamp: now_millis(),
        });
        log::info!(
            "[VodCache] Evicted {} ({} bytes, cause={})",
            id,
            size,
            cause
        );
    }

    /// One eviction cycle: TTL first, then pressure.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        let now = now_millis();
        let ttl_millis = self.ttl.as_millis() as u64;

        let mut entries = self.list_entries();
        entries.retain(|(id, path, size, last_access)| {
            if now.saturating_sub(*last_access) > ttl_millis {
                self.evict(id, path, *size, false);
                evicted += 1;
                false
            } else {
                true
            }
        });

        if self.free_bytes() < self.free_low {
            // LRU first.
            entries.sort_by_key(|(_, _, _, last_access)| *last_access);
            let mut freed: u64 = 0;
            for (id, path, size, _) in &entries {
                if freed >= self.free_high {
                    break;
                }
                self.evict(id, path, *size, true);
                freed += size;
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;

    fn cache_at(root: &Path, ttl: Duration) -> VodCache {
        VodCache::new(
            root.to_path_buf(),
            ttl,
            // Low water of 0 disables pressure eviction in unit tests.
            0,
            1024,
            Arc::new(Metrics::new()),
            Arc::new(NoopEventEmitter),
        )
    }

    #[test]
    fn entry_path_validates_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), Duration::from_secs(60));
        assert!(cache.entry_path("rec-1").is_some());
        assert!(cache.entry_path("../evil").is_none());
    }

    #[test]
    fn build_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), Duration::from_secs(60));

        let lock = cache.acquire_build_lock("rec-1").unwrap();
        assert!(lock.is_some());
        // Second acquisition fails while the first is held.
        assert!(cache.acquire_build_lock("rec-1").unwrap().is_none());
        // Other keys are unaffected.
        assert!(cache.acquire_build_lock("rec-2").unwrap().is_some());

        drop(lock);
        assert!(cache.acquire_build_lock("rec-1").unwrap().is_some());
    }

    #[test]
    fn ttl_sweep_evicts_old_entries_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), Duration::from_millis(10));
        let entry = cache.entry_path("rec-1").unwrap();
        std::fs::write(&entry, b"mp4").unwrap();
        std::fs::write(cache.meta_path("rec-1"), b"{}").unwrap();
        // Back-date the access record far past the TTL.
        cache.access.insert("rec-1".to_string(), 1);

        let evicted = cache.sweep();
        assert_eq!(evicted, 1);
        assert!(!entry.exists());
        assert!(!cache.meta_path("rec-1").exists());
    }

    #[test]
    fn fresh_entries_survive_the_ttl_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), Duration::from_secs(3600));
        let entry = cache.entry_path("rec-1").unwrap();
        std::fs::write(&entry, b"mp4").unwrap();
        cache.record_access("rec-1");

        assert_eq!(cache.sweep(), 0);
        assert!(entry.exists());
    }

    #[test]
    fn stale_locks_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), Duration::from_secs(60));
        // A zero-TTL stale check cannot be simulated without clock control,
        // so exercise the startup scan with a fresh (non-stale) lock: it
        // must survive.
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(cache.lock_path("rec-1"), "12345").unwrap();
        cache.remove_stale_locks();
        assert!(cache.lock_path("rec-1").exists());
    }
}
