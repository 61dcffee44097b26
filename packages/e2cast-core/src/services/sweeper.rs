//! Session GC: aged terminal sessions and orphan artifact directories.
//!
//! The orchestrator already removes artifacts best-effort on clean stops;
//! the sweeper is the safety net for crashes, failed sessions kept for
//! diagnostics, and directories whose session the store no longer knows.
//!
//! Two independent passes per cycle:
//!
//! 1. **Store pass** - terminal sessions older than the retention are
//!    deleted from the store together with their directory.
//! 2. **Filesystem pass** - children of `<hls_root>/sessions/` whose name
//!    passes the identifier grammar, whose mtime is past the file
//!    retention, and which the store does not know, are deleted. Names
//!    outside the grammar are never touched (traversal guard).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, SessionEvent};
use crate::metrics::Metrics;
use crate::store::SessionStore;
use crate::utils::{is_valid_id, now_millis};

/// Result of one sweep cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Terminal sessions removed (record + directory).
    pub sessions_removed: usize,
    /// Orphan directories removed.
    pub orphans_removed: usize,
}

/// Periodic GC task.
pub struct Sweeper {
    store: Arc<dyn SessionStore>,
    hls_root: PathBuf,
    interval: Duration,
    session_retention: Duration,
    file_retention: Duration,
    metrics: Arc<Metrics>,
    emitter: Arc<dyn EventEmitter>,
}

impl Sweeper {
    /// Creates a sweeper; `run` starts the periodic loop.
    pub fn new(
        store: Arc<dyn SessionStore>,
        hls_root: PathBuf,
        interval: Duration,
        session_retention: Duration,
        file_retention: Duration,
        metrics: Arc<Metrics>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            store,
            hls_root,
            interval,
            session_retention,
            file_retention,
            metrics,
            emitter,
        }
    }

    fn sessions_root(&self) -> PathBuf {
        self.hls_root.join("sessions")
    }

    /// Periodic loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; that is wanted, it cleans up
        // leftovers from a previous run right after startup.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[Sweeper] Stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let stats = self.sweep_once().await;
                    if stats.sessions_removed > 0 || stats.orphans_removed > 0 {
                        log::info!(
                            "[Sweeper] Removed {} sessions, {} orphan directories",
                            stats.sessions_removed,
                            stats.orphans_removed
                        );
                    }
                }
            }
        }
    }

    /// One full cycle: store pass then filesystem pass.
    pub async fn sweep_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        self.store_pass(&mut stats).await;
        self.filesystem_pass(&mut stats).await;
        stats
    }

    async fn store_pass(&self, stats: &mut SweepStats) {
        let cutoff = now_millis().saturating_sub(self.session_retention.as_millis() as u64);
        let candidates = match self.store.list_terminal_older_than(cutoff) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("[Sweeper] Store pass skipped: {}", e);
                return;
            }
        };

        for session in candidates {
            if let Some(dir) = guarded_session_dir(&self.sessions_root(), &session.id) {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!(
                            "[Sweeper] Failed to remove directory for {}: {}",
                            session.id,
                            e
                        );
                        continue;
                    }
                }
            }
            match self.store.delete_session(&session.id) {
                Ok(()) => {
                    stats.sessions_removed += 1;
                    self.metrics.sweeper_deletions.inc();
                    self.emitter.emit_session(SessionEvent::Swept {
                        session_id: session.id.clone(),
                        timestamp: now_millis(),
                    });
                }
                Err(e) => log::warn!("[Sweeper] Failed to delete session {}: {}", session.id, e),
            }
        }
    }

    async fn filesystem_pass(&self, stats: &mut SweepStats) {
        let root = self.sessions_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            // Nothing published yet.
            Err(_) => return,
        };

        let cutoff = SystemTime::now()
            .checked_sub(self.file_retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_valid_id(&name) {
                // Traversal guard: never touch names outside the grammar.
                log::warn!("[Sweeper] Skipping suspicious directory name {:?}", name);
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let old_enough = metadata
                .modified()
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }
            match self.store.get_session(&name) {
                Ok(None) => {}
                // Known to the store (store pass owns it) or unreadable: skip.
                _ => continue,
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    stats.orphans_removed += 1;
                    self.metrics.sweeper_deletions.inc();
                    log::info!("[Sweeper] Removed orphan directory {}", name);
                }
                Err(e) => log::warn!("[Sweeper] Failed to remove orphan {}: {}", name, e),
            }
        }
    }
}

/// Resolves a session directory strictly under the sessions root.
fn guarded_session_dir(root: &std::path::Path, id: &str) -> Option<PathBuf> {
    if !is_valid_id(id) {
        return None;
    }
    Some(root.join(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::session::{Profile, Reason, Session, SessionState};
    use crate::store::MemoryStore;

    fn sweeper_with(
        store: Arc<dyn SessionStore>,
        root: &std::path::Path,
        session_retention: Duration,
        file_retention: Duration,
    ) -> Sweeper {
        Sweeper::new(
            store,
            root.to_path_buf(),
            Duration::from_secs(300),
            session_retention,
            file_retention,
            Arc::new(Metrics::new()),
            Arc::new(NoopEventEmitter),
        )
    }

    fn terminal_session(id: &str, updated_at: u64) -> Session {
        let mut s = Session::new(id.into(), "ref".into(), Profile::default(), None);
        s.transition(SessionState::Failed, Reason::Stall).unwrap();
        s.updated_at = updated_at;
        s
    }

    fn make_session_dir(root: &std::path::Path, id: &str) {
        let dir = root.join("sessions").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.m3u8"), "#EXTM3U\n").unwrap();
    }

    #[tokio::test]
    async fn store_pass_removes_aged_terminal_sessions_and_dirs() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        store.put_session(&terminal_session("olddead", 1_000)).unwrap();
        make_session_dir(root.path(), "olddead");

        let sweeper = sweeper_with(
            Arc::clone(&store),
            root.path(),
            Duration::from_secs(0),
            Duration::from_secs(3600),
        );
        let stats = sweeper.sweep_once().await;

        assert_eq!(stats.sessions_removed, 1);
        assert!(store.get_session("olddead").unwrap().is_none());
        assert!(!root.path().join("sessions/olddead").exists());
    }

    #[tokio::test]
    async fn fresh_terminal_sessions_survive_the_store_pass() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        store
            .put_session(&terminal_session("recent", now_millis()))
            .unwrap();

        let sweeper = sweeper_with(
            Arc::clone(&store),
            root.path(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let stats = sweeper.sweep_once().await;
        assert_eq!(stats.sessions_removed, 0);
        assert!(store.get_session("recent").unwrap().is_some());
    }

    #[tokio::test]
    async fn filesystem_pass_removes_unknown_old_directories() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        make_session_dir(root.path(), "orphan1");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sweeper = sweeper_with(
            Arc::clone(&store),
            root.path(),
            Duration::from_secs(3600),
            Duration::from_millis(1),
        );
        let stats = sweeper.sweep_once().await;
        assert_eq!(stats.orphans_removed, 1);
        assert!(!root.path().join("sessions/orphan1").exists());
    }

    #[tokio::test]
    async fn directories_known_to_the_store_are_not_orphans() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let live = Session::new("live1".into(), "ref".into(), Profile::default(), None);
        store.put_session(&live).unwrap();
        make_session_dir(root.path(), "live1");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sweeper = sweeper_with(
            Arc::clone(&store),
            root.path(),
            Duration::from_secs(3600),
            Duration::from_millis(1),
        );
        let stats = sweeper.sweep_once().await;
        assert_eq!(stats.orphans_removed, 0);
        assert!(root.path().join("sessions/live1").exists());
    }

    #[tokio::test]
    async fn suspicious_names_are_never_deleted() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let weird = root.path().join("sessions").join("weird.name");
        std::fs::create_dir_all(&weird).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sweeper = sweeper_with(
            Arc::clone(&store),
            root.path(),
            Duration::from_secs(3600),
            Duration::from_millis(1),
        );
        let stats = sweeper.sweep_once().await;
        assert_eq!(stats.orphans_removed, 0);
        assert!(weird.exists());
    }

    #[tokio::test]
    async fn young_orphans_are_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        make_session_dir(root.path(), "young");

        let sweeper = sweeper_with(
            Arc::clone(&store),
            root.path(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let stats = sweeper.sweep_once().await;
        assert_eq!(stats.orphans_removed, 0);
        assert!(root.path().join("sessions/young").exists());
    }
}
