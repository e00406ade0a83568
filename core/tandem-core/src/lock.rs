//! Advisory cross-process lock around cache rebuilds.
//!
//! A single marker file in the notification directory means "a rebuild is in
//! progress somewhere". It only narrows the window in which two processes
//! rebuild at once; it never blocks anyone for longer than the caller's wait,
//! and callers proceed without it when the wait runs out. Rebuilds are
//! idempotent, so the worst case of losing the race is duplicated work.
//!
//! # Marker File
//!
//! Created with `create_new` so exactly one process wins. The body is
//! informational:
//!
//! ```json
//! { "session_id": "1700000000000", "pid": 4242, "created_ms": 1700000001234 }
//! ```
//!
//! # Stale Markers
//!
//! A process that crashes mid-rebuild leaves its marker behind. Markers older
//! than `stale_after_ms` (by `created_ms`, or by file mtime when the body is
//! missing or half-written) are removed and taken over.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{Result, SyncError};
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MarkerInfo {
    session_id: String,
    pid: u32,
    created_ms: u64,
}

/// How a [`LockCoordinator::with_lock`] body ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// This caller created the marker and held it for the body.
    Acquired,
    /// The marker stayed held for the whole wait; the body ran anyway.
    TimedOut,
    /// The marker could not be created (I/O error); the body ran anyway.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct LockCoordinator {
    path: PathBuf,
    owner: String,
    poll_min: Duration,
    poll_max: Duration,
    stale_after: Duration,
}

/// Holds the marker; removes it on drop if it is still ours.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    info: MarkerInfo,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Our marker may have been reclaimed as stale and replaced by another
        // holder; only remove it if the body still names us.
        if read_marker(&self.path).as_ref() != Some(&self.info) {
            debug!(path = %self.path.display(), "Lock marker no longer ours; leaving it");
            return;
        }
        if let Err(err) = fs_err::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "Failed to remove cache rebuild lock marker");
            }
        }
    }
}

impl LockCoordinator {
    pub fn new(path: impl Into<PathBuf>, owner: &SessionId, config: &LockConfig) -> Self {
        let poll_min = Duration::from_millis(config.poll_min_ms);
        let poll_max = Duration::from_millis(config.poll_max_ms.max(config.poll_min_ms));
        Self {
            path: path.into(),
            owner: owner.to_string(),
            poll_min,
            poll_max,
            stale_after: Duration::from_millis(config.stale_after_ms),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any process currently holds the marker.
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Creates the marker if nobody holds it (reclaiming a stale one first).
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        match self.create_marker() {
            Ok(guard) => Ok(Some(guard)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if !self.reclaim_if_stale() {
                    return Ok(None);
                }
                match self.create_marker() {
                    Ok(guard) => Ok(Some(guard)),
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
                    Err(err) => Err(SyncError::io("creating lock marker", err)),
                }
            }
            Err(err) => Err(SyncError::io("creating lock marker", err)),
        }
    }

    /// Polls with jitter until the marker is gone or `timeout` elapses.
    /// Returns `true` if the marker cleared.
    pub fn wait_for_release(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_held() || self.reclaim_if_stale() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.jitter().min(deadline - now));
        }
    }

    /// Runs `body` holding the marker if it can be had within `wait`, and
    /// without it otherwise.
    pub fn with_lock<T>(&self, wait: Duration, body: impl FnOnce() -> T) -> (T, LockOutcome) {
        let deadline = Instant::now() + wait;
        loop {
            match self.try_acquire() {
                Ok(Some(guard)) => {
                    let value = body();
                    drop(guard);
                    return (value, LockOutcome::Acquired);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Cache rebuild lock unavailable; proceeding without it");
                    return (body(), LockOutcome::Unavailable);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    path = %self.path.display(),
                    wait_ms = wait.as_millis() as u64,
                    "Timed out waiting for cache rebuild lock; proceeding without it"
                );
                return (body(), LockOutcome::TimedOut);
            }
            thread::sleep(self.jitter().min(deadline - now));
        }
    }

    fn create_marker(&self) -> std::io::Result<LockGuard> {
        use std::io::Write;

        let info = MarkerInfo {
            session_id: self.owner.clone(),
            pid: std::process::id(),
            created_ms: crate::now_ms(),
        };
        let body = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        let mut file = fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        if let Err(err) = file.write_all(&body).and_then(|()| file.sync_all()) {
            let _ = fs_err::remove_file(&self.path);
            return Err(err);
        }
        Ok(LockGuard {
            path: self.path.clone(),
            info,
        })
    }

    fn reclaim_if_stale(&self) -> bool {
        let Some(age) = marker_age(&self.path) else {
            return false;
        };
        if age <= self.stale_after {
            return false;
        }

        warn!(
            path = %self.path.display(),
            age_ms = age.as_millis() as u64,
            holder = ?read_marker(&self.path).map(|info| info.session_id),
            "Recovering stale cache rebuild lock marker"
        );
        match fs_err::remove_file(&self.path) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => {
                warn!(error = %err, "Failed to remove stale lock marker");
                false
            }
        }
    }

    fn jitter(&self) -> Duration {
        if self.poll_max <= self.poll_min {
            return self.poll_min;
        }
        let min = self.poll_min.as_millis() as u64;
        let max = self.poll_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

fn read_marker(path: &Path) -> Option<MarkerInfo> {
    let content = fs_err::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn marker_age(path: &Path) -> Option<Duration> {
    let now_ms = crate::now_ms();
    if let Some(info) = read_marker(path) {
        return Some(Duration::from_millis(now_ms.saturating_sub(info.created_ms)));
    }
    // No readable body (mid-write or foreign format): fall back to mtime.
    let modified = fs_err::metadata(path).ok()?.modified().ok()?;
    let modified_ms = modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64;
    Some(Duration::from_millis(now_ms.saturating_sub(modified_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(dir: &Path, owner: &str) -> LockCoordinator {
        let config = LockConfig {
            timeout_ms: 500,
            poll_min_ms: 5,
            poll_max_ms: 15,
            stale_after_ms: 60_000,
        };
        LockCoordinator::new(
            dir.join("cache_rebuild.lock"),
            &SessionId::new(owner).unwrap(),
            &config,
        )
    }

    #[test]
    fn test_acquire_and_release_marker() {
        let temp = tempfile::tempdir().unwrap();
        let lock = coordinator(temp.path(), "1");

        let guard = lock.try_acquire().unwrap().expect("first acquire");
        assert!(lock.is_held());
        let info = read_marker(lock.path()).expect("marker body");
        assert_eq!(info.session_id, "1");
        assert_eq!(info.pid, std::process::id());

        assert!(lock.try_acquire().unwrap().is_none(), "second acquire must fail");
        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_wait_for_release_is_bounded_when_marker_never_clears() {
        let temp = tempfile::tempdir().unwrap();
        let lock = coordinator(temp.path(), "1");
        let _held = coordinator(temp.path(), "2").try_acquire().unwrap().unwrap();

        let timeout = Duration::from_millis(150);
        let started = Instant::now();
        assert!(!lock.wait_for_release(timeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn test_with_lock_runs_body_after_timeout() {
        let temp = tempfile::tempdir().unwrap();
        let lock = coordinator(temp.path(), "1");
        let _held = coordinator(temp.path(), "2").try_acquire().unwrap().unwrap();

        let started = Instant::now();
        let (value, outcome) = lock.with_lock(Duration::from_millis(100), || 7);
        assert_eq!(value, 7);
        assert_eq!(outcome, LockOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(lock.is_held(), "other holder's marker must survive");
    }

    #[test]
    fn test_with_lock_holds_marker_during_body() {
        let temp = tempfile::tempdir().unwrap();
        let lock = coordinator(temp.path(), "1");
        let (held_inside, outcome) = lock.with_lock(Duration::from_millis(100), || lock.is_held());
        assert!(held_inside);
        assert_eq!(outcome, LockOutcome::Acquired);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_stale_marker_is_reclaimed() {
        let temp = tempfile::tempdir().unwrap();
        let lock = coordinator(temp.path(), "1");
        let stale = MarkerInfo {
            session_id: "999".to_string(),
            pid: 1,
            created_ms: crate::now_ms() - 10 * 60 * 1000,
        };
        fs_err::write(lock.path(), serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = lock.try_acquire().unwrap().expect("stale marker reclaimed");
        assert_eq!(read_marker(lock.path()).unwrap().session_id, "1");
        drop(guard);
    }

    #[test]
    fn test_guard_leaves_replaced_marker_alone() {
        let temp = tempfile::tempdir().unwrap();
        let lock = coordinator(temp.path(), "1");
        let guard = lock.try_acquire().unwrap().unwrap();

        let replacement = MarkerInfo {
            session_id: "2".to_string(),
            pid: 2,
            created_ms: crate::now_ms(),
        };
        fs_err::write(lock.path(), serde_json::to_string(&replacement).unwrap()).unwrap();
        drop(guard);
        assert!(lock.is_held());
    }
}
