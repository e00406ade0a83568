//! Per-process coordination state.
//!
//! One [`SyncContext`] per process (or per simulated process in tests) owns
//! the session id, the replica, the signal queue, the rebuild lock and the
//! last-seen table. Share it across threads behind an `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheBuilder, CacheStore, SnapshotBuilder};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{NoopObserver, SyncObserver};
use crate::lock::{LockCoordinator, LockOutcome};
use crate::paths::SyncPaths;
use crate::publish::{self, PublishOutcome};
use crate::queue::{FileSignalQueue, SignalQueue};
use crate::router::ConnectionRouter;
use crate::session::SessionId;
use crate::signature::Signature;
use crate::watcher::ChangeWatcher;

pub struct SyncContext {
    session: SessionId,
    paths: SyncPaths,
    config: SyncConfig,
    cache: CacheStore,
    queue: Arc<dyn SignalQueue>,
    lock: LockCoordinator,
    observer: Arc<dyn SyncObserver>,
    last_seen: Mutex<HashMap<SessionId, Signature>>,
    open_primaries: AtomicUsize,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("session", &self.session)
            .field("paths", &self.paths)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    pub fn builder(db_path: impl Into<PathBuf>) -> SyncContextBuilder {
        SyncContextBuilder::new(db_path)
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn paths(&self) -> &SyncPaths {
        &self.paths
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &dyn SignalQueue {
        self.queue.as_ref()
    }

    pub fn lock(&self) -> &LockCoordinator {
        &self.lock
    }

    pub fn observer(&self) -> &dyn SyncObserver {
        self.observer.as_ref()
    }

    pub fn router(&self) -> ConnectionRouter<'_> {
        ConnectionRouter::new(self)
    }

    /// Signals a committed write and refreshes this process's replica.
    /// Called by the router on every write release.
    pub fn publish_change(&self) -> Result<PublishOutcome> {
        publish::publish_change(self)
    }

    /// Rebuilds the replica from the primary, waiting up to the lock timeout
    /// for any other rebuild to finish first. Returns the new generation.
    pub fn rebuild_cache(&self) -> Result<u64> {
        self.rebuild_cache_within(self.config.lock_timeout()).0
    }

    /// Takes the in-process gate before the file lock, so a process never
    /// waits on a marker it created itself.
    pub(crate) fn rebuild_cache_within(&self, wait: Duration) -> (Result<u64>, LockOutcome) {
        let _gate = self.cache.rebuild_gate();
        let (result, outcome) = self.lock.with_lock(wait, || {
            let router = self.router();
            let handle = router.acquire_primary_read()?;
            let result = self.cache.reload(&handle);
            if let Err(err) = router.release(handle) {
                warn!(error = %err, "Failed to close primary after cache rebuild");
            }
            result
        });
        if let Ok(generation) = &result {
            debug!(generation, lock = ?outcome, "Cache rebuilt");
        }
        (result, outcome)
    }

    /// Signature last applied for `origin`, if any.
    pub fn last_seen(&self, origin: &SessionId) -> Option<Signature> {
        self.last_seen_table().get(origin).cloned()
    }

    pub(crate) fn last_seen_snapshot(&self) -> HashMap<SessionId, Signature> {
        self.last_seen_table().clone()
    }

    pub(crate) fn record_seen(&self, applied: impl IntoIterator<Item = (SessionId, Signature)>) {
        self.last_seen_table().extend(applied);
    }

    fn last_seen_table(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Signature>> {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Primary handles currently open in this process.
    pub fn open_primaries(&self) -> usize {
        self.open_primaries.load(Ordering::Acquire)
    }

    pub(crate) fn open_primaries_counter(&self) -> &AtomicUsize {
        &self.open_primaries
    }

    /// Watcher bound to this context. Call [`ChangeWatcher::start`] to run it
    /// in the background or [`ChangeWatcher::tick`] to scan once.
    pub fn watcher(self: &Arc<Self>) -> ChangeWatcher {
        ChangeWatcher::new(Arc::clone(self))
    }
}

pub struct SyncContextBuilder {
    db_path: PathBuf,
    notify_dir: Option<PathBuf>,
    session: Option<SessionId>,
    config: Option<SyncConfig>,
    queue: Option<Arc<dyn SignalQueue>>,
    observer: Option<Arc<dyn SyncObserver>>,
    cache_builder: Option<Box<dyn CacheBuilder>>,
}

impl SyncContextBuilder {
    fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            notify_dir: None,
            session: None,
            config: None,
            queue: None,
            observer: None,
            cache_builder: None,
        }
    }

    /// Defaults to [`SessionId::generate`].
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to `<db dir>/temp`.
    pub fn notify_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.notify_dir = Some(dir.into());
        self
    }

    /// Defaults to a [`FileSignalQueue`] over the notification directory.
    pub fn queue(mut self, queue: Arc<dyn SignalQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Defaults to [`SnapshotBuilder`].
    pub fn cache_builder(mut self, builder: Box<dyn CacheBuilder>) -> Self {
        self.cache_builder = Some(builder);
        self
    }

    pub fn build(self) -> Result<SyncContext> {
        let mut paths = SyncPaths::for_database(self.db_path);
        if let Some(dir) = self.notify_dir {
            paths = paths.with_notify_dir(dir);
        }
        paths.ensure_dirs()?;

        let session = self.session.unwrap_or_else(SessionId::generate);
        let config = self.config.unwrap_or_default();
        let queue: Arc<dyn SignalQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(FileSignalQueue::new(paths.notify_dir())),
        };
        let lock = LockCoordinator::new(paths.lock_file(), &session, &config.lock);
        let builder: Box<dyn CacheBuilder> = match self.cache_builder {
            Some(builder) => builder,
            None => Box::new(SnapshotBuilder),
        };
        let cache = CacheStore::new(builder)?;

        info!(
            session_id = %session,
            db = %paths.primary().display(),
            notify_dir = %paths.notify_dir().display(),
            "Sync context ready"
        );

        Ok(SyncContext {
            session,
            paths,
            config,
            cache,
            queue,
            lock,
            observer: match self.observer {
                Some(observer) => observer,
                None => Arc::new(NoopObserver),
            },
            last_seen: Mutex::new(HashMap::new()),
            open_primaries: AtomicUsize::new(0),
        })
    }
}
