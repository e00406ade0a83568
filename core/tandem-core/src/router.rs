//! Routes each logical operation to the right database handle.
//!
//! - Writes get a fresh primary connection per operation
//!   (connect → operate → close, never pooled). Releasing a write handle
//!   announces the change to every other process (see [`crate::publish`]).
//! - Reads go to the in-process replica when its connection is free, otherwise
//!   to a read-only primary connection so they never take the writer's locks.
//!   A read never waits for a rebuild, and a rebuild never waits for a read.
//!
//! Opening the primary retries while SQLite reports the file busy or locked,
//! surfacing [`SyncStatus::Busy`] to the observer between attempts. Any other
//! open error is returned immediately.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::cache::ReplicaHandle;
use crate::config::PrimaryConfig;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::events::{SyncObserver, SyncStatus};

// Pragma contract for the primary. Existing data files were written under
// these settings; keep them verbatim.
pub const JOURNAL_MODE: &str = "WAL";
pub const SYNCHRONOUS: &str = "NORMAL";
pub const CACHE_SIZE_PAGES: i64 = 10_000;
pub const TEMP_STORE: &str = "MEMORY";
pub const MMAP_SIZE_BYTES: i64 = 268_435_456;
pub const BUSY_TIMEOUT_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Decrements the process-wide count of open primary handles when dropped.
struct OpenSlot<'a>(&'a AtomicUsize);

impl<'a> OpenSlot<'a> {
    fn claim(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for OpenSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

enum HandleInner<'a> {
    Primary {
        conn: Connection,
        mode: AccessMode,
        slot: OpenSlot<'a>,
    },
    Cache(ReplicaHandle),
}

/// A connection checked out from the router. Give it back with
/// [`ConnectionRouter::release`] (or [`ConnectionRouter::discard`]).
pub struct DbHandle<'a> {
    inner: HandleInner<'a>,
}

impl DbHandle<'_> {
    pub fn mode(&self) -> AccessMode {
        match &self.inner {
            HandleInner::Primary { mode, .. } => *mode,
            HandleInner::Cache(_) => AccessMode::Read,
        }
    }

    /// True when this is the replica's shared handle.
    pub fn is_cache(&self) -> bool {
        matches!(self.inner, HandleInner::Cache(_))
    }
}

impl Deref for DbHandle<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.inner {
            HandleInner::Primary { conn, .. } => conn,
            HandleInner::Cache(replica) => &**replica,
        }
    }
}

impl DerefMut for DbHandle<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.inner {
            HandleInner::Primary { conn, .. } => conn,
            HandleInner::Cache(replica) => &mut **replica,
        }
    }
}

pub struct ConnectionRouter<'ctx> {
    ctx: &'ctx SyncContext,
}

impl<'ctx> ConnectionRouter<'ctx> {
    pub(crate) fn new(ctx: &'ctx SyncContext) -> Self {
        Self { ctx }
    }

    pub fn acquire(&self, mode: AccessMode) -> Result<DbHandle<'ctx>> {
        match mode {
            AccessMode::Write => self.open_primary(AccessMode::Write),
            AccessMode::Read => match self.ctx.cache().reader() {
                Some(replica) => Ok(DbHandle {
                    inner: HandleInner::Cache(replica),
                }),
                None => self.open_primary(AccessMode::Read),
            },
        }
    }

    /// A read-only primary handle, bypassing the replica (used to rebuild it).
    pub fn acquire_primary_read(&self) -> Result<DbHandle<'ctx>> {
        self.open_primary(AccessMode::Read)
    }

    /// Returns a handle. Primary handles are closed and their side files
    /// cleaned up; a write handle then publishes the change. Publishing is
    /// best-effort and never fails the release.
    pub fn release(&self, handle: DbHandle<'ctx>) -> Result<()> {
        let (conn, mode, slot) = match handle.inner {
            HandleInner::Cache(replica) => {
                drop(replica);
                return Ok(());
            }
            HandleInner::Primary { conn, mode, slot } => (conn, mode, slot),
        };

        let closed = self.close_primary(conn, slot);

        if mode == AccessMode::Write {
            if let Err(err) = self.ctx.publish_change() {
                warn!(
                    session_id = %self.ctx.session(),
                    error = %err,
                    "Failed to publish change; other processes will catch up on their next write"
                );
            }
        }

        closed
    }

    /// Closes a handle without publishing. Use when the operation did not
    /// commit.
    pub fn discard(&self, handle: DbHandle<'ctx>) {
        if let HandleInner::Primary { conn, slot, .. } = handle.inner {
            if let Err(err) = self.close_primary(conn, slot) {
                warn!(error = %err, "Failed to close discarded primary connection");
            }
        }
    }

    /// One logical write: acquire, run `op`, release (which publishes).
    /// If `op` fails nothing is published.
    pub fn with_write<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut handle = self.acquire(AccessMode::Write)?;
        match op(&mut handle) {
            Ok(value) => {
                self.release(handle)?;
                Ok(value)
            }
            Err(err) => {
                self.discard(handle);
                Err(err)
            }
        }
    }

    /// One logical read, served from the replica when available.
    pub fn with_read<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let handle = self.acquire(AccessMode::Read)?;
        let result = op(&handle);
        self.release(handle)?;
        result
    }

    fn open_primary(&self, mode: AccessMode) -> Result<DbHandle<'ctx>> {
        let path = self.ctx.paths().primary();
        let conn = retry_on_locked(
            &self.ctx.config().primary,
            self.ctx.observer(),
            path,
            || open_connection(path, mode),
        )?;
        Ok(DbHandle {
            inner: HandleInner::Primary {
                conn,
                mode,
                slot: OpenSlot::claim(self.ctx.open_primaries_counter()),
            },
        })
    }

    fn close_primary(&self, conn: Connection, slot: OpenSlot<'_>) -> Result<()> {
        let result = conn.close().map_err(|(_conn, err)| {
            SyncError::sqlite("closing primary connection", err)
        });
        drop(slot);
        self.cleanup_side_files();
        result
    }

    /// Best-effort removal of `-wal`/`-shm` left behind after close.
    ///
    /// SQLite removes them itself when the last connection closes, so leftovers
    /// usually mean another connection, possibly in another process, still
    /// uses them. They are only unlinked while this process holds the primary
    /// exclusively, no primary handle is open here, and the WAL has no frames.
    fn cleanup_side_files(&self) {
        let config = &self.ctx.config().primary;
        if !config.remove_side_files {
            return;
        }
        if self.ctx.open_primaries() > 0 {
            debug!("Primary still open in this process; leaving side files");
            return;
        }

        let paths = self.ctx.paths();
        let wal = paths.wal();
        let shm = paths.shm();
        if !wal.exists() && !shm.exists() {
            return;
        }
        if let Ok(meta) = fs_err::metadata(&wal) {
            if meta.len() > 0 {
                debug!(path = %wal.display(), "WAL still holds frames; leaving side files");
                return;
            }
        }

        let exclusive = match claim_exclusive(paths.primary()) {
            Ok(conn) => conn,
            Err(err) => {
                debug!(error = %err, "Side files held by another connection; leaving them");
                return;
            }
        };
        if remove_with_retry(&wal, config) {
            remove_with_retry(&shm, config);
        }
        release_exclusive(exclusive);
    }
}

/// Opens the primary and takes an exclusive lock on it without waiting.
/// Fails while any other connection, in any process, has the database open.
fn claim_exclusive(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )
    .map_err(|err| SyncError::sqlite("opening primary for side file cleanup", err))?;
    conn.busy_timeout(Duration::ZERO)
        .map_err(|err| SyncError::sqlite("clearing busy_timeout", err))?;
    conn.execute_batch("PRAGMA locking_mode=EXCLUSIVE; BEGIN EXCLUSIVE;")
        .map_err(|err| SyncError::sqlite("locking primary exclusively", err))?;
    Ok(conn)
}

fn release_exclusive(conn: Connection) {
    if let Err(err) = conn.execute_batch("ROLLBACK;") {
        debug!(error = %err, "Rolling back side file cleanup lock");
    }
    if let Err((_conn, err)) = conn.close() {
        warn!(error = %err, "Failed to close side file cleanup connection");
    }
}

fn open_connection(path: &Path, mode: AccessMode) -> Result<Connection> {
    let flags = match mode {
        AccessMode::Write => {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX
        }
        AccessMode::Read => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    };

    let conn = Connection::open_with_flags(path, flags)
        .map_err(|err| SyncError::sqlite("opening primary database", err))?;

    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
        .map_err(|err| SyncError::sqlite("setting busy_timeout", err))?;
    if mode == AccessMode::Write {
        conn.pragma_update(None, "journal_mode", JOURNAL_MODE)
            .map_err(|err| SyncError::sqlite("enabling WAL", err))?;
        conn.pragma_update(None, "synchronous", SYNCHRONOUS)
            .map_err(|err| SyncError::sqlite("setting synchronous", err))?;
    }
    conn.pragma_update(None, "cache_size", CACHE_SIZE_PAGES)
        .map_err(|err| SyncError::sqlite("setting cache_size", err))?;
    conn.pragma_update(None, "temp_store", TEMP_STORE)
        .map_err(|err| SyncError::sqlite("setting temp_store", err))?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)
        .map_err(|err| SyncError::sqlite("setting mmap_size", err))?;

    Ok(conn)
}

/// Runs `open` until it succeeds, fails with a non-lock error, or the attempt
/// budget runs out (then [`SyncError::DatabaseBusy`]).
pub(crate) fn retry_on_locked<T>(
    config: &PrimaryConfig,
    observer: &dyn SyncObserver,
    path: &Path,
    mut open: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = config.open_attempts.max(1);
    let delay = Duration::from_millis(config.open_retry_delay_ms);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match open() {
            Ok(value) => {
                if attempt > 1 {
                    observer.on_status(SyncStatus::Ready);
                }
                return Ok(value);
            }
            Err(err) if err.is_locked() && attempt < max_attempts => {
                warn!(
                    path = %path.display(),
                    attempt,
                    max_attempts,
                    error = %err,
                    "Database busy, waiting"
                );
                observer.on_status(SyncStatus::Busy {
                    attempt,
                    max_attempts,
                });
                thread::sleep(delay);
            }
            Err(err) if err.is_locked() => {
                if attempt > 1 {
                    observer.on_status(SyncStatus::Ready);
                }
                return Err(SyncError::DatabaseBusy {
                    path: path.to_path_buf(),
                    attempts: max_attempts,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

fn remove_with_retry(path: &Path, config: &PrimaryConfig) -> bool {
    let attempts = config.side_file_attempts.max(1);
    let delay = Duration::from_millis(config.side_file_retry_delay_ms);

    for attempt in 1..=attempts {
        match fs_err::remove_file(path) {
            Ok(()) => return true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return true,
            Err(err) if attempt < attempts => {
                debug!(path = %path.display(), attempt, error = %err, "Side file busy; retrying");
                thread::sleep(delay);
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Could not remove side file; another process may still hold it"
                );
            }
        }
    }
    false
}
