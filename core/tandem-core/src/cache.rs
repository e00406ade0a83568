//! In-process read replica of the primary database.
//!
//! All read traffic is served from an in-memory SQLite connection that is
//! rebuilt wholesale from the primary: a new replica is built off to the side
//! and its pointer swapped in, so a rebuild never waits for readers and
//! readers never wait for a rebuild. What goes into the replica is business
//! logic and comes from a [`CacheBuilder`].
//!
//! ```text
//! reader                           rebuild
//!   |                                |
//!   +-- load current replica         +-- fill fresh in-memory connection
//!   +-- check its connection out     +-- store new replica pointer
//!   |   (None if already out)        |
//!   +-- drop handle: connection      +-- old replica freed once its
//!       goes back to its replica         last handle is dropped
//! ```
//!
//! Rebuilds are mutually exclusive within a process (a writer's own publish and
//! the watcher can both trigger one). Cross-process exclusion is the job of
//! [`crate::lock`], and only advisory.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use rusqlite::backup::Backup;
use rusqlite::Connection;

use crate::error::{Result, SyncError};

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 256;
const BACKUP_PAUSE: Duration = Duration::from_millis(5);

/// Fills a fresh, empty replica from the primary. Must be idempotent: the
/// result may only depend on the primary's current contents.
pub trait CacheBuilder: Send + Sync {
    fn rebuild(&self, primary: &Connection, replica: &mut Connection) -> Result<()>;
}

impl<F> CacheBuilder for F
where
    F: Fn(&Connection, &mut Connection) -> Result<()> + Send + Sync,
{
    fn rebuild(&self, primary: &Connection, replica: &mut Connection) -> Result<()> {
        self(primary, replica)
    }
}

/// Copies the entire primary into the replica with SQLite's online backup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotBuilder;

impl CacheBuilder for SnapshotBuilder {
    fn rebuild(&self, primary: &Connection, replica: &mut Connection) -> Result<()> {
        let backup = Backup::new(primary, replica)
            .map_err(|err| SyncError::sqlite("starting cache snapshot", err))?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)
            .map_err(|err| SyncError::sqlite("copying cache snapshot", err))
    }
}

/// One built generation of the replica. Its connection sits in the slot
/// while nobody is reading from it.
struct Replica {
    generation: u64,
    slot: Mutex<Option<Connection>>,
}

impl Replica {
    fn slot(&self) -> MutexGuard<'_, Option<Connection>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The replica's connection, checked out for one read. Dropping it puts the
/// connection back into the generation it came from.
pub struct ReplicaHandle {
    replica: Arc<Replica>,
    conn: Option<Connection>,
}

impl ReplicaHandle {
    /// Generation of the replica this handle reads from.
    pub fn generation(&self) -> u64 {
        self.replica.generation
    }
}

impl Deref for ReplicaHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable_conn(),
        }
    }
}

impl DerefMut for ReplicaHandle {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable_conn(),
        }
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            *self.replica.slot() = Some(conn);
        }
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

// `conn` is only `None` inside `Drop`.
fn unreachable_conn() -> ! {
    panic!("replica handle used after its connection was returned")
}

pub struct CacheStore {
    current: ArcSwapOption<Replica>,
    rebuild_gate: Mutex<()>,
    generation: AtomicU64,
    builder: Box<dyn CacheBuilder>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("initialized", &self.is_initialized())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(builder: Box<dyn CacheBuilder>) -> Result<Self> {
        Ok(Self {
            current: ArcSwapOption::from(None),
            rebuild_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            builder,
        })
    }

    /// True once the first rebuild has completed.
    pub fn is_initialized(&self) -> bool {
        self.current.load().is_some()
    }

    /// Number of completed rebuilds.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Checks out the replica's connection. `None` before the first rebuild,
    /// or while another handle on the current replica is still out; callers
    /// then read from the primary instead of waiting.
    pub fn reader(&self) -> Option<ReplicaHandle> {
        let replica = self.current.load_full()?;
        let conn = replica.slot().take()?;
        Some(ReplicaHandle {
            replica,
            conn: Some(conn),
        })
    }

    /// Serializes rebuilds within this process. Hold it across the whole
    /// "wait for lock marker, read primary, swap" sequence.
    pub(crate) fn rebuild_gate(&self) -> MutexGuard<'_, ()> {
        self.rebuild_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds a new replica from `primary` and swaps it in. Callers hold
    /// [`Self::rebuild_gate`]. Returns the new generation.
    pub(crate) fn reload(&self, primary: &Connection) -> Result<u64> {
        let mut fresh = Connection::open_in_memory()
            .map_err(|err| SyncError::sqlite("opening cache replica", err))?;
        self.builder.rebuild(primary, &mut fresh)?;

        let generation = self.generation() + 1;
        self.current.store(Some(Arc::new(Replica {
            generation,
            slot: Mutex::new(Some(fresh)),
        })));
        self.generation.store(generation, Ordering::Release);
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary_with_rows(rows: &[&str]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE clients (name TEXT NOT NULL);")
            .unwrap();
        for row in rows {
            conn.execute("INSERT INTO clients (name) VALUES (?1)", [row])
                .unwrap();
        }
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_reader_is_unavailable_before_first_rebuild() {
        let cache = CacheStore::new(Box::new(SnapshotBuilder)).unwrap();
        assert!(cache.reader().is_none());
        assert_eq!(cache.generation(), 0);
    }

    #[test]
    fn test_reload_does_not_wait_for_checked_out_reader() {
        let cache = CacheStore::new(Box::new(SnapshotBuilder)).unwrap();
        let primary = primary_with_rows(&["acme"]);
        let _gate = cache.rebuild_gate();
        cache.reload(&primary).unwrap();

        let old = cache.reader().expect("replica available");
        assert!(cache.reader().is_none(), "connection is checked out");

        primary
            .execute("INSERT INTO clients (name) VALUES ('globex')", [])
            .unwrap();
        assert_eq!(cache.reload(&primary).unwrap(), 2);

        let new = cache.reader().expect("new replica has its own connection");
        assert_eq!(old.generation(), 1);
        assert_eq!(new.generation(), 2);
        assert_eq!(count(&old), 1);
        assert_eq!(count(&new), 2);
    }

    #[test]
    fn test_dropped_handle_returns_connection() {
        let cache = CacheStore::new(Box::new(SnapshotBuilder)).unwrap();
        let _gate = cache.rebuild_gate();
        cache.reload(&primary_with_rows(&["acme"])).unwrap();

        drop(cache.reader().unwrap());
        assert_eq!(count(&cache.reader().unwrap()), 1);
    }

    #[test]
    fn test_snapshot_rebuild_replaces_replica_wholesale() {
        let cache = CacheStore::new(Box::new(SnapshotBuilder)).unwrap();
        let primary = primary_with_rows(&["acme"]);

        let _gate = cache.rebuild_gate();
        assert_eq!(cache.reload(&primary).unwrap(), 1);
        assert_eq!(count(&cache.reader().unwrap()), 1);

        primary
            .execute("INSERT INTO clients (name) VALUES ('globex')", [])
            .unwrap();
        assert_eq!(count(&cache.reader().unwrap()), 1, "replica is a snapshot");

        assert_eq!(cache.reload(&primary).unwrap(), 2);
        assert_eq!(count(&cache.reader().unwrap()), 2);
    }

    #[test]
    fn test_closure_builder_controls_replica_contents() {
        let builder = |primary: &Connection, replica: &mut Connection| -> Result<()> {
            let total: i64 = primary
                .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))
                .map_err(|err| SyncError::sqlite("counting", err))?;
            replica
                .execute_batch(&format!(
                    "CREATE TABLE summary (total INTEGER); INSERT INTO summary VALUES ({total});"
                ))
                .map_err(|err| SyncError::sqlite("writing summary", err))
        };
        let cache = CacheStore::new(Box::new(builder)).unwrap();
        let primary = primary_with_rows(&["a", "b", "c"]);

        let _gate = cache.rebuild_gate();
        cache.reload(&primary).unwrap();
        let total: i64 = cache
            .reader()
            .unwrap()
            .query_row("SELECT total FROM summary", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_replica() {
        let cache = CacheStore::new(Box::new(
            |primary: &Connection, replica: &mut Connection| -> Result<()> {
                let ok: bool = primary
                    .query_row("SELECT COUNT(*) < 2 FROM clients", [], |row| row.get(0))
                    .map_err(|err| SyncError::sqlite("checking", err))?;
                if !ok {
                    return Err(SyncError::Rebuild("too many clients".to_string()));
                }
                SnapshotBuilder.rebuild(primary, replica)
            },
        ))
        .unwrap();
        let primary = primary_with_rows(&["only"]);
        let _gate = cache.rebuild_gate();
        cache.reload(&primary).unwrap();

        primary
            .execute("INSERT INTO clients (name) VALUES ('second')", [])
            .unwrap();
        assert!(cache.reload(&primary).is_err());
        assert_eq!(cache.generation(), 1);
        assert_eq!(count(&cache.reader().unwrap()), 1);
    }
}
