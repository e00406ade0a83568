//! Tandem Core: keeps several processes coherent around one SQLite file.
//!
//! Every process writes straight to the shared primary database and reads
//! from its own in-memory replica. After each committed write the writer drops
//! a small change signal into a shared directory; every other process's
//! watcher picks it up, rebuilds its replica and tells the UI that data
//! changed.
//!
//! ```text
//!   process A                              process B
//!   ─────────                              ─────────
//!   router.with_write(..) ──► app.db ◄──── read-only rebuild
//!        │                                      ▲
//!        └─► temp/db_change_A_<ts>.tmp ──► watcher tick
//!                                               │
//!                                     on_data_changed([A])
//! ```
//!
//! Start with [`SyncContext::builder`]. Writes go through
//! [`SyncContext::router`]; foreign changes arrive through
//! [`SyncContext::watcher`].

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod lock;
pub mod paths;
pub mod publish;
pub mod queue;
pub mod router;
pub mod session;
pub mod signal;
pub mod signature;
pub mod watcher;

pub use cache::{CacheBuilder, CacheStore, ReplicaHandle, SnapshotBuilder};
pub use config::{load_config, SyncConfig};
pub use context::{SyncContext, SyncContextBuilder};
pub use error::{Result, SyncError};
pub use events::{ForeignChange, NoopObserver, SyncObserver, SyncStatus};
pub use lock::{LockCoordinator, LockOutcome};
pub use paths::SyncPaths;
pub use publish::PublishOutcome;
pub use queue::{FileSignalQueue, MemorySignalQueue, SignalQueue};
pub use router::{AccessMode, ConnectionRouter, DbHandle};
pub use session::SessionId;
pub use signal::ChangeSignal;
pub use signature::Signature;
pub use watcher::{ChangeWatcher, TickReport, WatcherHandle};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
