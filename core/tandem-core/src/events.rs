//! Outbound notifications for the UI layer.

use serde::Serialize;

use crate::session::SessionId;
use crate::signature::Signature;

/// A change another session made that this process has now applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignChange {
    pub origin: SessionId,
    pub timestamp_ms: u64,
    pub signature: Signature,
}

/// Transient status worth showing to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    /// The primary database is locked by someone else; waiting to retry.
    Busy { attempt: u32, max_attempts: u32 },
    /// A previously reported busy wait is over.
    Ready,
}

/// Event sink. Implementations must be cheap and non-blocking: both methods
/// are called on the thread doing the work (a writer or the watcher).
pub trait SyncObserver: Send + Sync {
    /// Fired once per watcher tick that applied at least one foreign change,
    /// after the cache has been rebuilt. Never fired for this session's own
    /// writes.
    fn on_data_changed(&self, _changes: &[ForeignChange]) {}

    fn on_status(&self, _status: SyncStatus) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}
