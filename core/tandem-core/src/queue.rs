//! The notification bus, as an unordered at-least-once queue.
//!
//! Publish and the watcher only see [`SignalQueue`]; the shared notification
//! directory is one implementation of it ([`FileSignalQueue`]).
//!
//! Semantics every implementation keeps:
//!
//! - `drain` returns every pending delivery without consuming it. Several
//!   processes may drain the same delivery before anyone acks it.
//! - `ack` removes a delivery. Acking something already removed is fine.
//! - `enqueue` never overwrites an existing delivery; on a key collision the
//!   timestamp is bumped by one millisecond and the write retried.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::signal::{self, ChangeSignal};

const ENQUEUE_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPayload {
    Signal(ChangeSignal),
    Malformed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-specific key (the file name for [`FileSignalQueue`]).
    pub key: String,
    pub payload: DeliveryPayload,
    /// When the delivery was last written, if known.
    pub modified_ms: Option<u64>,
}

impl Delivery {
    pub fn signal(&self) -> Option<&ChangeSignal> {
        match &self.payload {
            DeliveryPayload::Signal(signal) => Some(signal),
            DeliveryPayload::Malformed { .. } => None,
        }
    }

    /// Ordering key: signal timestamp, falling back to modification time.
    pub(crate) fn sort_key(&self) -> u64 {
        self.signal()
            .map(|signal| signal.timestamp_ms)
            .or(self.modified_ms)
            .unwrap_or(0)
    }
}

pub trait SignalQueue: Send + Sync {
    /// Durably stores `signal`, returning it as written (the timestamp may
    /// have been bumped to avoid a collision).
    fn enqueue(&self, signal: ChangeSignal) -> Result<ChangeSignal>;

    fn drain(&self) -> Result<Vec<Delivery>>;

    fn ack(&self, delivery: &Delivery) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem queue
// ─────────────────────────────────────────────────────────────────────────────

/// Queue backed by `db_change_*.tmp` files in a shared directory.
#[derive(Debug, Clone)]
pub struct FileSignalQueue {
    dir: PathBuf,
}

impl FileSignalQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_new(&self, signal: &ChangeSignal) -> std::io::Result<()> {
        let path = self.dir.join(signal.file_name());
        let mut file = fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(signal.body().as_bytes())?;
        file.sync_all()
    }

    fn read_delivery(&self, name: &str, path: &Path) -> Option<Delivery> {
        let modified_ms = fs_err::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|age| age.as_millis() as u64);

        let bytes = match fs_err::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Another watcher acked it between listing and reading.
                debug!(file = name, "Change signal vanished before read");
                return None;
            }
            Err(err) => {
                warn!(file = name, error = %err, "Failed to read change signal; skipping");
                return None;
            }
        };

        let payload = match String::from_utf8(bytes) {
            Ok(body) => match signal::parse(name, &body) {
                Ok(signal) => DeliveryPayload::Signal(signal),
                Err(reason) => DeliveryPayload::Malformed { reason },
            },
            Err(_) => DeliveryPayload::Malformed {
                reason: "body is not UTF-8".to_string(),
            },
        };

        Some(Delivery {
            key: name.to_string(),
            payload,
            modified_ms,
        })
    }
}

impl SignalQueue for FileSignalQueue {
    fn enqueue(&self, mut signal: ChangeSignal) -> Result<ChangeSignal> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_new(&signal) {
                Ok(()) => return Ok(signal),
                Err(err)
                    if err.kind() == std::io::ErrorKind::AlreadyExists
                        && attempt < ENQUEUE_ATTEMPTS =>
                {
                    signal.timestamp_ms += 1;
                }
                Err(err) => return Err(SyncError::io("writing change signal", err)),
            }
        }
    }

    fn drain(&self) -> Result<Vec<Delivery>> {
        let entries = match fs_err::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SyncError::io("listing notification directory", err)),
        };

        let mut deliveries = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(
                        dir = %self.dir.display(),
                        error = %err,
                        "Failed to read notification directory entry; skipping"
                    );
                    continue;
                }
            };
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !signal::is_signal_file_name(name) {
                continue;
            }
            if let Some(delivery) = self.read_delivery(name, &entry.path()) {
                deliveries.push(delivery);
            }
        }
        Ok(deliveries)
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        match fs_err::remove_file(self.dir.join(&delivery.key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::io("removing change signal", err)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process queue
// ─────────────────────────────────────────────────────────────────────────────

/// Queue held in memory. Share one instance between contexts through an `Arc`
/// to run several sessions against each other inside a single process.
#[derive(Debug, Default)]
pub struct MemorySignalQueue {
    entries: Mutex<BTreeMap<String, Delivery>>,
}

impl MemorySignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Delivery>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a raw body under `key`, parsed the same way a file would be.
    pub fn insert_raw(&self, key: &str, body: &str) {
        let payload = match signal::parse(key, body) {
            Ok(signal) => DeliveryPayload::Signal(signal),
            Err(reason) => DeliveryPayload::Malformed { reason },
        };
        let delivery = Delivery {
            key: key.to_string(),
            payload,
            modified_ms: Some(crate::now_ms()),
        };
        self.entries().insert(key.to_string(), delivery);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SignalQueue for MemorySignalQueue {
    fn enqueue(&self, mut signal: ChangeSignal) -> Result<ChangeSignal> {
        let mut entries = self.entries();
        while entries.contains_key(&signal.file_name()) {
            signal.timestamp_ms += 1;
        }
        let key = signal.file_name();
        entries.insert(
            key.clone(),
            Delivery {
                key,
                payload: DeliveryPayload::Signal(signal.clone()),
                modified_ms: Some(crate::now_ms()),
            },
        );
        Ok(signal)
    }

    fn drain(&self) -> Result<Vec<Delivery>> {
        Ok(self.entries().values().cloned().collect())
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.entries().remove(&delivery.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use crate::signature::Signature;
    use std::sync::Arc;

    fn signal(session: &str, ts: u64) -> ChangeSignal {
        ChangeSignal::new(
            SessionId::new(session).unwrap(),
            ts,
            Signature::parse(&"d".repeat(64)).unwrap(),
        )
    }

    #[test]
    fn test_file_queue_writes_wire_format() {
        let temp = tempfile::tempdir().unwrap();
        let queue = FileSignalQueue::new(temp.path());
        let written = queue.enqueue(signal("111", 5_000)).unwrap();

        let path = temp.path().join("db_change_111_5000.tmp");
        let body = fs_err::read_to_string(&path).unwrap();
        assert_eq!(body, written.body());
        assert!(!body.contains('\n'));
    }

    #[test]
    fn test_file_queue_bumps_timestamp_on_collision() {
        let temp = tempfile::tempdir().unwrap();
        let queue = FileSignalQueue::new(temp.path());
        let first = queue.enqueue(signal("111", 5_000)).unwrap();
        let second = queue.enqueue(signal("111", 5_000)).unwrap();
        assert_eq!(first.timestamp_ms, 5_000);
        assert_eq!(second.timestamp_ms, 5_001);
        assert_eq!(queue.drain().unwrap().len(), 2);
    }

    #[test]
    fn test_file_queue_drain_ignores_foreign_files_and_flags_malformed() {
        let temp = tempfile::tempdir().unwrap();
        let queue = FileSignalQueue::new(temp.path());
        queue.enqueue(signal("111", 1)).unwrap();
        fs_err::write(temp.path().join("cache_rebuild.lock"), "{}").unwrap();
        fs_err::write(temp.path().join("export_1.tmp"), "x").unwrap();
        fs_err::write(temp.path().join("db_change_222_2.tmp"), "222:3:zz").unwrap();

        let mut deliveries = queue.drain().unwrap();
        deliveries.sort_by_key(|d| d.key.clone());
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries[0].signal().is_some());
        assert!(matches!(
            deliveries[1].payload,
            DeliveryPayload::Malformed { .. }
        ));
    }

    #[test]
    fn test_file_queue_ack_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let queue = FileSignalQueue::new(temp.path());
        queue.enqueue(signal("111", 1)).unwrap();
        let delivery = queue.drain().unwrap().remove(0);
        queue.ack(&delivery).unwrap();
        queue.ack(&delivery).unwrap();
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn test_file_queue_drain_of_missing_dir_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let queue = FileSignalQueue::new(temp.path().join("nope"));
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn test_memory_queue_matches_file_semantics() {
        let queue = MemorySignalQueue::new();
        queue.enqueue(signal("111", 7)).unwrap();
        let bumped = queue.enqueue(signal("111", 7)).unwrap();
        assert_eq!(bumped.timestamp_ms, 8);
        queue.insert_raw("db_change_9_9.tmp", "garbage");

        let deliveries = queue.drain().unwrap();
        assert_eq!(deliveries.len(), 3);
        assert_eq!(queue.len(), 3, "drain must not consume");

        for delivery in &deliveries {
            queue.ack(delivery).unwrap();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_memory_queue_survives_poisoned_lock() {
        let queue = Arc::new(MemorySignalQueue::new());
        queue.enqueue(signal("111", 1)).unwrap();

        let poisoner = Arc::clone(&queue);
        let _ = std::thread::spawn(move || {
            let _held = poisoner.entries.lock().unwrap();
            panic!("poison the queue");
        })
        .join();

        assert!(queue.entries.is_poisoned());
        assert_eq!(queue.len(), 1);
        queue.insert_raw("db_change_9_9.tmp", "garbage");
        let deliveries = queue.drain().unwrap();
        assert_eq!(deliveries.len(), 2);
        for delivery in &deliveries {
            queue.ack(delivery).unwrap();
        }
        assert!(queue.is_empty());
    }
}
