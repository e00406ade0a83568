//! Cheap fingerprint of on-disk database state.
//!
//! The signature samples the file instead of hashing it: size, mtime, the first
//! and last 4 KiB of the primary file, plus size and first 2 KiB of the WAL when
//! one exists. Cost is constant regardless of database size.
//!
//! This is a change detector, not an integrity check. A write that only touches
//! middle pages that have already been checkpointed out of the WAL (and leaves
//! size and mtime unchanged) is not detected. Hashing the whole file would close
//! that gap at O(size) cost per publish and per foreign signal; a monotonic
//! change counter maintained by a trigger is the route if that ever matters.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::paths::side_file;

pub const HEAD_BYTES: u64 = 4096;
pub const TAIL_BYTES: u64 = 4096;
pub const WAL_HEAD_BYTES: u64 = 2048;

/// Hex-encoded SHA-256 digest of a sampled database state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Accepts a 64-character hex digest (case-insensitive, stored lowercase).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the signature of the database at `db_path` (and its `-wal`).
pub fn compute(db_path: &Path) -> Result<Signature> {
    let fail = |source: std::io::Error| SyncError::Signature {
        path: db_path.to_path_buf(),
        source,
    };

    let mut hasher = Sha256::new();

    let metadata = fs_err::metadata(db_path).map_err(fail)?;
    let size = metadata.len();
    let mtime_ns = metadata
        .modified()
        .map_err(fail)?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    hasher.update(size.to_le_bytes());
    hasher.update(mtime_ns.to_le_bytes());

    let mut file = fs_err::File::open(db_path).map_err(fail)?;
    hasher.update(read_up_to(&mut file, HEAD_BYTES).map_err(fail)?);

    if size > TAIL_BYTES {
        file.seek(SeekFrom::Start(size - TAIL_BYTES)).map_err(fail)?;
        hasher.update(read_up_to(&mut file, TAIL_BYTES).map_err(fail)?);
    }

    let wal_path = side_file(db_path, "-wal");
    if wal_path.exists() {
        // The WAL can vanish between the exists() check and the open when the
        // last connection elsewhere checkpoints; treat that as "no WAL".
        match fs_err::File::open(&wal_path) {
            Ok(mut wal) => {
                let wal_size = wal.metadata().map_err(fail)?.len();
                hasher.update(wal_size.to_le_bytes());
                hasher.update(read_up_to(&mut wal, WAL_HEAD_BYTES).map_err(fail)?);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(fail(err)),
        }
    }

    Ok(Signature(hex::encode(hasher.finalize())))
}

fn read_up_to(reader: &mut impl Read, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(limit as usize);
    reader.take(limit).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, bytes: &[u8]) {
        fs_err::write(path, bytes).unwrap();
    }

    #[test]
    fn test_unmodified_file_has_stable_signature() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("app.db");
        write_file(&db, &vec![7u8; 20_000]);

        let first = compute(&db).unwrap();
        let second = compute(&db).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn test_appending_to_wal_changes_signature() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("app.db");
        write_file(&db, &vec![1u8; 10_000]);
        let wal = temp.path().join("app.db-wal");
        write_file(&wal, &vec![2u8; 3_000]);

        let before = compute(&db).unwrap();

        let mut file = fs_err::OpenOptions::new().append(true).open(&wal).unwrap();
        file.write_all(&[3u8; 512]).unwrap();
        drop(file);

        let after = compute(&db).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_creating_wal_changes_signature() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("app.db");
        write_file(&db, b"small database");
        let without_wal = compute(&db).unwrap();

        write_file(&temp.path().join("app.db-wal"), b"frame");
        assert_ne!(without_wal, compute(&db).unwrap());
    }

    #[test]
    fn test_tail_change_is_detected_for_large_files() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("app.db");
        let mut bytes = vec![0u8; 50_000];
        write_file(&db, &bytes);
        let before = compute(&db).unwrap();

        bytes[49_999] = 9;
        write_file(&db, &bytes);
        // Size is unchanged and mtime may be too on coarse filesystems; the tail
        // sample is what catches this.
        assert_ne!(before, compute(&db).unwrap());
    }

    #[test]
    fn test_missing_file_is_a_signature_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = compute(&temp.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, SyncError::Signature { .. }));
    }

    #[test]
    fn test_parse_accepts_only_full_digests() {
        let digest = "A".repeat(64);
        assert_eq!(Signature::parse(&digest).unwrap().as_str(), "a".repeat(64));
        assert!(Signature::parse("abc").is_none());
        assert!(Signature::parse(&"g".repeat(64)).is_none());
    }
}
