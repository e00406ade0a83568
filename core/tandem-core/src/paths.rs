//! Path layout for one shared database.
//!
//! Every process that opens the same primary file derives the same side-file,
//! notification and lock paths from it, which is what makes the shared
//! directory work as a bus without any registration step.
//!
//! ```text
//! data/
//! ├── app.db
//! ├── app.db-wal
//! ├── app.db-shm
//! └── temp/
//!     ├── cache_rebuild.lock
//!     └── db_change_<session>_<timestamp_ms>.tmp
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

const NOTIFY_DIR_NAME: &str = "temp";
const LOCK_FILE_NAME: &str = "cache_rebuild.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPaths {
    primary: PathBuf,
    notify_dir: PathBuf,
}

impl SyncPaths {
    /// Derives the layout for the database at `primary`.
    pub fn for_database(primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let notify_dir = primary
            .parent()
            .map(|parent| parent.join(NOTIFY_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(NOTIFY_DIR_NAME));
        Self {
            primary,
            notify_dir,
        }
    }

    /// Overrides the notification directory (the lock marker moves with it).
    pub fn with_notify_dir(mut self, notify_dir: impl Into<PathBuf>) -> Self {
        self.notify_dir = notify_dir.into();
        self
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn wal(&self) -> PathBuf {
        side_file(&self.primary, "-wal")
    }

    pub fn shm(&self) -> PathBuf {
        side_file(&self.primary, "-shm")
    }

    pub fn notify_dir(&self) -> &Path {
        &self.notify_dir
    }

    pub fn lock_file(&self) -> PathBuf {
        self.notify_dir.join(LOCK_FILE_NAME)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs_err::create_dir_all(&self.notify_dir)
            .map_err(|err| SyncError::io("creating notification directory", err))
    }
}

/// `app.db` + `-wal` -> `app.db-wal`, matching SQLite's own naming.
pub fn side_file(primary: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = primary.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derives_layout_beside_database() {
        let paths = SyncPaths::for_database("/data/shared/app.db");
        assert_eq!(paths.wal(), PathBuf::from("/data/shared/app.db-wal"));
        assert_eq!(paths.shm(), PathBuf::from("/data/shared/app.db-shm"));
        assert_eq!(paths.notify_dir(), Path::new("/data/shared/temp"));
        assert_eq!(
            paths.lock_file(),
            PathBuf::from("/data/shared/temp/cache_rebuild.lock")
        );
    }

    #[test]
    fn test_notify_dir_override_moves_lock_file() {
        let paths = SyncPaths::for_database("/data/app.db").with_notify_dir("/elsewhere");
        assert_eq!(paths.lock_file(), PathBuf::from("/elsewhere/cache_rebuild.lock"));
        assert_eq!(paths.primary(), Path::new("/data/app.db"));
    }

    #[test]
    fn test_ensure_dirs_creates_notify_dir() {
        let temp = tempfile::tempdir().unwrap();
        let paths = SyncPaths::for_database(temp.path().join("app.db"));
        paths.ensure_dirs().unwrap();
        assert!(temp.path().join("temp").is_dir());
    }
}
