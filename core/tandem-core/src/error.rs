//! Error types for tandem-core operations.
//!
//! Only the primary commit path surfaces errors to callers. Everything that
//! happens after a successful commit (signal emission, lock wait, local
//! rebuild) is logged and degraded instead, so most variants below end up in
//! log lines rather than in a caller's `Result`.

use std::path::PathBuf;

/// All errors that can occur while coordinating the shared database.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Primary database
    // ─────────────────────────────────────────────────────────────────────
    #[error("Database busy after {attempts} attempts: {path}")]
    DatabaseBusy { path: PathBuf, attempts: u32 },

    #[error("SQLite error: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Change signals
    // ─────────────────────────────────────────────────────────────────────
    #[error("Malformed change signal {name}: {reason}")]
    MalformedSignal { name: String, reason: String },

    #[error("Failed to compute signature for {path}: {source}")]
    Signature {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    // ─────────────────────────────────────────────────────────────────────
    // Cache
    // ─────────────────────────────────────────────────────────────────────
    #[error("Cache rebuild failed: {0}")]
    Rebuild(String),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration / I/O
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn sqlite(context: impl Into<String>, source: rusqlite::Error) -> Self {
        SyncError::Sqlite {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the engine reported the database file as busy or locked.
    pub fn is_locked(&self) -> bool {
        match self {
            SyncError::Sqlite { source, .. } => is_locked_error(source),
            _ => false,
        }
    }

    /// Errors that are expected under normal multi-process contention and
    /// should be logged and skipped rather than reported.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Io { .. } | SyncError::MalformedSignal { .. } | SyncError::Signature { .. }
        ) || self.is_locked()
    }
}

pub(crate) fn is_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

impl From<SyncError> for String {
    fn from(err: SyncError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_and_locked_are_retryable() {
        assert!(SyncError::sqlite("open", failure(rusqlite::ffi::SQLITE_BUSY)).is_locked());
        assert!(SyncError::sqlite("open", failure(rusqlite::ffi::SQLITE_LOCKED)).is_locked());
        assert!(!SyncError::sqlite("open", failure(rusqlite::ffi::SQLITE_CANTOPEN)).is_locked());
    }

    #[test]
    fn test_signal_errors_are_transient() {
        let err = SyncError::MalformedSignal {
            name: "db_change_1_2.tmp".to_string(),
            reason: "bad".to_string(),
        };
        assert!(err.is_transient());
        assert!(!SyncError::Rebuild("boom".to_string()).is_transient());
    }
}
