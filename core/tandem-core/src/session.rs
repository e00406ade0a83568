//! Session identity: one id per running process instance.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::Serialize;

use crate::error::{Result, SyncError};

// Last id handed out by `generate` in this process.
static LAST_ISSUED_MS: AtomicI64 = AtomicI64::new(0);

/// Identifies the process that authored a change signal.
///
/// Generated ids are the wall-clock millisecond at creation. They end up in
/// notification filenames (`db_change_<id>_<ts>.tmp`) and in the colon-delimited
/// signal body, so `_`, `:` and path separators are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(SyncError::InvalidSessionId(value))
        }
    }

    /// A fresh id for this process, strictly greater than any id previously
    /// generated in it.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let issued = LAST_ISSUED_MS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now);
        Self(issued.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        SessionId::new(s)
    }
}
