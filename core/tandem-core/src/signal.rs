//! Change signals: "session S wrote the database at T, new signature is G".
//!
//! # Wire Format
//!
//! One file per announced change in the shared notification directory:
//!
//! ```text
//! temp/db_change_<session_id>_<timestamp_ms>.tmp
//!     <session_id>:<timestamp_ms>:<signature_hex>
//! ```
//!
//! The filename is authoritative for identity (it is unique per write). The
//! body carries the signature. An empty body, or a body without a signature
//! field, is accepted as a signal with no embedded signature: a writer from an
//! older protocol or a write that was interrupted. The watcher recomputes the
//! signature locally in that case.

use serde::Serialize;

use crate::session::SessionId;
use crate::signature::Signature;

pub const FILE_PREFIX: &str = "db_change_";
pub const FILE_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSignal {
    pub origin: SessionId,
    pub timestamp_ms: u64,
    pub signature: Option<Signature>,
}

impl ChangeSignal {
    pub fn new(origin: SessionId, timestamp_ms: u64, signature: Signature) -> Self {
        Self {
            origin,
            timestamp_ms,
            signature: Some(signature),
        }
    }

    pub fn file_name(&self) -> String {
        file_name(&self.origin, self.timestamp_ms)
    }

    /// Single-line body, no trailing newline.
    pub fn body(&self) -> String {
        match &self.signature {
            Some(signature) => format!("{}:{}:{}", self.origin, self.timestamp_ms, signature),
            None => format!("{}:{}", self.origin, self.timestamp_ms),
        }
    }

    /// Age relative to `now_ms`; signals stamped in the future count as new.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

pub fn file_name(origin: &SessionId, timestamp_ms: u64) -> String {
    format!("{}{}_{}{}", FILE_PREFIX, origin, timestamp_ms, FILE_SUFFIX)
}

/// True for names this protocol owns; everything else in the directory is
/// somebody else's temp file.
pub fn is_signal_file_name(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)
}

/// Parses `(origin, timestamp_ms)` out of a signal filename.
pub fn parse_file_name(name: &str) -> Result<(SessionId, u64), String> {
    let stem = name
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        .ok_or_else(|| "not a change signal file name".to_string())?;
    let (session, timestamp) = stem
        .rsplit_once('_')
        .ok_or_else(|| "missing timestamp in file name".to_string())?;
    let origin = SessionId::new(session).map_err(|err| err.to_string())?;
    let timestamp_ms = timestamp
        .parse::<u64>()
        .map_err(|_| format!("invalid timestamp {:?}", timestamp))?;
    Ok((origin, timestamp_ms))
}

/// Combines the filename identity with the body.
///
/// A body whose session or timestamp disagree with the filename, or whose
/// signature field is present but not a digest, is rejected.
pub fn parse(name: &str, body: &str) -> Result<ChangeSignal, String> {
    let (origin, timestamp_ms) = parse_file_name(name)?;
    let body = body.trim();

    let mut signal = ChangeSignal {
        origin,
        timestamp_ms,
        signature: None,
    };
    if body.is_empty() {
        return Ok(signal);
    }

    let mut fields = body.splitn(3, ':');
    let body_session = fields.next().unwrap_or_default();
    if body_session != signal.origin.as_str() {
        return Err(format!(
            "body session {:?} does not match file name",
            body_session
        ));
    }

    if let Some(body_timestamp) = fields.next() {
        if body_timestamp.parse::<u64>().ok() != Some(timestamp_ms) {
            return Err(format!(
                "body timestamp {:?} does not match file name",
                body_timestamp
            ));
        }
    }

    match fields.next().map(str::trim) {
        None | Some("") => {}
        Some(raw) => {
            let signature =
                Signature::parse(raw).ok_or_else(|| format!("invalid signature {:?}", raw))?;
            signal.signature = Some(signature);
        }
    }

    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(c: char) -> Signature {
        Signature::parse(&c.to_string().repeat(64)).unwrap()
    }

    fn session(id: &str) -> SessionId {
        SessionId::new(id).unwrap()
    }

    #[test]
    fn test_file_name_and_body_match_wire_format() {
        let signal = ChangeSignal::new(session("1700000000001"), 1700000005000, sig('a'));
        assert_eq!(
            signal.file_name(),
            "db_change_1700000000001_1700000005000.tmp"
        );
        assert_eq!(
            signal.body(),
            format!("1700000000001:1700000005000:{}", "a".repeat(64))
        );
    }

    #[test]
    fn test_parses_what_it_writes() {
        let signal = ChangeSignal::new(session("42"), 99, sig('b'));
        let parsed = parse(&signal.file_name(), &signal.body()).unwrap();
        assert_eq!(parsed, signal);
    }

    #[test]
    fn test_empty_or_short_body_has_no_signature() {
        let parsed = parse("db_change_42_99.tmp", "").unwrap();
        assert_eq!(parsed.signature, None);
        let parsed = parse("db_change_42_99.tmp", "42:99").unwrap();
        assert_eq!(parsed.signature, None);
        let parsed = parse("db_change_42_99.tmp", "42:99:\n").unwrap();
        assert_eq!(parsed.signature, None);
    }

    #[test]
    fn test_rejects_inconsistent_or_garbled_bodies() {
        assert!(parse("db_change_42_99.tmp", "43:99").is_err());
        assert!(parse("db_change_42_99.tmp", "42:100").is_err());
        assert!(parse("db_change_42_99.tmp", "42:99:not-a-digest").is_err());
        assert!(parse("db_change_42_99.tmp", "\u{fffd}garbage").is_err());
    }

    #[test]
    fn test_rejects_bad_file_names() {
        assert!(parse_file_name("db_change_42.tmp").is_err());
        assert!(parse_file_name("db_change_42_abc.tmp").is_err());
        assert!(parse_file_name("db_change__99.tmp").is_err());
        assert!(parse_file_name("other_42_99.tmp").is_err());
    }

    #[test]
    fn test_recognizes_protocol_files_only() {
        assert!(is_signal_file_name("db_change_1_2.tmp"));
        assert!(!is_signal_file_name("cache_rebuild.lock"));
        assert!(!is_signal_file_name("export_123.tmp"));
    }

    #[test]
    fn test_age_saturates_for_future_timestamps() {
        let signal = ChangeSignal::new(session("1"), 10_000, sig('c'));
        assert_eq!(signal.age_ms(12_500), 2_500);
        assert_eq!(signal.age_ms(9_000), 0);
    }
}
