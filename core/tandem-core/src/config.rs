//! Runtime tunables for the coherence layer.
//!
//! Timings were tuned for a low-concurrency desktop setting (tens of processes,
//! human-paced writes). Every field has a default, so an absent or partial
//! `sync.toml` is valid. The SQLite pragma set is deliberately not here: it is
//! part of the on-disk contract and lives in [`crate::router`].

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".tandem/sync.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub primary: PrimaryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Period between watcher ticks.
    pub interval_ms: u64,
    /// Own signals younger than this are left alone by our watcher.
    pub self_grace_ms: u64,
    /// Unparseable signal files are kept this long in case they are mid-write.
    pub malformed_grace_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            self_grace_ms: 5_000,
            malformed_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublishConfig {
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Upper bound on waiting for another rebuild's lock marker.
    pub lock_wait_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: 1_000,
            delay_max_ms: 3_000,
            lock_wait_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub poll_min_ms: u64,
    pub poll_max_ms: u64,
    /// Markers older than this are assumed abandoned by a crashed process.
    pub stale_after_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            poll_min_ms: 50,
            poll_max_ms: 250,
            stale_after_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrimaryConfig {
    pub open_attempts: u32,
    pub open_retry_delay_ms: u64,
    pub side_file_attempts: u32,
    pub side_file_retry_delay_ms: u64,
    pub remove_side_files: bool,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            open_attempts: 10,
            open_retry_delay_ms: 1_000,
            side_file_attempts: 3,
            side_file_retry_delay_ms: 100,
            remove_side_files: true,
        }
    }
}

impl SyncConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.interval_ms)
    }

    pub fn self_grace(&self) -> Duration {
        Duration::from_millis(self.watcher.self_grace_ms)
    }

    pub fn malformed_grace(&self) -> Duration {
        Duration::from_millis(self.watcher.malformed_grace_ms)
    }

    /// The bounded wait used by publish: never longer than the lock's own timeout.
    pub fn publish_lock_wait(&self) -> Duration {
        Duration::from_millis(self.publish.lock_wait_ms.min(self.lock.timeout_ms))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.timeout_ms)
    }

    /// A configuration with every delay collapsed, for tests and tooling that
    /// simulate several processes inside one.
    pub fn immediate() -> Self {
        Self {
            watcher: WatcherConfig {
                interval_ms: 50,
                self_grace_ms: 5_000,
                malformed_grace_ms: 30_000,
            },
            publish: PublishConfig {
                delay_min_ms: 0,
                delay_max_ms: 0,
                lock_wait_ms: 500,
            },
            lock: LockConfig {
                timeout_ms: 500,
                poll_min_ms: 5,
                poll_max_ms: 20,
                stale_after_ms: 120_000,
            },
            primary: PrimaryConfig {
                open_attempts: 3,
                open_retry_delay_ms: 20,
                side_file_attempts: 2,
                side_file_retry_delay_ms: 10,
                remove_side_files: true,
            },
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        SyncError::io(
            "resolving home directory",
            std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found"),
        )
    })?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

/// Loads the config from `path` (or the default location). A missing file is
/// not an error; a file that fails to parse is.
pub fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(SyncConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| SyncError::io("reading sync config", err))?;
    toml::from_str::<SyncConfig>(&content).map_err(|err| SyncError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("missing.toml"))).expect("load");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.watch_interval(), Duration::from_millis(1_000));
        assert_eq!(config.self_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_config_merges_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("sync.toml");
        fs_err::write(
            &path,
            r#"
[watcher]
interval_ms = 250

[lock]
timeout_ms = 4000

[primary]
remove_side_files = false
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(config.watcher.interval_ms, 250);
        assert_eq!(config.watcher.self_grace_ms, 5_000);
        assert_eq!(config.lock.timeout_ms, 4_000);
        assert_eq!(config.lock.poll_min_ms, 50);
        assert!(!config.primary.remove_side_files);
        assert_eq!(config.primary.open_attempts, 10);
    }

    #[test]
    fn test_load_config_rejects_bad_toml() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("sync.toml");
        fs_err::write(&path, "[watcher\ninterval_ms = ").expect("write config");

        let err = load_config(Some(path.clone())).expect_err("should fail");
        match err {
            SyncError::ConfigMalformed { path: bad, .. } => assert_eq!(bad, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_publish_wait_is_capped_by_lock_timeout() {
        let mut config = SyncConfig::default();
        config.publish.lock_wait_ms = 30_000;
        config.lock.timeout_ms = 2_000;
        assert_eq!(config.publish_lock_wait(), Duration::from_millis(2_000));
    }
}
