//! Configuration file
//!
//! ```json
//! {
//!   "data_dir": "/srv/world",
//!   "backup_interval_secs": 3600,
//!   "ignored_worlds": ["scratch"]
//! }
//! ```
//!
//! Only `data_dir` is required.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::{CliError, CliResult};
use crate::observability::{log_event_with_fields, Event};
use crate::partition::DatasetLayout;
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

const STATE_DIR_NAME: &str = ".regionvault";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Live dataset root (required)
    pub data_dir: PathBuf,

    /// Blob store and catalog location, default `<data_dir>/.regionvault`
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,

    /// Upper bound for one worker's drain during a restore
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default = "default_read_cache_capacity")]
    pub read_cache_capacity: usize,

    /// Pause between attempts of a failed blob write or read
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub safety_backup_before_restore: bool,

    #[serde(default = "default_true")]
    pub verify_before_restore: bool,

    /// Worlds excluded from backups
    #[serde(default)]
    pub ignored_worlds: Vec<String>,
}

fn default_backup_interval_secs() -> u64 {
    3600
}
fn default_drain_timeout_ms() -> u64 {
    30_000
}
fn default_read_cache_capacity() -> usize {
    256
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Defaults for everything but the data directory.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            state_dir: None,
            backup_interval_secs: default_backup_interval_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
            read_cache_capacity: default_read_cache_capacity(),
            retry_delay_ms: default_retry_delay_ms(),
            safety_backup_before_restore: true,
            verify_before_restore: true,
            ignored_worlds: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("data_dir", &config.data_dir.display().to_string()),
            ],
        );
        Ok(config)
    }

    pub fn validate(&self) -> CliResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CliError::config_error("data_dir must be set"));
        }
        if self.backup_interval_secs == 0 {
            return Err(CliError::config_error("backup_interval_secs must be > 0"));
        }
        if self.drain_timeout_ms == 0 {
            return Err(CliError::config_error("drain_timeout_ms must be > 0"));
        }
        if self.read_cache_capacity == 0 {
            return Err(CliError::config_error("read_cache_capacity must be > 0"));
        }
        if self.state_path() == self.data_dir {
            return Err(CliError::config_error("state_dir must differ from data_dir"));
        }
        Ok(())
    }

    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(&self.data_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(STATE_DIR_NAME))
    }

    pub fn blob_path(&self) -> PathBuf {
        self.state_path().join("blob")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.state_path().join("catalog.json")
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.retry_delay_ms))
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            read_cache_capacity: self.read_cache_capacity,
        }
    }

    pub fn is_ignored(&self, world: &str) -> bool {
        self.ignored_worlds.iter().any(|w| w == world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("regionvault.json");
        fs::write(&path, br#"{"data_dir": "/srv/world"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backup_interval_secs, 3600);
        assert_eq!(config.drain_timeout(), Duration::from_secs(30));
        assert!(config.safety_backup_before_restore);
        assert_eq!(config.state_path(), PathBuf::from("/srv/world/.regionvault"));
        assert_eq!(config.catalog_path(), PathBuf::from("/srv/world/.regionvault/catalog.json"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("regionvault.json");
        fs::write(&path, br#"{"data_dir": "/srv/world", "backup_interval_secs": 0}"#).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.code_str(), "RV_CLI_CONFIG_ERROR");
    }

    #[test]
    fn test_state_dir_equal_to_data_dir_rejected() {
        let mut config = Config::for_data_dir("/srv/world");
        config.state_dir = Some(PathBuf::from("/srv/world"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ignored_worlds() {
        let mut config = Config::for_data_dir("/srv/world");
        config.ignored_worlds = vec!["scratch".into()];
        assert!(config.is_ignored("scratch"));
        assert!(!config.is_ignored("overworld"));
    }
}
