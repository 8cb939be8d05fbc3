//! Configuration for cropwatch-storage

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::dimensions::DEFAULT_MAX_RESOLVE_ATTEMPTS;
use crate::error::StorageError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cropwatch-storage")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// How long a writer waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Bound on fetch-or-create attempts when resolving a dimension name
    #[serde(default = "default_max_resolve_attempts")]
    pub max_resolve_attempts: u32,

    /// Actor recorded in the audit log when a request names none
    #[serde(default)]
    pub default_actor: Option<String>,
}

fn default_db_file() -> String {
    "observations.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_resolve_attempts() -> u32 {
    DEFAULT_MAX_RESOLVE_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            db_file: default_db_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_resolve_attempts: default_max_resolve_attempts(),
            default_actor: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.db_file.trim().is_empty() {
            return Err(StorageError::Config("db_file must not be empty".to_string()));
        }
        if self.max_resolve_attempts == 0 {
            return Err(StorageError::Config("max_resolve_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(&self.db_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.db_file, "observations.db");
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_resolve_attempts, 3);
        assert!(config.db_path().ends_with("cropwatch-storage/observations.db"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
storage_dir = "/tmp/cropwatch-test"
default_actor = "gateway"
"#,
        ).unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/cropwatch-test"));
        assert_eq!(config.default_actor.as_deref(), Some("gateway"));
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/cropwatch-test/observations.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            max_resolve_attempts: 5,
            ..Config::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_resolve_attempts = 0\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
