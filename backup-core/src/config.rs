//! Configuration management for the backup core.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::retention::RetentionPolicy;
use crate::utils::errors::{DrError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per backup
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Compress captured files with zstd
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Run a quick verification right after every backup
    #[serde(default)]
    pub verify_after_create: bool,

    /// Exclude patterns (glob) applied to every backup in addition to per-request ones
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Follow symbolic links while walking sources
    #[serde(default)]
    pub follow_links: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the cron driver re-reads the schedule registry
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-dr/backups")
}

fn default_compression() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_exclude_patterns() -> Vec<String> {
    vec![".DS_Store".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sync_interval_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            compression_level: default_compression_level(),
            verify_after_create: false,
            exclude_patterns: default_exclude_patterns(),
            follow_links: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| DrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `backup_dir`, everything else default
    pub fn with_backup_dir(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                backup_dir: backup_dir.into(),
            },
            ..Self::default()
        }
    }

    /// Apply `BACKUP_DIR`, `LOG_LEVEL` and `COMPRESSION_LEVEL` from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("BACKUP_DIR") {
            self.storage.backup_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(level) = std::env::var("COMPRESSION_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.backup.compression_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.backup.compression_level) {
            return Err(DrError::Config(format!(
                "compression_level must be between 1 and 22, got {}",
                self.backup.compression_level
            )));
        }
        if self.storage.backup_dir.as_os_str().is_empty() {
            return Err(DrError::Config("storage.backup_dir is empty".into()));
        }
        Ok(())
    }

    /// `<backup_dir>/../index.json`
    pub fn index_path(&self) -> PathBuf {
        sibling_of_root(&self.storage.backup_dir, "index.json")
    }

    /// `<backup_dir>/../schedules.json`
    pub fn schedules_path(&self) -> PathBuf {
        sibling_of_root(&self.storage.backup_dir, "schedules.json")
    }
}

/// Durable registry files live next to the backup root, not inside it,
/// so that listing backup directories never sees them.
fn sibling_of_root(root: &Path, name: &str) -> PathBuf {
    match root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => root.join(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.backup.compression);
        assert_eq!(config.backup.compression_level, 3);
        assert_eq!(config.retention.daily, 7);
        assert_eq!(config.retention.weekly, 4);
        assert_eq!(config.retention.monthly, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_paths_sit_beside_root() {
        let config = Config::with_backup_dir("/data/dr/backups");
        assert_eq!(config.index_path(), PathBuf::from("/data/dr/index.json"));
        assert_eq!(config.schedules_path(), PathBuf::from("/data/dr/schedules.json"));
    }

    #[test]
    fn test_from_file_partial() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
backup_dir = "/srv/backups"

[retention]
daily = 3
weekly = 2
monthly = 6
"#,
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.storage.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.retention.daily, 3);
        assert_eq!(config.backup.compression_level, 3);
        assert_eq!(config.log.level, "info");
        Ok(())
    }

    #[test]
    fn test_invalid_compression_level() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\ncompression_level = 40\n")?;
        assert!(matches!(Config::from_file(&path), Err(DrError::Config(_))));
        Ok(())
    }
}
