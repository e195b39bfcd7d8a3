use crate::backend::{BackendKind, BackendOptions};
use crate::codec::MAX_COMPRESSION_LEVEL;
use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Storage engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where and how records are persisted
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// In-memory store behaviour
    #[serde(default)]
    pub store: StoreConfig,

    /// Compaction and vacuum configuration
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Backend to use; absent keeps everything in memory
    #[serde(default)]
    pub provider: Option<BackendKind>,

    /// Directory holding the backend files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// gzip level 0-9 for stored records, 0 stores plain JSON
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// LMDB map size in bytes
    #[serde(default = "default_lmdb_map_size")]
    pub lmdb_map_size: usize,

    /// Maximum LMDB sub-databases (namespaces + 1)
    #[serde(default = "default_lmdb_max_dbs")]
    pub lmdb_max_dbs: u32,
}

impl PersistenceConfig {
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            map_size: self.lmdb_map_size,
            max_dbs: self.lmdb_max_dbs,
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Hours either side of now loaded on first access; absent loads everything
    #[serde(default)]
    pub initial_load_window_h: Option<i64>,

    /// Seconds between background saves; absent disables autosave
    #[serde(default)]
    pub autosave_interval_sec: Option<u64>,

    /// Maximum entries per backend batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl StoreConfig {
    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval_sec.map(Duration::from_secs)
    }
}

/// Retention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Hours of history kept behind the newest record; absent disables vacuum
    #[serde(default)]
    pub keep_duration_h: Option<i64>,

    /// Seconds between compactions of a namespace; absent disables compaction
    #[serde(default = "default_compaction_interval_sec")]
    pub compaction_interval_sec: Option<u64>,

    /// Seconds between maintenance scheduler ticks
    #[serde(default = "default_maintenance_interval_sec")]
    pub maintenance_interval_sec: u64,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_compression_level() -> u32 {
    9
}

fn default_lmdb_map_size() -> usize {
    BackendOptions::default().map_size
}

fn default_lmdb_max_dbs() -> u32 {
    BackendOptions::default().max_dbs
}

fn default_batch_size() -> usize {
    1000
}

fn default_compaction_interval_sec() -> Option<u64> {
    Some(7 * 24 * 3600)
}

fn default_maintenance_interval_sec() -> u64 {
    300
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            provider: None,
            data_dir: default_data_dir(),
            compression_level: default_compression_level(),
            lmdb_map_size: default_lmdb_map_size(),
            lmdb_max_dbs: default_lmdb_max_dbs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_load_window_h: None,
            autosave_interval_sec: None,
            batch_size: default_batch_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_duration_h: None,
            compaction_interval_sec: default_compaction_interval_sec(),
            maintenance_interval_sec: default_maintenance_interval_sec(),
        }
    }
}

impl StorageConfig {
    /// In-memory configuration
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration persisting to `kind` under `data_dir`
    pub fn with_backend(kind: BackendKind, data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.persistence.provider = Some(kind);
        config.persistence.data_dir = data_dir.into();
        config
    }

    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StorageError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: StorageConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), yaml)
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;
        Ok(())
    }

    /// Check the configuration.
    ///
    /// Hard errors are returned as `ConfigError`. Suspicious but workable
    /// settings are logged and returned as warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.persistence.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(StorageError::ConfigError(format!(
                "compression_level must be 0-{}, got {}",
                MAX_COMPRESSION_LEVEL, self.persistence.compression_level
            )));
        }
        if self.store.batch_size == 0 {
            return Err(StorageError::ConfigError(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if let Some(hours) = self.store.initial_load_window_h {
            if hours <= 0 {
                return Err(StorageError::ConfigError(format!(
                    "initial_load_window_h must be positive, got {}",
                    hours
                )));
            }
        }
        if let Some(hours) = self.retention.keep_duration_h {
            if hours < 0 {
                return Err(StorageError::ConfigError(format!(
                    "keep_duration_h must not be negative, got {}",
                    hours
                )));
            }
        }
        if self.store.autosave_interval_sec == Some(0) {
            return Err(StorageError::ConfigError(
                "autosave_interval_sec must be positive".to_string(),
            ));
        }
        if self.retention.compaction_interval_sec == Some(0) {
            return Err(StorageError::ConfigError(
                "compaction_interval_sec must be positive".to_string(),
            ));
        }
        if self.retention.maintenance_interval_sec == 0 {
            return Err(StorageError::ConfigError(
                "maintenance_interval_sec must be positive".to_string(),
            ));
        }
        if self.persistence.provider == Some(BackendKind::Lmdb) && self.persistence.lmdb_max_dbs < 2 {
            return Err(StorageError::ConfigError(
                "lmdb_max_dbs must leave room for metadata and one namespace".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        if let (Some(compaction), Some(autosave)) = (
            self.retention.compaction_interval_sec,
            self.store.autosave_interval_sec,
        ) {
            if compaction < autosave {
                warnings.push(format!(
                    "compaction_interval_sec ({}) is shorter than autosave_interval_sec ({})",
                    compaction, autosave
                ));
            }
        }
        if self.persistence.provider.is_none() && self.store.autosave_interval_sec.is_some() {
            warnings.push("autosave_interval_sec has no effect without a provider".to_string());
        }

        for warning in &warnings {
            warn!("Configuration: {}", warning);
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.persistence.provider, None);
        assert_eq!(config.persistence.compression_level, 9);
        assert_eq!(config.store.batch_size, 1000);
        assert_eq!(config.retention.compaction_interval_sec, Some(604_800));
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
persistence:
  provider: lmdb
  data_dir: /var/lib/hems
retention:
  keep_duration_h: 720
"#;
        let config = StorageConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.persistence.provider, Some(BackendKind::Lmdb));
        assert_eq!(config.persistence.data_dir, PathBuf::from("/var/lib/hems"));
        assert_eq!(config.retention.keep_duration_h, Some(720));
        assert_eq!(config.store.batch_size, 1000);
        assert_eq!(config.retention.maintenance_interval_sec, 300);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = "persistence:\n  provider: postgres\n";
        assert!(matches!(
            StorageConfig::from_yaml(yaml),
            Err(StorageError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = StorageConfig::default();
        config.persistence.compression_level = 10;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.retention.keep_duration_h = Some(-1);
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.store.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compaction_faster_than_autosave_warns() {
        let mut config = StorageConfig::with_backend(BackendKind::Sqlite, "data");
        config.store.autosave_interval_sec = Some(7200);
        config.retention.compaction_interval_sec = Some(600);

        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("compaction_interval_sec"));
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.yaml");
        let mut config = StorageConfig::with_backend(BackendKind::Sqlite, dir.path());
        config.store.initial_load_window_h = Some(48);

        config.to_yaml_file(&path).unwrap();
        let loaded = StorageConfig::from_yaml_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
