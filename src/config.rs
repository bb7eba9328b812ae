use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sync::{build_ws_url, DispatcherConfig, PullQuery, PushConfig, SyncSettings};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// The `sync:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server base URL (e.g., "https://pos.example.com")
    pub server_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub sweep_interval_secs: u64,
    /// Extra delay after a change before pushing; 0 pushes immediately.
    pub coalesce_window_ms: u64,
    pub request_timeout_secs: u64,
    pub max_rejections: i64,
    /// Pushed outbox entries older than this are deleted.
    pub retention_days: i64,
    pub location_id: Option<String>,
    pub company_id: Option<String>,
    pub order_type: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            sweep_interval_secs: 30,
            coalesce_window_ms: 0,
            request_timeout_secs: 15,
            max_rejections: 3,
            retention_days: 7,
            location_id: None,
            company_id: None,
            order_type: None,
        }
    }
}

impl SyncConfig {
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn pull_query(&self) -> PullQuery {
        PullQuery {
            location_id: self.location_id.clone(),
            company_id: self.company_id.clone(),
            order_type: self.order_type.clone(),
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            max_rejections: self.max_rejections.max(1),
            ..PushConfig::default()
        }
    }

    /// Settings for a long-running [`crate::sync::SyncService`].
    pub fn sync_settings(&self, device_id: &str) -> SyncSettings {
        let sweep_interval = Duration::from_secs(self.sweep_interval_secs.max(1));
        SyncSettings {
            push: self.push_config(),
            dispatcher: DispatcherConfig {
                coalesce_window: Duration::from_millis(self.coalesce_window_ms),
                sweep_interval,
                retention: (self.retention_days > 0)
                    .then(|| chrono::Duration::days(self.retention_days)),
            },
            pull_query: self.pull_query(),
            probe_interval: sweep_interval,
            notifications_url: self
                .server_url
                .as_deref()
                .map(|url| build_ws_url(url, device_id)),
            ..SyncSettings::default()
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Overrides the generated device id when set
    pub device_id: ConfigValue<Option<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    device_id: Option<String>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("tillsync.db"),
            ConfigSource::Default,
        );
        let mut device_id = ConfigValue::new(None, ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                database_path =
                    ConfigValue::new(resolve_relative(&path, db_path), ConfigSource::File);
            }
            if let Some(id) = file_config.device_id {
                device_id = ConfigValue::new(Some(id), ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        if let Ok(db_path) = std::env::var("TILLSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(id) = std::env::var("TILLSYNC_DEVICE_ID") {
            device_id = ConfigValue::new(Some(id), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("TILLSYNC_SERVER_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("TILLSYNC_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            device_id,
            config_file,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/tillsync/
    /// - macOS: ~/Library/Application Support/tillsync/
    /// - Windows: %APPDATA%/tillsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tillsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/tillsync/
    /// - macOS: ~/Library/Application Support/tillsync/
    /// - Windows: %APPDATA%/tillsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tillsync")
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

/// Relative database paths are taken relative to the config file.
fn resolve_relative(config_path: &Path, db_path: PathBuf) -> PathBuf {
    if db_path.is_relative() {
        config_path
            .parent()
            .map(|p| p.join(&db_path))
            .unwrap_or(db_path)
    } else {
        db_path
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("tillsync.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.device_id.value, None);
        assert_eq!(config.sync.sweep_interval_secs, 30);
        assert_eq!(config.sync.coalesce_window_ms, 0);
        assert_eq!(config.sync.max_rejections, 3);
        assert_eq!(config.sync.retention_days, 7);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/pos.sqlite").unwrap();
        writeln!(file, "device_id: till-3").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  server_url: https://pos.example.com").unwrap();
        writeln!(file, "  max_rejections: 5").unwrap();
        writeln!(file, "  location_id: loc-9").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/pos.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.device_id.value.as_deref(), Some("till-3"));
        assert_eq!(config.device_id.source, ConfigSource::File);
        assert_eq!(config.config_file, Some(config_path));
        assert!(config.sync.is_configured());
        assert_eq!(config.sync.max_rejections, 5);
        assert_eq!(config.sync.sweep_interval_secs, 30);
        assert_eq!(config.sync.pull_query().location_id.as_deref(), Some("loc-9"));
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "database_path: data/pos.db\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/pos.db")
        );
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "device_id: fromfile\n").unwrap();

        std::env::set_var("TILLSYNC_DEVICE_ID", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.device_id.value.as_deref(), Some("fromenv"));
        assert_eq!(config.device_id.source, ConfigSource::Environment);

        std::env::remove_var("TILLSYNC_DEVICE_ID");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "invalid: yaml: content: [\n").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_sync_settings_from_config() {
        let sync = SyncConfig {
            server_url: Some("https://pos.example.com".into()),
            coalesce_window_ms: 250,
            retention_days: 0,
            ..SyncConfig::default()
        };
        let settings = sync.sync_settings("till-1");
        assert_eq!(
            settings.dispatcher.coalesce_window,
            Duration::from_millis(250)
        );
        assert!(settings.dispatcher.retention.is_none());
        assert_eq!(
            settings.notifications_url.as_deref(),
            Some("wss://pos.example.com/notifications?deviceId=till-1")
        );
    }
}
