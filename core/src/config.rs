//! Configuration loading and management.
//! Uses injected `AppPaths` so platform shells control where files live.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lifecycle::RetrySchedule;
use crate::lock;
use crate::platform::AppPaths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether outbound connections are routed through the tunnel.
    pub enabled: bool,
    /// Overrides the shell's default credentials location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<PathBuf>,
    pub retry: RetryConfig,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub start_timeout_ms: u64,
    pub read_buffer_size: usize,
    /// Keep the channel open after the remote side finishes sending.
    pub allow_half_closure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            credentials: None,
            retry: RetryConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            start_timeout_ms: 30_000,
            read_buffer_size: 16 * 1024,
            allow_half_closure: false,
        }
    }
}

impl RetryConfig {
    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the provided paths. Creates a default file if missing.
    pub fn load_with(paths: &dyn AppPaths) -> Result<Self, ConfigError> {
        let config_path = paths.config_path();

        if !config_path.exists() {
            info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let default_config = Self::default();
            default_config.save_with(paths)?;
            return Ok(default_config);
        }

        debug!("Loading config from {:?}", config_path);
        let content = fs::read_to_string(&config_path)?;
        let config = Self::from_toml_str(&content)?;

        info!("Loaded config: enabled={}", config.enabled);
        Ok(config)
    }

    /// Save configuration to the provided paths.
    pub fn save_with(&self, paths: &dyn AppPaths) -> Result<(), ConfigError> {
        let config_path = paths.config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        info!("Saved config: enabled={}", self.enabled);
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Credentials file the tunnel engine should use.
    pub fn credentials_path(&self, paths: &dyn AppPaths) -> PathBuf {
        self.credentials
            .clone()
            .unwrap_or_else(|| paths.credentials_path())
    }
}

/// Shared, persisted view of the configuration.
///
/// Every mutation is written back to disk while the lock is held, so a
/// toggle and its persisted value never disagree.
pub struct ConfigStore {
    config: Mutex<Config>,
    paths: Arc<dyn AppPaths>,
}

impl ConfigStore {
    /// Load from disk, falling back to defaults when the file cannot be read.
    pub fn load(paths: Arc<dyn AppPaths>) -> Self {
        let config = match Config::load_with(paths.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                warn!("Using default configuration");
                Config::default()
            }
        };
        Self::with_config(config, paths)
    }

    pub fn with_config(config: Config, paths: Arc<dyn AppPaths>) -> Self {
        Self {
            config: Mutex::new(config),
            paths,
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.config).enabled
    }

    /// Set the enabled flag and persist it.
    pub fn set_enabled(&self, enabled: bool) {
        let mut config = lock(&self.config);
        config.enabled = enabled;
        self.persist(&config);
    }

    /// Flip the enabled flag, persist it, and return the new value.
    pub fn toggle(&self) -> bool {
        let mut config = lock(&self.config);
        config.enabled = !config.enabled;
        self.persist(&config);
        config.enabled
    }

    pub fn snapshot(&self) -> Config {
        lock(&self.config).clone()
    }

    pub fn credentials_path(&self) -> PathBuf {
        lock(&self.config).credentials_path(self.paths.as_ref())
    }

    pub fn paths(&self) -> &dyn AppPaths {
        self.paths.as_ref()
    }

    fn persist(&self, config: &Config) {
        if let Err(e) = config.save_with(self.paths.as_ref()) {
            error!("Failed to save config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct TempPaths(PathBuf);

    impl AppPaths for TempPaths {
        fn config_path(&self) -> PathBuf {
            self.0.join("wgtunnel").join("config.toml")
        }

        fn credentials_path(&self) -> PathBuf {
            self.0.join("wgtunnel").join("credentials.json")
        }
    }

    fn temp_paths(dir: &Path) -> Arc<dyn AppPaths> {
        Arc::new(TempPaths(dir.to_path_buf()))
    }

    #[test]
    fn missing_file_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());

        let config = Config::load_with(paths.as_ref()).unwrap();
        assert_eq!(config, Config::default());
        assert!(paths.config_path().exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
enabled = false

[retry]
initial_delay_ms = 250
"#,
        )
        .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.connection.read_buffer_size, 16 * 1024);
    }

    #[test]
    fn toggle_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let store = ConfigStore::load(Arc::clone(&paths));
        assert!(store.is_enabled());

        assert!(!store.toggle());
        assert!(!Config::load_with(paths.as_ref()).unwrap().enabled);

        store.set_enabled(true);
        assert!(Config::load_with(paths.as_ref()).unwrap().enabled);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        let config_path = paths.config_path();
        fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        fs::write(&config_path, "enabled = \"perhaps\"").unwrap();

        assert!(matches!(
            Config::load_with(paths.as_ref()),
            Err(ConfigError::Parse(_))
        ));
        let store = ConfigStore::load(paths);
        assert_eq!(store.snapshot(), Config::default());
    }

    #[test]
    fn credentials_override() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());

        let config = Config::default();
        assert_eq!(
            config.credentials_path(paths.as_ref()),
            paths.credentials_path()
        );

        let config = Config {
            credentials: Some(PathBuf::from("/etc/wgtunnel/creds.json")),
            ..Config::default()
        };
        assert_eq!(
            config.credentials_path(paths.as_ref()),
            PathBuf::from("/etc/wgtunnel/creds.json")
        );
    }
}
