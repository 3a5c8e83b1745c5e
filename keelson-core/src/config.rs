//! Configuration
//!
//! Settings are layered, later layers win:
//! 1. Default values
//! 2. Configuration file (TOML)
//! 3. `KEELSON_*` environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::check::EtcdCheckOptions;
use crate::controller::RestartPolicy;
use crate::logging::LoggingConfig;

/// Metrics scans run at most this often
pub const MIN_METRICS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeelsonConfig {
    pub logging: LoggingConfig,
    pub controllers: ControllerConfig,
    pub etcd: EtcdConfig,
}

/// Controller scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Minimum seconds between two fleet metrics scans
    pub metrics_interval_secs: u64,
    /// Seconds between periodic control plane checks
    pub control_plane_check_interval_secs: u64,
    /// Minimum seconds between two control plane checks
    pub control_plane_min_interval_secs: u64,
    /// First restart delay of a failed controller
    pub restart_backoff_initial_ms: u64,
    /// Restart delay cap
    pub restart_backoff_max_secs: u64,
}

/// etcd call timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EtcdConfig {
    /// Per-node health query timeout
    pub node_timeout_secs: u64,
    /// Member list and status call timeout
    pub member_list_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 10,
            control_plane_check_interval_secs: 60,
            control_plane_min_interval_secs: 10,
            restart_backoff_initial_ms: 500,
            restart_backoff_max_secs: 30,
        }
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: 5,
            member_list_timeout_secs: 60,
        }
    }
}

impl KeelsonConfig {
    /// Defaults, then the first config file found, then the environment
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file() {
            match Self::load_from_file(&path) {
                Ok(file_config) => config = file_config,
                Err(e) => warn!(error = %e, "Ignoring config file"),
            }
        }

        config.apply_env_overrides();

        config
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("KEELSON_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/keelson/config.toml")),
            Some(PathBuf::from("./keelson.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, unparsable values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Option<u64> {
            let value = lookup(key)?;
            match value.parse() {
                Ok(number) => Some(number),
                Err(_) => {
                    warn!(key = key, value = %value, "Ignoring non-numeric override");
                    None
                }
            }
        };

        // Logging
        if let Some(level) = lookup("KEELSON_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = lookup("KEELSON_LOG_PATH") {
            self.logging.file_path = Some(PathBuf::from(path));
        }
        if let Some(json) = lookup("KEELSON_LOG_JSON") {
            self.logging.json_format = json.parse().unwrap_or(false);
        }

        // Controllers
        if let Some(secs) = number("KEELSON_METRICS_INTERVAL_SECS") {
            self.controllers.metrics_interval_secs = secs;
        }
        if let Some(secs) = number("KEELSON_CONTROL_PLANE_CHECK_INTERVAL_SECS") {
            self.controllers.control_plane_check_interval_secs = secs;
        }
        if let Some(secs) = number("KEELSON_CONTROL_PLANE_MIN_INTERVAL_SECS") {
            self.controllers.control_plane_min_interval_secs = secs;
        }
        if let Some(ms) = number("KEELSON_RESTART_BACKOFF_INITIAL_MS") {
            self.controllers.restart_backoff_initial_ms = ms;
        }
        if let Some(secs) = number("KEELSON_RESTART_BACKOFF_MAX_SECS") {
            self.controllers.restart_backoff_max_secs = secs;
        }

        // etcd
        if let Some(secs) = number("KEELSON_ETCD_NODE_TIMEOUT_SECS") {
            self.etcd.node_timeout_secs = secs;
        }
        if let Some(secs) = number("KEELSON_ETCD_MEMBER_LIST_TIMEOUT_SECS") {
            self.etcd.member_list_timeout_secs = secs;
        }
    }

    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controllers.metrics_interval_secs < MIN_METRICS_INTERVAL_SECS {
            return Err(ConfigError::Validation(format!(
                "Metrics interval must be at least {}s",
                MIN_METRICS_INTERVAL_SECS
            )));
        }

        if self.controllers.control_plane_check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "Control plane check interval cannot be 0".to_string(),
            ));
        }

        if self.controllers.restart_backoff_initial_ms == 0 {
            return Err(ConfigError::Validation(
                "Restart backoff cannot be 0".to_string(),
            ));
        }

        if self.controllers.restart_backoff_max_secs.saturating_mul(1000) < self.controllers.restart_backoff_initial_ms {
            return Err(ConfigError::Validation(
                "Restart backoff cap is below the initial backoff".to_string(),
            ));
        }

        if self.etcd.node_timeout_secs == 0 || self.etcd.member_list_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "etcd timeouts cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl ControllerConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn control_plane_check_interval(&self) -> Duration {
        Duration::from_secs(self.control_plane_check_interval_secs)
    }

    pub fn control_plane_min_interval(&self) -> Duration {
        Duration::from_secs(self.control_plane_min_interval_secs)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            initial: Duration::from_millis(self.restart_backoff_initial_ms),
            max: Duration::from_secs(self.restart_backoff_max_secs),
        }
    }
}

impl EtcdConfig {
    pub fn check_options(&self) -> EtcdCheckOptions {
        EtcdCheckOptions {
            node_timeout: Duration::from_secs(self.node_timeout_secs),
            member_list_timeout: Duration::from_secs(self.member_list_timeout_secs),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}
