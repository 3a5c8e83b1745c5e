//! Logging setup
//!
//! Console output plus an optional JSON file log with rotation. `RUST_LOG`
//! overrides the configured level.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "keelson.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Directory for rotated log files, console only when unset
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// JSON console output
    pub json_format: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber
    ///
    /// Keep the returned guard alive for as long as file logs should be
    /// flushed.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&self.level))?;

        let (plain, json) = if self.json_format {
            (None, Some(fmt::layer().json().with_target(true).with_writer(io::stdout)))
        } else {
            (
                Some(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_ansi(true)
                        .with_writer(io::stdout),
                ),
                None,
            )
        };

        let (file_layer, guard) = match &self.file_path {
            Some(dir) => {
                let appender = match self.rotation {
                    LogRotation::Hourly => rolling::hourly(dir, LOG_FILE_NAME),
                    LogRotation::Daily => rolling::daily(dir, LOG_FILE_NAME),
                    LogRotation::Never => rolling::never(dir, LOG_FILE_NAME),
                };
                let (writer, guard) = non_blocking(appender);

                let layer = fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_writer(writer);

                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(plain)
            .with(json)
            .with(file_layer)
            .try_init()?;

        tracing::info!(level = %self.level, file = ?self.file_path, "Logging initialized");

        Ok(guard)
    }

    /// Level from `RUST_LOG`, file directory from `KEELSON_LOG_PATH`
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            file_path: std::env::var("KEELSON_LOG_PATH").ok().map(PathBuf::from),
            ..Default::default()
        }
    }

    pub fn init_from_env() -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
        Self::from_env().init()
    }
}

/// Log the end of a reconcile pass with its duration
#[macro_export]
macro_rules! log_pass {
    ($controller:expr, $started:expr) => {
        tracing::debug!(
            controller = $controller,
            duration_ms = $started.elapsed().as_millis() as u64,
            "Reconcile pass finished"
        )
    };
}
