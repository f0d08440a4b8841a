//! Logging Module
//!
//! Application logging through `tracing`: a compact console layer plus an
//! optional daily-rotated file under `<app_log_dir>/<hostname>/`.

use crate::config::LoggingConfig;
use crate::{MonitorError, Result};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const APP_LOG_FILE_PREFIX: &str = "s3-sync-monitor.log";

/// Sets up the global tracing subscriber
#[derive(Debug, Clone)]
pub struct LoggerManager {
    pub config: LoggingConfig,
    pub hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Build a manager for the local host
    pub fn for_local_host(config: LoggingConfig) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Self::new(config, hostname)
    }

    /// Host-specific directory for the application log file, if file logging is on
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Install the subscriber. `RUST_LOG` takes precedence over the configured level.
    /// An already-installed subscriber (tests, embedding) is left in place.
    pub fn initialize(&self) -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.config.log_level))
            .map_err(|e| {
                MonitorError::ConfigError(format!(
                    "invalid log level {}: {}",
                    self.config.log_level, e
                ))
            })?;

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(ChronoUtc::rfc_3339())
            .compact();

        let file_layer = match self.host_log_dir() {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    MonitorError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let appender = RollingFileAppender::new(Rotation::DAILY, &dir, APP_LOG_FILE_PREFIX);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true)
                        .with_timer(ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = self.host_log_dir() {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => debug!("Tracing subscriber already initialized, skipping"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_host_log_dir() {
        let manager = LoggerManager::new(
            LoggingConfig {
                log_level: "debug".to_string(),
                app_log_dir: Some(PathBuf::from("/var/log/monitor")),
            },
            "node-1".to_string(),
        );
        assert_eq!(
            manager.host_log_dir(),
            Some(PathBuf::from("/var/log/monitor/node-1"))
        );

        let console_only = LoggerManager::new(LoggingConfig::default(), "node-1".to_string());
        assert_eq!(console_only.host_log_dir(), None);
    }

    #[test]
    fn test_initialize_creates_host_dir_and_tolerates_reinit() {
        let dir = TempDir::new().unwrap();
        let manager = LoggerManager::new(
            LoggingConfig {
                log_level: "info".to_string(),
                app_log_dir: Some(dir.path().to_path_buf()),
            },
            "test-host".to_string(),
        );

        manager.initialize().unwrap();
        assert!(dir.path().join("test-host").is_dir());
        manager.initialize().unwrap();
    }
}
