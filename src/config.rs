//! Configuration Module
//!
//! Handles configuration loading from a YAML file, environment variables and
//! command-line arguments, in that order of precedence (later wins).

use crate::backoff::BackoffThresholds;
use crate::log_signals::{ErrorPattern, DEFAULT_ERROR_PATTERN};
use crate::validator::ValidationMode;
use crate::{MonitorError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "500ms", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub backoff: BackoffThresholds,
    pub validation: ValidationConfig,
    pub logging: LoggingConfig,
}

/// Upload monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// yas3fs log file to tail
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub log_file: PathBuf,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub check_interval: Duration,
    /// Consecutive zero queue samples required to declare writes complete
    pub idle_window: usize,
    /// Bytes read from the end of the log on each refresh
    pub tail_bytes: u64,
    pub probe: ProbeConfig,
    /// Regexes capturing (timestamp, message) for write failures
    pub error_patterns: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/var/log/yas3fs/yas3fs.log"),
            check_interval: Duration::from_secs(10),
            idle_window: 3,
            tail_bytes: 32 * 1024,
            probe: ProbeConfig::default(),
            error_patterns: vec![DEFAULT_ERROR_PATTERN.to_string()],
        }
    }
}

/// Connection probe command configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub port: u16,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: "netstat".to_string(),
            args: vec!["-na".to_string()],
            port: 443,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Consistency validation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub mode: ValidationMode,
    /// Root of the local mirror that manifest paths are joined onto
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub local_root: PathBuf,
    pub bucket: String,
    /// S3-compatible HTTP endpoint used for HEAD requests
    pub endpoint: String,
    pub retry_attempts: u32,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub retry_interval: Duration,
    /// Upper bound on validations running at once
    pub max_concurrent: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Local,
            local_root: PathBuf::from("/"),
            bucket: String::new(),
            endpoint: "http://localhost".to_string(),
            retry_attempts: 5,
            retry_interval: Duration::from_secs(2),
            max_concurrent: 16,
        }
    }
}

/// Application logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for rolling application logs; console only when unset
    pub app_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and already-parsed command line
    pub fn load(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        info!(
            "Monitor: log_file={}, interval={:?}, idle_window={}, probe={} {} (port {})",
            config.monitor.log_file.display(),
            config.monitor.check_interval,
            config.monitor.idle_window,
            config.monitor.probe.command,
            config.monitor.probe.args.join(" "),
            config.monitor.probe.port
        );
        info!(
            "Backoff thresholds: multipart={}, connections={}, queue_depth={}",
            config.backoff.max_multipart_uploads,
            config.backoff.max_connections,
            config.backoff.max_queue_depth
        );
        info!(
            "Validation: mode={}, local_root={}, bucket={}, retries={}x{:?}",
            config.validation.mode,
            config.validation.local_root.display(),
            config.validation.bucket,
            config.validation.retry_attempts,
            config.validation.retry_interval
        );
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("s3-sync-monitor")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Monitors yas3fs upload backpressure and validates mirrored files")
            .subcommand_required(true)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .global(true)
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .global(true)
                    .help("Log level filter (default: info)"),
            )
            .subcommand(
                Command::new("monitor")
                    .about("Sample the yas3fs log and connection table until interrupted")
                    .arg(
                        Arg::new("log-file")
                            .long("log-file")
                            .value_name("FILE")
                            .help("yas3fs log file to tail"),
                    )
                    .arg(
                        Arg::new("check-interval-ms")
                            .long("check-interval-ms")
                            .value_name("MS")
                            .help("Polling interval in milliseconds (default: 10000)"),
                    )
                    .arg(
                        Arg::new("idle-window")
                            .long("idle-window")
                            .value_name("N")
                            .help("Zero-queue samples needed to declare writes complete (default: 3)"),
                    ),
            )
            .subcommand(
                Command::new("validate")
                    .about("Validate manifest entries against the local mirror and/or S3")
                    .long_about(
                        "Validate manifest entries against the local mirror and/or S3.\n\n\
                         Remote checks send unsigned path-style HEAD requests to a plain \
                         http:// S3-compatible endpoint (MinIO, a local gateway or emulator). \
                         AWS S3 itself (https, SigV4) is not reachable from this command.",
                    )
                    .arg(
                        Arg::new("manifest")
                            .short('m')
                            .long("manifest")
                            .value_name("FILE")
                            .required(true)
                            .help("JSON-lines manifest of {path, size, is_directory}"),
                    )
                    .arg(
                        Arg::new("mode")
                            .long("mode")
                            .value_name("MODE")
                            .help("local | remote | both | local-then-remote"),
                    )
                    .arg(
                        Arg::new("local-root")
                            .long("local-root")
                            .value_name("DIR")
                            .help("Root of the local mirror"),
                    )
                    .arg(
                        Arg::new("bucket")
                            .long("bucket")
                            .value_name("BUCKET")
                            .help("Bucket holding the remote copies"),
                    )
                    .arg(
                        Arg::new("endpoint")
                            .long("endpoint")
                            .value_name("URL")
                            .help("Unsigned http:// S3-compatible endpoint; https and AWS S3 are not supported"),
                    ),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            MonitorError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides. Unparseable values are rejected.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(log_file) = std::env::var("YAS3FS_LOG_FILE") {
            self.monitor.log_file = pathbuf_serde::expand_tilde(&log_file);
        }

        if let Ok(interval) = std::env::var("CHECK_INTERVAL_MS") {
            self.monitor.check_interval = parse_interval_ms("CHECK_INTERVAL_MS", &interval)?;
        }

        if let Ok(mode) = std::env::var("VALIDATION_MODE") {
            self.validation.mode = parse_mode("VALIDATION_MODE", &mode)?;
        }

        if let Ok(local_root) = std::env::var("LOCAL_ROOT") {
            self.validation.local_root = pathbuf_serde::expand_tilde(&local_root);
        }

        if let Ok(bucket) = std::env::var("S3_BUCKET") {
            self.validation.bucket = bucket;
        }

        if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
            self.validation.endpoint = endpoint;
        }

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        Ok(())
    }

    /// Apply command line argument overrides, including those of the chosen subcommand
    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        match matches.subcommand() {
            Some(("monitor", sub)) => {
                if let Some(log_file) = sub.get_one::<String>("log-file") {
                    self.monitor.log_file = pathbuf_serde::expand_tilde(log_file);
                }
                if let Some(ms) = sub.get_one::<String>("check-interval-ms") {
                    self.monitor.check_interval = parse_interval_ms("--check-interval-ms", ms)?;
                }
                if let Some(window) = sub.get_one::<String>("idle-window") {
                    self.monitor.idle_window = window.parse::<usize>().map_err(|e| {
                        MonitorError::ConfigError(format!(
                            "--idle-window: invalid value '{}': {}",
                            window, e
                        ))
                    })?;
                }
            }
            Some(("validate", sub)) => {
                if let Some(mode) = sub.get_one::<String>("mode") {
                    self.validation.mode = parse_mode("--mode", mode)?;
                }
                if let Some(root) = sub.get_one::<String>("local-root") {
                    self.validation.local_root = pathbuf_serde::expand_tilde(root);
                }
                if let Some(bucket) = sub.get_one::<String>("bucket") {
                    self.validation.bucket = bucket.clone();
                }
                if let Some(endpoint) = sub.get_one::<String>("endpoint") {
                    self.validation.endpoint = endpoint.clone();
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;
        if monitor.check_interval.is_zero() {
            return Err(MonitorError::ConfigError(
                "monitor.check_interval must be greater than zero".to_string(),
            ));
        }
        if monitor.idle_window == 0 {
            return Err(MonitorError::ConfigError(
                "monitor.idle_window must be at least 1".to_string(),
            ));
        }
        if monitor.tail_bytes == 0 {
            return Err(MonitorError::ConfigError(
                "monitor.tail_bytes must be greater than zero".to_string(),
            ));
        }
        if monitor.probe.timeout.is_zero() {
            return Err(MonitorError::ConfigError(
                "monitor.probe.timeout must be greater than zero".to_string(),
            ));
        }
        for pattern in &monitor.error_patterns {
            ErrorPattern::compile(pattern)?;
        }

        let validation = &self.validation;
        if validation.retry_attempts == 0 {
            return Err(MonitorError::ConfigError(
                "validation.retry_attempts must be at least 1".to_string(),
            ));
        }
        if validation.max_concurrent == 0 {
            return Err(MonitorError::ConfigError(
                "validation.max_concurrent must be at least 1".to_string(),
            ));
        }
        if validation.mode.checks_remote() {
            if validation.bucket.is_empty() {
                return Err(MonitorError::ConfigError(format!(
                    "validation.bucket is required for mode {}",
                    validation.mode
                )));
            }
            if validation.endpoint.is_empty() {
                return Err(MonitorError::ConfigError(format!(
                    "validation.endpoint is required for mode {}",
                    validation.mode
                )));
            }
        }

        Ok(())
    }
}

fn parse_interval_ms(source: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| {
            MonitorError::ConfigError(format!("{}: invalid milliseconds '{}': {}", source, value, e))
        })
}

fn parse_mode(source: &str, value: &str) -> Result<ValidationMode> {
    value
        .parse::<ValidationMode>()
        .map_err(|e| MonitorError::ConfigError(format!("{}: {}", source, e)))
}
