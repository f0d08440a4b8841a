//! Error Module
//!
//! Defines error types and result types used throughout the sync monitor.

use thiserror::Error;

/// Main error type for the sync monitor
#[derive(Error, Debug, Clone)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        MonitorError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for MonitorError {
    fn from(err: hyper::Error) -> Self {
        MonitorError::HttpError(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for MonitorError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        MonitorError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for MonitorError {
    fn from(err: serde_yaml::Error) -> Self {
        MonitorError::SerializationError(err.to_string())
    }
}

impl From<regex::Error> for MonitorError {
    fn from(err: regex::Error) -> Self {
        MonitorError::ConfigError(format!("invalid pattern: {}", err))
    }
}

/// Result type alias for the sync monitor
pub type Result<T> = std::result::Result<T, MonitorError>;
