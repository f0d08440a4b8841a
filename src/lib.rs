//! S3 Sync Monitor - write backpressure and mirror consistency for yas3fs
//!
//! This library samples a yas3fs log and the host connection table to decide
//! when writers should back off and when uploads have drained, and validates
//! that manifest entries exist on the local mirror and/or in the bucket.

pub mod backoff;
pub mod config;
pub mod connection_probe;
pub mod error;
pub mod log_signals;
pub mod logging;
pub mod manifest;
pub mod monitor;
pub mod object_store;
pub mod shutdown;
pub mod upload_history;
pub mod validation_result;
pub mod validator;

pub use error::{MonitorError, Result};
