//! Validation Result Module
//!
//! Outcome records produced by the consistency validator and the sink they are
//! routed to. Check identifiers are stable strings so operators and tests can
//! match on them.

use crate::validator::ValidationMode;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Identifies which check produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckId {
    LocalOk,
    LocalNotFound,
    LocalNotDirectory,
    LocalSizeMismatch,
    LocalError,
    RemoteOk,
    RemoteNotFound,
    RemoteError,
    RemoteSizeMismatch,
    BothOk,
    BothFailed,
    FallbackFailed,
}

impl CheckId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckId::LocalOk => "local.check.ok",
            CheckId::LocalNotFound => "local.check.exists",
            CheckId::LocalNotDirectory => "local.check.isDirectory",
            CheckId::LocalSizeMismatch => "local.check.size",
            CheckId::LocalError => "local.check.error",
            CheckId::RemoteOk => "s3.check.ok",
            CheckId::RemoteNotFound => "s3.check.404",
            CheckId::RemoteError => "s3.check.error",
            CheckId::RemoteSizeMismatch => "s3.check.size",
            CheckId::BothOk => "local+s3.check.ok",
            CheckId::BothFailed => "local+s3.check.failed",
            CheckId::FallbackFailed => "local->s3.check.failed",
        }
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CheckId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outcome of validating one manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathValidationResult {
    pub mode: ValidationMode,
    pub success: bool,
    /// Local path or remote key that was checked
    pub path: String,
    pub check: CheckId,
    pub message: String,
}

impl PathValidationResult {
    pub fn ok(mode: ValidationMode, path: impl Into<String>, check: CheckId, message: impl Into<String>) -> Self {
        Self {
            mode,
            success: true,
            path: path.into(),
            check,
            message: message.into(),
        }
    }

    pub fn failed(mode: ValidationMode, path: impl Into<String>, check: CheckId, message: impl Into<String>) -> Self {
        Self {
            mode,
            success: false,
            path: path.into(),
            check,
            message: message.into(),
        }
    }

    /// `success=<flag> check=<id> msg=<message>` fragment used when combining results
    pub fn summary(&self) -> String {
        format!("success={} check={} msg={}", self.success, self.check, self.message)
    }
}

/// Receives validation outcomes. Each check lands on exactly one channel.
pub trait ValidationResultSink: Send + Sync {
    fn record_validated(&self, result: PathValidationResult);

    fn record_validation_failure(&self, result: PathValidationResult);

    /// Route a result to the channel matching its success flag
    fn record(&self, result: PathValidationResult) {
        if result.success {
            self.record_validated(result);
        } else {
            self.record_validation_failure(result);
        }
    }
}

/// In-memory sink collecting every outcome
#[derive(Debug, Default)]
pub struct ValidationReport {
    validated: Mutex<Vec<PathValidationResult>>,
    failures: Mutex<Vec<PathValidationResult>>,
}

/// Serializable totals of a [`ValidationReport`]
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub validated: usize,
    pub failed: usize,
    pub failures: Vec<PathValidationResult>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validated(&self) -> Vec<PathValidationResult> {
        self.validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failures(&self) -> Vec<PathValidationResult> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self) -> ValidationSummary {
        let validated = self
            .validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let failures = self.failures();
        ValidationSummary {
            validated,
            failed: failures.len(),
            failures,
        }
    }
}

impl ValidationResultSink for ValidationReport {
    fn record_validated(&self, result: PathValidationResult) {
        self.validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    fn record_validation_failure(&self, result: PathValidationResult) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }
}
