//! Consistency Validator Module
//!
//! Proves that a manifest entry made it into the mirror: on the local mount, in
//! the bucket, or both. Every check yields a [`PathValidationResult`]; errors
//! are folded into failure results instead of being returned to the caller.
//!
//! The local check polls for the path a few times before giving up, since a
//! freshly written file may take a moment to show up on an eventually
//! consistent mount.

use crate::config::ValidationConfig;
use crate::manifest::ManifestEntry;
use crate::object_store::ObjectMetadataStore;
use crate::validation_result::{CheckId, PathValidationResult, ValidationResultSink};
use crate::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Where a manifest entry must be found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    #[serde(alias = "local-only")]
    Local,
    #[serde(alias = "remote-only", alias = "s3")]
    Remote,
    #[serde(alias = "both-required")]
    Both,
    /// Local first; the bucket is consulted only when the local check fails
    #[serde(alias = "local-then-remote-fallback")]
    LocalThenRemote,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Local => "local",
            ValidationMode::Remote => "remote",
            ValidationMode::Both => "both",
            ValidationMode::LocalThenRemote => "local-then-remote",
        }
    }

    pub fn checks_remote(&self) -> bool {
        !matches!(self, ValidationMode::Local)
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local-only" => Ok(ValidationMode::Local),
            "remote" | "remote-only" | "s3" => Ok(ValidationMode::Remote),
            "both" | "both-required" => Ok(ValidationMode::Both),
            "local-then-remote" | "local-then-remote-fallback" => {
                Ok(ValidationMode::LocalThenRemote)
            }
            other => Err(MonitorError::ConfigError(format!(
                "unknown validation mode: {}",
                other
            ))),
        }
    }
}

/// Bounded polling for a local path to appear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause between attempts; none after the last one
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Join the mirror root and a manifest path, collapsing repeated separators
pub fn local_target_path(root: &str, manifest_path: &str) -> String {
    let joined = format!("{}/{}", root, manifest_path);
    let mut normalized = String::with_capacity(joined.len());
    let mut prev_sep = false;
    for c in joined.chars() {
        if c == '/' {
            if !prev_sep {
                normalized.push(c);
            }
            prev_sep = true;
        } else {
            normalized.push(c);
            prev_sep = false;
        }
    }
    normalized
}

/// Object key for a manifest entry: no leading separator, trailing separator for directories
pub fn remote_key(entry: &ManifestEntry) -> String {
    let mut key = entry
        .path
        .strip_prefix('/')
        .unwrap_or(&entry.path)
        .to_string();
    if entry.is_directory && !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// Validates manifest entries against the local mirror and the bucket
#[derive(Debug)]
pub struct ConsistencyValidator<S> {
    mode: ValidationMode,
    local_root: String,
    bucket: String,
    store: S,
    retry: RetryPolicy,
}

impl<S: ObjectMetadataStore> ConsistencyValidator<S> {
    pub fn new(
        mode: ValidationMode,
        local_root: impl Into<String>,
        bucket: impl Into<String>,
        store: S,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            mode,
            local_root: local_root.into(),
            bucket: bucket.into(),
            store,
            retry,
        }
    }

    pub fn from_config(config: &ValidationConfig, store: S) -> Self {
        Self::new(
            config.mode,
            config.local_root.to_string_lossy(),
            config.bucket.clone(),
            store,
            RetryPolicy {
                max_attempts: config.retry_attempts,
                interval: config.retry_interval,
            },
        )
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Validate one entry according to the configured mode
    pub async fn validate(&self, entry: &ManifestEntry) -> PathValidationResult {
        match self.mode {
            ValidationMode::Local => self.check_local(entry).await,
            ValidationMode::Remote => self.check_remote(entry).await,
            ValidationMode::Both => {
                // Both results are reported, so neither check short-circuits.
                // Combined results carry the resolved local path.
                let (local, remote) =
                    tokio::join!(self.check_local(entry), self.check_remote(entry));
                let message = format!("local[{}] s3[{}]", local.summary(), remote.summary());

                if local.success && remote.success {
                    PathValidationResult::ok(self.mode, local.path, CheckId::BothOk, message)
                } else {
                    error!("Validation failed for {}: {}", entry.path, message);
                    PathValidationResult::failed(
                        self.mode,
                        local.path,
                        CheckId::BothFailed,
                        message,
                    )
                }
            }
            ValidationMode::LocalThenRemote => {
                let local = self.check_local(entry).await;
                if local.success {
                    return local;
                }

                debug!(
                    "Local check failed for {} ({}), falling back to s3",
                    entry.path, local.check
                );
                let remote = self.check_remote(entry).await;
                if remote.success {
                    return remote;
                }

                let message = format!("local[{}] s3[{}]", local.summary(), remote.summary());
                error!("Validation failed for {}: {}", entry.path, message);
                PathValidationResult::failed(
                    self.mode,
                    local.path,
                    CheckId::FallbackFailed,
                    message,
                )
            }
        }
    }

    /// Validate one entry and route the outcome to `sink`
    pub async fn validate_into<K: ValidationResultSink + ?Sized>(
        &self,
        entry: &ManifestEntry,
        sink: &K,
    ) {
        sink.record(self.validate(entry).await);
    }

    /// Validate every entry, each on its own task, at most `max_concurrent` at once
    pub async fn validate_all<K>(
        self: &Arc<Self>,
        entries: Vec<ManifestEntry>,
        sink: Arc<K>,
        max_concurrent: usize,
    ) where
        K: ValidationResultSink + ?Sized + 'static,
    {
        let total = entries.len();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for entry in entries {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let validator = Arc::clone(self);
            let sink = Arc::clone(&sink);

            tasks.spawn(async move {
                let _permit = permit;
                validator.validate_into(&entry, sink.as_ref()).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Validation task ended abnormally: {}", e);
            }
        }

        info!("Validated {} manifest entries (mode: {})", total, self.mode);
    }

    /// Check the entry on the local mount
    pub async fn check_local(&self, entry: &ManifestEntry) -> PathValidationResult {
        let target = local_target_path(&self.local_root, &entry.path);

        match self.inspect_local(&target, entry).await {
            Ok(result) => result,
            Err(e) => {
                error!("Local validation exception for {}: {}", target, e);
                PathValidationResult::failed(
                    self.mode,
                    target,
                    CheckId::LocalError,
                    format!("exception: {}", e),
                )
            }
        }
    }

    async fn inspect_local(
        &self,
        target: &str,
        entry: &ManifestEntry,
    ) -> Result<PathValidationResult> {
        let Some(metadata) = self.wait_for_local(target).await? else {
            error!("File validation failed, does not exist! {}", target);
            return Ok(PathValidationResult::failed(
                self.mode,
                target,
                CheckId::LocalNotFound,
                format!("!exists after {} attempts", self.retry.max_attempts),
            ));
        };

        if entry.is_directory && !metadata.is_dir() {
            error!("File validation failed, not a directory! {}", target);
            return Ok(PathValidationResult::failed(
                self.mode,
                target,
                CheckId::LocalNotDirectory,
                "manifest entry is a directory but local path is not",
            ));
        }

        if metadata.is_file() && metadata.len() != entry.size {
            error!(
                "File validation failed, size mismatch! {} expected={} actual={}",
                target,
                entry.size,
                metadata.len()
            );
            return Ok(PathValidationResult::failed(
                self.mode,
                target,
                CheckId::LocalSizeMismatch,
                format!(
                    "size mismatch: expected={} actual={}",
                    entry.size,
                    metadata.len()
                ),
            ));
        }

        Ok(PathValidationResult::ok(
            self.mode,
            target,
            CheckId::LocalOk,
            "ok",
        ))
    }

    /// Poll for `target`, returning its metadata once it exists
    async fn wait_for_local(&self, target: &str) -> Result<Option<Metadata>> {
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            match tokio::fs::metadata(target).await {
                Ok(metadata) => return Ok(Some(metadata)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(
                        "{} does not exist yet (attempt {}/{})",
                        target, attempt, attempts
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.interval).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Check the entry in the bucket
    pub async fn check_remote(&self, entry: &ManifestEntry) -> PathValidationResult {
        let key = remote_key(entry);

        match self.store.head_object(&self.bucket, &key).await {
            Ok(None) => {
                error!("S3 validation failed, 404: s3://{}/{}", self.bucket, key);
                PathValidationResult::failed(
                    self.mode,
                    key,
                    CheckId::RemoteNotFound,
                    "404 not found",
                )
            }
            Err(e) => {
                error!("S3 validation exception for s3://{}/{}: {}", self.bucket, key, e);
                PathValidationResult::failed(
                    self.mode,
                    key,
                    CheckId::RemoteError,
                    format!("exception: {}", e),
                )
            }
            Ok(Some(meta)) if meta.size != entry.size => {
                error!(
                    "S3 validation failed, size mismatch! s3://{}/{} expected={} actual={}",
                    self.bucket, key, entry.size, meta.size
                );
                PathValidationResult::failed(
                    self.mode,
                    key,
                    CheckId::RemoteSizeMismatch,
                    format!(
                        "size mismatch: expected={} actual={}",
                        entry.size, meta.size
                    ),
                )
            }
            Ok(Some(_)) => PathValidationResult::ok(self.mode, key, CheckId::RemoteOk, "ok"),
        }
    }
}
