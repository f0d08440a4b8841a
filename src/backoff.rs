//! Backoff Policy Module
//!
//! Decides whether new writes into the mount should be held back, given the
//! current multipart upload count, established connection count and pending
//! upload queue depth.

use crate::log_signals::QueueDepth;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Limits at which writes should back off. Each limit triggers independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffThresholds {
    #[serde(default = "default_max_multipart_uploads")]
    pub max_multipart_uploads: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u64,
}

fn default_max_multipart_uploads() -> u64 {
    2
}

fn default_max_connections() -> u64 {
    10
}

fn default_max_queue_depth() -> u64 {
    10
}

impl Default for BackoffThresholds {
    fn default() -> Self {
        Self {
            max_multipart_uploads: default_max_multipart_uploads(),
            max_connections: default_max_connections(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

/// Live signals fed into the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackoffSignals {
    pub multipart_uploads: u64,
    pub connections: u64,
    pub queue_depth: QueueDepth,
}

/// The first threshold found to be met
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReason {
    MultipartUploads { current: u64, limit: u64 },
    Connections { current: u64, limit: u64 },
    QueueDepth { current: u64, limit: u64 },
}

impl fmt::Display for BackoffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffReason::MultipartUploads { current, limit } => write!(
                f,
                "currentMultipartUploads={} and backoffWhenMultipartUploads={}",
                current, limit
            ),
            BackoffReason::Connections { current, limit } => write!(
                f,
                "latestHTTPSConnTotal={} and backoffWhenTotalHTTPSConns={}",
                current, limit
            ),
            BackoffReason::QueueDepth { current, limit } => write!(
                f,
                "currentS3UploadSize={} and backoffWhenTotalS3Uploads={}",
                current, limit
            ),
        }
    }
}

/// Check thresholds in the order multipart, connections, queue depth.
///
/// Returns the first one met. An unknown queue depth is no signal and never
/// triggers backoff.
pub fn evaluate_backoff(
    signals: &BackoffSignals,
    thresholds: &BackoffThresholds,
) -> Option<BackoffReason> {
    debug!("Latest s3_queue size = {}", signals.queue_depth);
    debug!("Latest outgoing HTTPS connections = {}", signals.connections);
    debug!("Latest multipart uploads = {}", signals.multipart_uploads);

    let reason = if signals.multipart_uploads >= thresholds.max_multipart_uploads {
        Some(BackoffReason::MultipartUploads {
            current: signals.multipart_uploads,
            limit: thresholds.max_multipart_uploads,
        })
    } else if signals.connections >= thresholds.max_connections {
        Some(BackoffReason::Connections {
            current: signals.connections,
            limit: thresholds.max_connections,
        })
    } else {
        match signals.queue_depth {
            QueueDepth::Known(depth) if depth >= thresholds.max_queue_depth => {
                Some(BackoffReason::QueueDepth {
                    current: depth,
                    limit: thresholds.max_queue_depth,
                })
            }
            _ => None,
        }
    };

    if let Some(reason) = &reason {
        debug!("writes_should_backoff() {}", reason);
    }

    reason
}
