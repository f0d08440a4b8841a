//! Log Signal Module
//!
//! Pure parsing of a yas3fs log tail into the signals the write monitor acts on:
//! the pending upload queue depth, the number of multipart uploads in flight and
//! timestamped write failures. Nothing in here touches the filesystem, so the
//! same text always yields the same signals.
//!
//! Lines consumed look like:
//!
//! ```text
//! 2014-10-22 19:11:28,100 INFO entries, mem_size, disk_size, download_queue, prefetch_queue, s3_queue: 1, 0, 0, 0, 0, 3
//! 2014-10-22 19:11:28,512 DEBUG multipart_uploads_in_progress = 2
//! 2014-10-22 19:11:29,799 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED
//! ```

use crate::{MonitorError, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Timestamp layout used by yas3fs log lines (`2014-10-22 19:11:29,799`)
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Failure marker emitted by yas3fs when an S3 command exhausted its retries
pub const DEFAULT_ERROR_PATTERN: &str =
    r"(\d{4}-\d{1,2}-\d{1,2}\s+\d{1,2}:\d{1,2}:\d{1,2},\d{3}).+(do_cmd_on_s3_now_w_retries FAILED.*)";

static QUEUE_DEPTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"s3_queue:\s*\d+,\s*\d+,\s*\d+,\s*\d+,\s*\d+,\s*(\d+)")
        .expect("s3_queue pattern is valid")
});

static MULTIPART_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}-\d{1,2}-\d{1,2}\s+\d{1,2}:\d{1,2}:\d{1,2},\d{3}.+multipart_uploads_in_progress\s+=\s+(\d+)",
    )
    .expect("multipart pattern is valid")
});

/// Pending upload queue depth as reported by the last `s3_queue:` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueueDepth {
    /// No `s3_queue:` line in the current snapshot
    Unknown,
    Known(u64),
}

impl QueueDepth {
    /// Raw value with `-1` standing in for [`QueueDepth::Unknown`]
    pub fn as_raw(self) -> i64 {
        match self {
            QueueDepth::Unknown => -1,
            QueueDepth::Known(depth) => i64::try_from(depth).unwrap_or(i64::MAX),
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, QueueDepth::Known(_))
    }
}

impl fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDepth::Unknown => write!(f, "unknown"),
            QueueDepth::Known(depth) => write!(f, "{}", depth),
        }
    }
}

/// A write failure found in the log tail
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WriteMonitorError {
    pub timestamp: NaiveDateTime,
    pub message: String,
}

/// A compiled error pattern. Group 1 captures the timestamp, group 2 the message.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    regex: Regex,
}

impl ErrorPattern {
    /// Compile an error pattern, rejecting patterns without the two capture groups
    pub fn compile(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)?;
        // captures_len counts the implicit whole-match group
        if regex.captures_len() < 3 {
            return Err(MonitorError::ConfigError(format!(
                "error pattern must capture a timestamp and a message: {}",
                pattern
            )));
        }
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

/// Signals derived from one log snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSignals {
    pub queue_depth: QueueDepth,
    pub multipart_uploads: u64,
    pub errors: BTreeSet<WriteMonitorError>,
}

/// Extracts upload signals from raw log text
#[derive(Debug, Clone)]
pub struct LogSignalExtractor {
    error_patterns: Vec<ErrorPattern>,
}

impl Default for LogSignalExtractor {
    fn default() -> Self {
        Self {
            error_patterns: vec![
                ErrorPattern::compile(DEFAULT_ERROR_PATTERN).expect("default error pattern is valid")
            ],
        }
    }
}

impl LogSignalExtractor {
    pub fn new(error_patterns: Vec<ErrorPattern>) -> Self {
        Self { error_patterns }
    }

    /// Build an extractor from pattern strings, failing on the first invalid one
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let error_patterns = patterns
            .iter()
            .map(|p| ErrorPattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(error_patterns))
    }

    pub fn error_patterns(&self) -> &[ErrorPattern] {
        &self.error_patterns
    }

    /// Run every extraction over the same text
    pub fn extract(&self, text: &str) -> LogSignals {
        LogSignals {
            queue_depth: extract_queue_depth(text),
            multipart_uploads: extract_multipart_uploads(text),
            errors: self.write_errors(text),
        }
    }

    /// Every match of every error pattern, de-duplicated.
    ///
    /// Matches whose timestamp does not parse are logged and skipped.
    pub fn write_errors(&self, text: &str) -> BTreeSet<WriteMonitorError> {
        let mut errors = BTreeSet::new();

        for pattern in &self.error_patterns {
            for caps in pattern.regex.captures_iter(text) {
                let (Some(raw_ts), Some(raw_msg)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };

                let raw_ts = raw_ts.as_str().trim();
                let message = raw_msg.as_str().trim().to_string();

                match parse_log_timestamp(raw_ts) {
                    Ok(timestamp) => {
                        debug!("Found write error: {} msg: {}", raw_ts, message);
                        errors.insert(WriteMonitorError { timestamp, message });
                    }
                    Err(e) => {
                        warn!(
                            "Skipping write error with malformed timestamp '{}': {}",
                            raw_ts, e
                        );
                    }
                }
            }
        }

        errors
    }
}

/// Queue depth from the last `s3_queue:` line, the sixth counter being the
/// pending uploads. [`QueueDepth::Unknown`] when no line matches.
pub fn extract_queue_depth(text: &str) -> QueueDepth {
    let mut depth = QueueDepth::Unknown;

    for caps in QUEUE_DEPTH_PATTERN.captures_iter(text) {
        match caps[1].parse::<u64>() {
            Ok(value) => depth = QueueDepth::Known(value),
            Err(e) => warn!("Skipping unparseable s3_queue value '{}': {}", &caps[1], e),
        }
    }

    depth
}

/// Multipart uploads in flight from the last `multipart_uploads_in_progress`
/// line. No line means none are in flight.
pub fn extract_multipart_uploads(text: &str) -> u64 {
    let mut in_progress = 0;

    for caps in MULTIPART_PATTERN.captures_iter(text) {
        match caps[1].parse::<u64>() {
            Ok(value) => in_progress = value,
            Err(e) => warn!(
                "Skipping unparseable multipart_uploads_in_progress value '{}': {}",
                &caps[1], e
            ),
        }
    }

    in_progress
}

/// Parse a yas3fs timestamp, tolerating runs of whitespace between date and time
pub fn parse_log_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, LOG_TIMESTAMP_FORMAT)
        .map_err(|e| MonitorError::ParseError(format!("bad log timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const QUEUE_LINE_A: &str = "2014-10-22 19:11:20,001 INFO entries, mem_size, disk_size, download_queue, prefetch_queue, s3_queue: 1, 0, 0, 0, 0, 7";
    const QUEUE_LINE_B: &str = "2014-10-22 19:11:30,001 INFO entries, mem_size, disk_size, download_queue, prefetch_queue, s3_queue: 4, 2, 9, 0, 0, 2";

    #[test]
    fn test_queue_depth_last_line_wins() {
        let text = format!("{}\n{}\n", QUEUE_LINE_A, QUEUE_LINE_B);
        assert_eq!(extract_queue_depth(&text), QueueDepth::Known(2));
    }

    #[test]
    fn test_queue_depth_unknown_without_match() {
        assert_eq!(extract_queue_depth(""), QueueDepth::Unknown);
        assert_eq!(
            extract_queue_depth("2014-10-22 19:11:20,001 INFO nothing to see\n"),
            QueueDepth::Unknown
        );
        assert_eq!(QueueDepth::Unknown.as_raw(), -1);
    }

    #[test]
    fn test_queue_depth_ignores_truncated_line() {
        // First line of a tail window is usually cut mid-way
        let text = format!("0, 0, 0, 0, 12\n{}\n", QUEUE_LINE_A);
        assert_eq!(extract_queue_depth(&text), QueueDepth::Known(7));
    }

    #[test]
    fn test_multipart_defaults_to_zero() {
        assert_eq!(extract_multipart_uploads(QUEUE_LINE_A), 0);
    }

    #[test]
    fn test_multipart_last_line_wins() {
        let text = "2014-10-22 19:11:20,001 DEBUG multipart_uploads_in_progress = 3\n\
                    2014-10-22 19:11:21,001 DEBUG multipart_uploads_in_progress = 1\n";
        assert_eq!(extract_multipart_uploads(text), 1);
    }

    #[test]
    fn test_multipart_requires_timestamp() {
        assert_eq!(extract_multipart_uploads("multipart_uploads_in_progress = 5"), 0);
    }

    #[test]
    fn test_write_errors_collects_every_match() {
        let text = "2014-10-22 19:11:29,799 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED upload a\n\
                    2014-10-22 19:11:31,002 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED upload b\n\
                    2014-10-22 19:11:29,799 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED upload a\n";
        let errors = LogSignalExtractor::default().write_errors(text);

        assert_eq!(errors.len(), 2);
        let first = errors.iter().next().unwrap();
        assert_eq!(first.message, "do_cmd_on_s3_now_w_retries FAILED upload a");
        assert_eq!(first.timestamp.year(), 2014);
        assert_eq!(first.timestamp.second(), 29);
        assert_eq!(first.timestamp.nanosecond(), 799_000_000);
    }

    #[test]
    fn test_write_errors_skips_malformed_timestamp() {
        let text = "2014-13-45 19:11:29,799 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED\n\
                    2014-10-22 19:11:31,002 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED\n";
        let errors = LogSignalExtractor::default().write_errors(text);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_custom_error_pattern() {
        let extractor = LogSignalExtractor::from_patterns(&[
            r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}).+(CRITICAL .*)",
        ])
        .unwrap();
        let text = "2020-01-02 03:04:05,006 CRITICAL disk full\n\
                    2020-01-02 03:04:06,006 ERROR PLUGIN do_cmd_on_s3_now_w_retries FAILED\n";
        let errors = extractor.write_errors(text);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.iter().next().unwrap().message, "CRITICAL disk full");
    }

    #[test]
    fn test_error_pattern_requires_two_groups() {
        assert!(ErrorPattern::compile(r"(\d+) FAILED").is_err());
        assert!(ErrorPattern::compile(r"(unclosed").is_err());
    }

    #[test]
    fn test_extract_is_deterministic() {
        let text = format!(
            "{}\n2014-10-22 19:11:21,001 DEBUG multipart_uploads_in_progress = 4\n{}\n",
            QUEUE_LINE_A, QUEUE_LINE_B
        );
        let extractor = LogSignalExtractor::default();
        let first = extractor.extract(&text);
        let second = extractor.extract(&text);
        assert_eq!(first, second);
        assert_eq!(first.queue_depth, QueueDepth::Known(2));
        assert_eq!(first.multipart_uploads, 4);
    }

    #[test]
    fn test_parse_log_timestamp_tolerates_spacing() {
        assert!(parse_log_timestamp("2014-10-22   19:11:29,799").is_ok());
        assert!(parse_log_timestamp("2014-1-2 3:04:05,000").is_ok());
        assert!(parse_log_timestamp("yesterday").is_err());
    }
}
