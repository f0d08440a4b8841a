//! Property-based tests for log signal extraction, backoff and idle detection
//!
//! Logs are generated as interleavings of queue lines, multipart lines and
//! unrelated noise, then checked against a straightforward model of the same
//! rules: the last matching line wins, absent lines fall back to their
//! defaults, and backoff is raised exactly when some threshold is met.

use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};
use s3_sync_monitor::backoff::{evaluate_backoff, BackoffSignals, BackoffThresholds};
use s3_sync_monitor::log_signals::{
    extract_multipart_uploads, extract_queue_depth, LogSignalExtractor, QueueDepth,
};
use s3_sync_monitor::upload_history::UploadHistoryWindow;

#[derive(Debug, Clone)]
enum LogLine {
    Queue(u64),
    Multipart(u64),
    Noise(u8),
}

impl LogLine {
    fn render(&self, second: usize) -> String {
        let ts = format!("2014-10-22 19:{:02}:{:02},{:03}", second / 60 % 60, second % 60, second % 1000);
        match self {
            LogLine::Queue(depth) => format!(
                "{} INFO entries, mem_size, disk_size, download_queue, prefetch_queue, s3_queue: 12, 3, 0, 0, 0, {}",
                ts, depth
            ),
            LogLine::Multipart(count) => {
                format!("{} DEBUG multipart_uploads_in_progress = {}", ts, count)
            }
            LogLine::Noise(n) => format!("{} INFO readdir '/photos/{}'", ts, n),
        }
    }
}

impl Arbitrary for LogLine {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 3 {
            0 => LogLine::Queue(u64::arbitrary(g) % 50),
            1 => LogLine::Multipart(u64::arbitrary(g) % 8),
            _ => LogLine::Noise(u8::arbitrary(g)),
        }
    }
}

fn render_log(lines: &[LogLine]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| line.render(i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn prop_last_queue_line_wins(lines: Vec<LogLine>) -> bool {
    let expected = lines
        .iter()
        .rev()
        .find_map(|l| match l {
            LogLine::Queue(d) => Some(QueueDepth::Known(*d)),
            _ => None,
        })
        .unwrap_or(QueueDepth::Unknown);

    extract_queue_depth(&render_log(&lines)) == expected
}

fn prop_last_multipart_line_wins(lines: Vec<LogLine>) -> bool {
    let expected = lines
        .iter()
        .rev()
        .find_map(|l| match l {
            LogLine::Multipart(c) => Some(*c),
            _ => None,
        })
        .unwrap_or(0);

    extract_multipart_uploads(&render_log(&lines)) == expected
}

fn prop_extractor_agrees_with_free_functions(lines: Vec<LogLine>) -> bool {
    let text = render_log(&lines);
    let signals = LogSignalExtractor::default().extract(&text);

    signals.queue_depth == extract_queue_depth(&text)
        && signals.multipart_uploads == extract_multipart_uploads(&text)
        && signals.errors.is_empty()
}

fn prop_backoff_iff_threshold_met(
    multipart: u8,
    connections: u8,
    queue: Option<u8>,
    limits: (u8, u8, u8),
) -> bool {
    let thresholds = BackoffThresholds {
        max_multipart_uploads: limits.0 as u64,
        max_connections: limits.1 as u64,
        max_queue_depth: limits.2 as u64,
    };
    let queue_depth = queue.map_or(QueueDepth::Unknown, |q| QueueDepth::Known(q as u64));
    let signals = BackoffSignals {
        multipart_uploads: multipart as u64,
        connections: connections as u64,
        queue_depth,
    };

    let expected = multipart as u64 >= thresholds.max_multipart_uploads
        || connections as u64 >= thresholds.max_connections
        || queue.is_some_and(|q| q as u64 >= thresholds.max_queue_depth);

    evaluate_backoff(&signals, &thresholds).is_some() == expected
}

fn prop_idle_after_window_of_zeros(depths: Vec<u8>, window: u8) -> TestResult {
    let window = (window % 6) as usize + 1;
    let mut history = UploadHistoryWindow::new(window);

    for (i, raw) in depths.iter().enumerate() {
        // Mostly zeros so idle streaks actually occur
        let depth = if raw % 3 == 0 { *raw as u64 % 4 } else { 0 };
        let complete = history.record_and_check_complete(QueueDepth::Known(depth));

        let seen = &depths[..=i];
        let newest_zero = seen
            .iter()
            .rev()
            .take(window)
            .all(|r| (if r % 3 == 0 { *r as u64 % 4 } else { 0 }) == 0);
        let expected = seen.len() > window && newest_zero;

        if complete != expected {
            return TestResult::failed();
        }
    }

    TestResult::passed()
}

#[test]
fn test_last_queue_line_wins() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop_last_queue_line_wins as fn(Vec<LogLine>) -> bool);
}

#[test]
fn test_last_multipart_line_wins() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(prop_last_multipart_line_wins as fn(Vec<LogLine>) -> bool);
}

#[test]
fn test_extractor_agrees_with_free_functions() {
    QuickCheck::new()
        .tests(100)
        .quickcheck(prop_extractor_agrees_with_free_functions as fn(Vec<LogLine>) -> bool);
}

#[test]
fn test_backoff_iff_threshold_met() {
    QuickCheck::new().tests(500).quickcheck(
        prop_backoff_iff_threshold_met as fn(u8, u8, Option<u8>, (u8, u8, u8)) -> bool,
    );
}

#[test]
fn test_idle_after_window_of_zeros() {
    QuickCheck::new()
        .tests(300)
        .quickcheck(prop_idle_after_window_of_zeros as fn(Vec<u8>, u8) -> TestResult);
}

#[test]
fn test_unknown_queue_never_completes() {
    let mut history = UploadHistoryWindow::new(2);
    for _ in 0..10 {
        assert!(!history.record_and_check_complete(QueueDepth::Unknown));
    }
}
