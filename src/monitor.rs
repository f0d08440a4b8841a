//! Upload Monitor Module
//!
//! Background sampler for a yas3fs mount. Every `check_interval` it re-reads the
//! tail of the yas3fs log and probes the established connection count, keeping
//! the latest values in a shared [`MonitorState`]. Callers ask the monitor
//! whether writes should back off, whether uploads have gone idle and which
//! write failures are visible in the log.
//!
//! A failed step never stops the loop: a log read error keeps the previous
//! snapshot and a failed probe keeps the previous connection count.

use crate::backoff::{evaluate_backoff, BackoffReason, BackoffSignals, BackoffThresholds};
use crate::config::MonitorConfig;
use crate::connection_probe::ConnectionSampler;
use crate::log_signals::{
    extract_multipart_uploads, extract_queue_depth, LogSignalExtractor, QueueDepth,
    WriteMonitorError,
};
use crate::upload_history::UploadHistoryWindow;
use crate::{MonitorError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Tail of the log captured at one point in time. Replaced wholesale on refresh.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

/// Latest samples shared between the background loop and callers.
///
/// Each field is read atomically on its own; a caller reading several fields may
/// see values from different cycles.
#[derive(Debug)]
pub struct MonitorState {
    snapshot: RwLock<Option<Arc<LogSnapshot>>>,
    connection_count: AtomicU64,
    history: Mutex<UploadHistoryWindow>,
}

impl MonitorState {
    pub fn new(idle_window: usize) -> Self {
        Self {
            snapshot: RwLock::new(None),
            connection_count: AtomicU64::new(0),
            history: Mutex::new(UploadHistoryWindow::new(idle_window)),
        }
    }

    /// Latest log snapshot, if one has been captured yet
    pub fn snapshot(&self) -> Option<Arc<LogSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace_snapshot(&self, snapshot: LogSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Acquire)
    }

    pub fn set_connection_count(&self, count: u64) {
        self.connection_count.store(count, Ordering::Release);
    }

    /// Push a queue depth sample into the idle history and report completion
    pub fn record_queue_depth(&self, sample: QueueDepth) -> bool {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_and_check_complete(sample)
    }
}

/// One refresh of the shared state: log tail, then connection probe
#[derive(Debug)]
struct MonitorCycle<C> {
    log_file: PathBuf,
    tail_bytes: u64,
    state: Arc<MonitorState>,
    sampler: C,
}

impl<C: ConnectionSampler> MonitorCycle<C> {
    async fn run(&self) {
        match read_log_tail(&self.log_file, self.tail_bytes).await {
            Ok(text) => {
                self.state.replace_snapshot(LogSnapshot {
                    text,
                    captured_at: Utc::now(),
                });
            }
            Err(e) => {
                error!(
                    "Unexpected error tailing yas3fs log {}: {}",
                    self.log_file.display(),
                    e
                );
            }
        }

        match self.sampler.sample().await {
            Ok(total) => {
                debug!("Latest total of outgoing HTTPS connections = {}", total);
                self.state.set_connection_count(total);
            }
            Err(e) => {
                error!(
                    "Connection probe failed, keeping last count {}: {}",
                    self.state.connection_count(),
                    e
                );
            }
        }
    }
}

/// Read at most `tail_bytes` from the end of `path`
pub async fn read_log_tail(path: &Path, tail_bytes: u64) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(tail_bytes);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(tail_bytes).read_to_end(&mut buf).await?;

    // The window may start mid-character
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Monitors yas3fs upload activity for write backpressure and idle detection
#[derive(Debug)]
pub struct UploadMonitor<C: ConnectionSampler> {
    check_interval: Duration,
    thresholds: BackoffThresholds,
    extractor: LogSignalExtractor,
    state: Arc<MonitorState>,
    cycle: Arc<MonitorCycle<C>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<C: ConnectionSampler> UploadMonitor<C> {
    /// Create a stopped monitor. Fails if an error pattern does not compile.
    pub fn new(config: &MonitorConfig, thresholds: BackoffThresholds, sampler: C) -> Result<Self> {
        let extractor = LogSignalExtractor::from_patterns(&config.error_patterns)?;
        let state = Arc::new(MonitorState::new(config.idle_window));

        let cycle = Arc::new(MonitorCycle {
            log_file: config.log_file.clone(),
            tail_bytes: config.tail_bytes,
            state: state.clone(),
            sampler,
        });

        Ok(Self {
            check_interval: config.check_interval,
            thresholds,
            extractor,
            state,
            cycle,
            shutdown_tx: None,
            task: None,
        })
    }

    /// Spawn the background sampling loop
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(MonitorError::InvalidState(
                "upload monitor is already running".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(MonitorError::ConfigError(
                "check interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let cycle = self.cycle.clone();
        let period = self.check_interval;

        self.task = Some(tokio::spawn(async move {
            info!(
                "Starting upload monitor for {} (interval: {:?})",
                cycle.log_file.display(),
                period
            );

            // Sleep first, then sample
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cycle.run().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Upload monitor shutting down");
                        break;
                    }
                }
            }

            info!("Upload monitor stopped");
        }));

        Ok(())
    }

    /// Stop the background loop and wait for it to exit
    pub async fn destroy(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Upload monitor task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Run one sampling cycle immediately, outside the schedule
    pub async fn refresh_once(&self) {
        self.cycle.run().await;
    }

    pub fn state(&self) -> &Arc<MonitorState> {
        &self.state
    }

    pub fn latest_snapshot(&self) -> Option<Arc<LogSnapshot>> {
        self.state.snapshot()
    }

    /// Queue depth derived from the current snapshot
    pub fn queue_depth(&self) -> QueueDepth {
        self.state
            .snapshot()
            .map_or(QueueDepth::Unknown, |s| extract_queue_depth(&s.text))
    }

    /// Multipart uploads in flight per the current snapshot
    pub fn multipart_uploads(&self) -> u64 {
        self.state
            .snapshot()
            .map_or(0, |s| extract_multipart_uploads(&s.text))
    }

    pub fn connection_count(&self) -> u64 {
        self.state.connection_count()
    }

    /// First threshold met by the live signals, if any
    pub fn backoff_reason(&self) -> Option<BackoffReason> {
        let snapshot = self.state.snapshot();
        let text = snapshot.as_deref().map_or("", |s| s.text.as_str());

        let signals = BackoffSignals {
            multipart_uploads: extract_multipart_uploads(text),
            connections: self.state.connection_count(),
            queue_depth: extract_queue_depth(text),
        };

        evaluate_backoff(&signals, &self.thresholds)
    }

    /// Whether new writes should be held back right now
    pub fn should_backoff(&self) -> bool {
        self.backoff_reason().is_some()
    }

    /// Record the current queue depth and report whether uploads have been idle
    /// for the whole confirmation window
    pub fn writes_are_complete(&self) -> bool {
        let depth = self.queue_depth();
        self.state.record_queue_depth(depth)
    }

    /// Write failures visible in the current snapshot
    pub fn write_errors(&self) -> BTreeSet<WriteMonitorError> {
        debug!("write_errors() checking for errors in yas3fs log");
        self.state
            .snapshot()
            .map(|s| self.extractor.write_errors(&s.text))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Seek, Write};
    use tempfile::NamedTempFile;

    /// Replays scripted probe results, repeating the last one
    struct ScriptedSampler {
        results: Mutex<VecDeque<Result<u64>>>,
    }

    impl ScriptedSampler {
        fn new(results: Vec<Result<u64>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
            }
        }
    }

    impl ConnectionSampler for ScriptedSampler {
        async fn sample(&self) -> Result<u64> {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().cloned().unwrap_or(Ok(0))
            }
        }
    }

    fn config_for(log_file: &Path) -> MonitorConfig {
        MonitorConfig {
            log_file: log_file.to_path_buf(),
            check_interval: Duration::from_millis(20),
            idle_window: 2,
            ..MonitorConfig::default()
        }
    }

    fn write_log(file: &mut NamedTempFile, text: &str) {
        file.as_file_mut().set_len(0).unwrap();
        file.rewind().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    const BUSY_LOG: &str = "\
2014-10-22 19:11:20,001 INFO entries, mem_size, disk_size, download_queue, prefetch_queue, s3_queue: 1, 0, 0, 0, 0, 12
2014-10-22 19:11:21,001 DEBUG multipart_uploads_in_progress = 1
";

    const IDLE_LOG: &str = "\
2014-10-22 19:12:20,001 INFO entries, mem_size, disk_size, download_queue, prefetch_queue, s3_queue: 0, 0, 0, 0, 0, 0
";

    #[tokio::test]
    async fn test_no_snapshot_yields_no_signal() {
        let log = NamedTempFile::new().unwrap();
        let monitor = UploadMonitor::new(
            &config_for(log.path()),
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![Ok(0)]),
        )
        .unwrap();

        assert_eq!(monitor.queue_depth(), QueueDepth::Unknown);
        assert_eq!(monitor.multipart_uploads(), 0);
        assert!(!monitor.should_backoff());
        assert!(monitor.write_errors().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_updates_signals() {
        let mut log = NamedTempFile::new().unwrap();
        write_log(&mut log, BUSY_LOG);

        let monitor = UploadMonitor::new(
            &config_for(log.path()),
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![Ok(3)]),
        )
        .unwrap();
        monitor.refresh_once().await;

        assert_eq!(monitor.queue_depth(), QueueDepth::Known(12));
        assert_eq!(monitor.multipart_uploads(), 1);
        assert_eq!(monitor.connection_count(), 3);
        assert!(matches!(
            monitor.backoff_reason(),
            Some(BackoffReason::QueueDepth { current: 12, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_last_count() {
        let mut log = NamedTempFile::new().unwrap();
        write_log(&mut log, IDLE_LOG);

        let monitor = UploadMonitor::new(
            &config_for(log.path()),
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![
                Ok(11),
                Err(MonitorError::ProcessError("exitCode=1".to_string())),
            ]),
        )
        .unwrap();

        monitor.refresh_once().await;
        assert_eq!(monitor.connection_count(), 11);
        assert!(monitor.should_backoff());

        monitor.refresh_once().await;
        assert_eq!(monitor.connection_count(), 11);
    }

    #[tokio::test]
    async fn test_missing_log_keeps_previous_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("yas3fs.log");
        std::fs::write(&path, BUSY_LOG).unwrap();

        let monitor = UploadMonitor::new(
            &config_for(&path),
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![Ok(0)]),
        )
        .unwrap();

        monitor.refresh_once().await;
        std::fs::remove_file(&path).unwrap();
        monitor.refresh_once().await;

        assert_eq!(monitor.queue_depth(), QueueDepth::Known(12));
    }

    #[tokio::test]
    async fn test_writes_complete_after_idle_window() {
        let mut log = NamedTempFile::new().unwrap();
        write_log(&mut log, BUSY_LOG);

        let monitor = UploadMonitor::new(
            &config_for(log.path()),
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![Ok(0)]),
        )
        .unwrap();

        monitor.refresh_once().await;
        assert!(!monitor.writes_are_complete());

        write_log(&mut log, IDLE_LOG);
        monitor.refresh_once().await;
        assert!(!monitor.writes_are_complete());
        assert!(monitor.writes_are_complete());
    }

    #[tokio::test]
    async fn test_read_log_tail_is_bounded() {
        let mut log = NamedTempFile::new().unwrap();
        let filler = "x".repeat(1000);
        write_log(&mut log, &format!("{}\n{}", filler, IDLE_LOG));

        let tail = read_log_tail(log.path(), 200).await.unwrap();
        assert_eq!(tail.len(), 200);
        assert!(tail.ends_with(IDLE_LOG));

        let whole = read_log_tail(log.path(), 1 << 20).await.unwrap();
        assert_eq!(whole.len(), 1001 + IDLE_LOG.len());
    }

    #[tokio::test]
    async fn test_start_and_destroy() {
        let mut log = NamedTempFile::new().unwrap();
        write_log(&mut log, BUSY_LOG);

        let mut monitor = UploadMonitor::new(
            &config_for(log.path()),
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![Ok(4)]),
        )
        .unwrap();

        monitor.start().unwrap();
        assert!(monitor.is_running());
        assert!(matches!(
            monitor.start(),
            Err(MonitorError::InvalidState(_))
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.queue_depth(), QueueDepth::Known(12));
        assert_eq!(monitor.connection_count(), 4);

        monitor.destroy().await;
        assert!(!monitor.is_running());
    }

    /// Fails every probe, counting the attempts
    #[derive(Default)]
    struct FailingSampler {
        calls: Arc<AtomicU64>,
    }

    impl ConnectionSampler for FailingSampler {
        async fn sample(&self) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(MonitorError::TimeoutError("netstat hung".to_string()))
        }
    }

    #[tokio::test]
    async fn test_loop_survives_failing_cycles() {
        let dir = tempfile::TempDir::new().unwrap();
        let sampler = FailingSampler::default();
        let calls = sampler.calls.clone();

        let mut monitor = UploadMonitor::new(
            &config_for(&dir.path().join("missing.log")),
            BackoffThresholds::default(),
            sampler,
        )
        .unwrap();

        monitor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(monitor.is_running());
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(monitor.latest_snapshot().is_none());
        assert_eq!(monitor.connection_count(), 0);
        assert!(!monitor.should_backoff());

        monitor.destroy().await;
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_invalid_error_pattern_rejected() {
        let config = MonitorConfig {
            error_patterns: vec!["(no groups".to_string()],
            ..MonitorConfig::default()
        };
        assert!(UploadMonitor::new(
            &config,
            BackoffThresholds::default(),
            ScriptedSampler::new(vec![Ok(0)])
        )
        .is_err());
    }
}
