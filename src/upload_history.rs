//! Upload History Module
//!
//! Most-recent-first history of queue depth samples used to decide when the
//! mount has gone idle. Only the newest `window` samples are ever consulted, so
//! older samples are dropped instead of accumulating forever.

use crate::log_signals::QueueDepth;
use std::collections::VecDeque;
use tracing::debug;

/// Sliding window of queue depth samples
#[derive(Debug, Clone)]
pub struct UploadHistoryWindow {
    window: usize,
    /// Newest sample at the front
    samples: VecDeque<QueueDepth>,
    total_recorded: u64,
}

impl UploadHistoryWindow {
    /// Create a history that requires `window` consecutive zero samples to report idle
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(window + 1),
            total_recorded: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of samples recorded since creation, including dropped ones
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Retained samples, newest first
    pub fn samples(&self) -> impl Iterator<Item = QueueDepth> + '_ {
        self.samples.iter().copied()
    }

    /// Push a sample and report whether writes are complete.
    ///
    /// Complete means more than `window` samples have been recorded and the
    /// newest `window` of them are all known and sum to exactly zero. An
    /// unknown sample inside the window always blocks completion.
    pub fn record_and_check_complete(&mut self, sample: QueueDepth) -> bool {
        self.samples.push_front(sample);
        self.samples.truncate(self.window + 1);
        self.total_recorded += 1;

        if self.total_recorded <= self.window as u64 {
            debug!(
                "writes_are_complete() NO: {} of {} samples recorded",
                self.total_recorded, self.window
            );
            return false;
        }

        let mut pending: u64 = 0;
        for sample in self.samples.iter().take(self.window) {
            match sample {
                QueueDepth::Known(depth) => pending = pending.saturating_add(*depth),
                QueueDepth::Unknown => {
                    debug!("writes_are_complete() NO: queue depth unknown within window");
                    return false;
                }
            }
        }

        if pending == 0 {
            debug!("writes_are_complete() YES: count = 0");
            true
        } else {
            debug!("writes_are_complete() NO: count = {}", pending);
            false
        }
    }
}
