//! Graceful Shutdown Module
//!
//! Turns SIGINT/SIGTERM into a broadcast that long-running commands select on.

use crate::{MonitorError, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Fans a single shutdown request out to every subscriber
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);
        Self { shutdown_sender }
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown_sender.subscribe())
    }

    /// Wait for SIGINT or SIGTERM, then broadcast shutdown
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                MonitorError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                MonitorError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }

        self.initiate_shutdown();
        Ok(())
    }

    pub fn initiate_shutdown(&self) {
        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }
    }
}

/// Shutdown signal wrapper for components
#[derive(Debug)]
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Resolves once shutdown is broadcast or the coordinator is gone
    pub async fn wait_for_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        // Closed and lagged both mean no further signal can arrive
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}
