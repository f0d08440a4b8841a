//! Connection Probe Module
//!
//! Counts established outbound connections to the object store port by running a
//! diagnostic command (`netstat -na` by default) and scanning its output.
//! The sampler is a trait so the monitor loop can be driven by a fake in tests.

use crate::{MonitorError, Result};
use regex::Regex;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

/// Source of the current established connection count
pub trait ConnectionSampler: Send + Sync + 'static {
    /// Take one sample. Errors leave the caller's last known count untouched.
    fn sample(&self) -> impl Future<Output = Result<u64>> + Send;
}

/// Samples connections by executing an external command once per call
#[derive(Debug, Clone)]
pub struct NetstatSampler {
    program: String,
    args: Vec<String>,
    port: u16,
    timeout: Duration,
    marker: Regex,
}

impl NetstatSampler {
    pub fn new(program: impl Into<String>, args: Vec<String>, port: u16, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            port,
            timeout,
            marker: established_marker(port),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl Default for NetstatSampler {
    fn default() -> Self {
        Self::new("netstat", vec!["-na".to_string()], 443, Duration::from_secs(5))
    }
}

impl ConnectionSampler for NetstatSampler {
    async fn sample(&self) -> Result<u64> {
        let cmd_line = self.command_line();
        trace!("Executing: {}", cmd_line);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                MonitorError::TimeoutError(format!(
                    "{} did not finish within {:?}",
                    cmd_line, self.timeout
                ))
            })?
            .map_err(|e| {
                MonitorError::ProcessError(format!("failed to execute {}: {}", cmd_line, e))
            })?;

        if !output.status.success() {
            return Err(MonitorError::ProcessError(format!(
                "connection probe failed: exitCode={:?} cmd={}",
                output.status.code(),
                cmd_line
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let total = self.marker.find_iter(&stdout).count() as u64;
        trace!("Latest total of established connections on port {} = {}", self.port, total);
        Ok(total)
    }
}

/// Matches `<addr>:443   ESTABLISHED` (Linux) and `<addr>.443   ESTABLISHED` (BSD)
fn established_marker(port: u16) -> Regex {
    Regex::new(&format!(r"[:.]{}\s+ESTABLISHED", port)).expect("port marker pattern is valid")
}

/// Count established connections to `port` in netstat-style output
pub fn count_established_connections(output: &str, port: u16) -> u64 {
    established_marker(port).find_iter(output).count() as u64
}
