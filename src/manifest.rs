//! Manifest Module
//!
//! Manifest (TOC) entries describe what the mirror is expected to contain. The
//! binary reads them from a JSON-lines file, one entry per line:
//!
//! ```text
//! {"path": "/photos/2014/a.jpg", "size": 52133, "is_directory": false}
//! {"path": "/photos/2014", "size": 0, "is_directory": true}
//! ```

use crate::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// One expected path in the mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub is_directory: bool,
}

impl ManifestEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            is_directory: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            is_directory: true,
        }
    }
}

/// Parse JSON-lines manifest text. Blank lines and `#` comments are skipped.
pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| {
                MonitorError::ParseError(format!("manifest line {}: {}", idx + 1, e))
            })
        })
        .collect()
}

/// Read a JSON-lines manifest file
pub async fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        MonitorError::IoError(format!("Failed to read manifest {}: {}", path.display(), e))
    })?;
    let entries = parse_manifest(&content)?;
    info!("Loaded {} manifest entries from {}", entries.len(), path.display());
    Ok(entries)
}
