//! Diagnostics collaborator: best-effort log and crash-report collection.
//!
//! Diagnostics are supplementary to a session, never required for its
//! validity: a failing [`DiagnosticsSink`] is recorded in the session's
//! warnings and does not fail the operation that triggered collection.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors from the diagnostics collaborator. Always non-fatal to the caller.
#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("diagnostics collection failed: {0}")]
    Collect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract contract for collecting diagnostic artifacts for one device.
///
/// Artifacts are keyed by a short source name (`"system_log"`,
/// `"crash_MyApp-2024-01-01"` and so on) mapping to a file path.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn collect(&self, udid: &str) -> Result<HashMap<String, PathBuf>, DiagnosticsError>;
}

/// Collects the simulator's system log and crash reports from the
/// CoreSimulator log directory (`~/Library/Logs/CoreSimulator/<udid>/`).
pub struct SimulatorLogSink {
    root: PathBuf,
}

impl SimulatorLogSink {
    pub fn new() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("Library/Logs/CoreSimulator");
        Self { root }
    }

    /// Uses an alternate log root. Intended for tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SimulatorLogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiagnosticsSink for SimulatorLogSink {
    async fn collect(&self, udid: &str) -> Result<HashMap<String, PathBuf>, DiagnosticsError> {
        let device_dir = self.root.join(udid);
        let mut artifacts = HashMap::new();

        if !device_dir.is_dir() {
            debug!(udid, dir = %device_dir.display(), "no log directory for device");
            return Ok(artifacts);
        }

        let system_log = device_dir.join("system.log");
        if system_log.is_file() {
            artifacts.insert("system_log".to_string(), system_log);
        }

        let crash_dir = device_dir.join("CrashReporter");
        if crash_dir.is_dir() {
            for entry in std::fs::read_dir(&crash_dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    artifacts.insert(format!("crash_{}", stem), path);
                }
            }
        }

        debug!(udid, count = artifacts.len(), "collected diagnostics");
        Ok(artifacts)
    }
}
