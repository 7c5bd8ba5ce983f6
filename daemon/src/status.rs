use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::health::HealthLevel;
use crate::paths::write_atomic;
use crate::presentation::{BuildRow, CycleSnapshot, MonitorState, PresentationSink};

/// Runtime status written by the daemon to `<home>/status.toml`.
/// Front ends read this file (read-only) to display build health.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: MonitorState,
    /// Overall health as of the last completed cycle.
    pub overall: HealthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub culprit: Option<String>,
    /// When the last cycle completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub builds: Vec<BuildRow>,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: MonitorState::Idle,
            overall: HealthLevel::Healthy,
            culprit: None,
            last_cycle_at: None,
            error: None,
            builds: Vec::new(),
        }
    }

    pub fn apply(&mut self, snapshot: &CycleSnapshot) {
        self.overall = snapshot.overall;
        self.culprit = Some(snapshot.culprit.clone()).filter(|c| !c.is_empty());
        self.last_cycle_at = Some(snapshot.completed_at);
        self.builds = snapshot.builds.clone();
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and atomically replaces the file at `path`.
/// Creates the parent directory if it does not exist.
pub fn write_status(path: &Path, status: &DaemonStatus) -> Result<()> {
    let content = toml::to_string_pretty(status).context("Failed to serialize status")?;
    write_atomic(path, &content)
        .with_context(|| format!("Failed to write status file: {}", path.display()))
}

/// Presentation sink that mirrors every cycle into the status file.
pub struct StatusFile {
    path: PathBuf,
    status: Mutex<DaemonStatus>,
}

impl StatusFile {
    /// Writes the initial status immediately. A failed write is logged,
    /// never fatal.
    pub fn create(path: PathBuf) -> Self {
        let status = DaemonStatus::new();
        if let Err(e) = write_status(&path, &status) {
            warn!("{e:#}");
        }
        Self {
            path,
            status: Mutex::new(status),
        }
    }

    pub fn set_error(&self, error: Option<String>) -> Result<()> {
        self.update(|s| s.error = error)
    }

    pub fn current(&self) -> DaemonStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, change: impl FnOnce(&mut DaemonStatus)) -> Result<()> {
        let snapshot = {
            let mut status = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            change(&mut *status);
            status.clone()
        };
        write_status(&self.path, &snapshot)
    }
}

// Writes happen synchronously on the polling task. The file is a few KB and
// is rewritten at most once per cycle and once per state change.
impl PresentationSink for StatusFile {
    fn publish_cycle(&self, snapshot: &CycleSnapshot) -> Result<()> {
        self.update(|s| {
            s.apply(snapshot);
            s.error = None;
        })
    }

    fn state_changed(&self, state: MonitorState) -> Result<()> {
        self.update(|s| s.state = state)
    }
}
