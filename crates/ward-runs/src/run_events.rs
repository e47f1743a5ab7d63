//! Append-only JSONL trail of run state transitions.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ward_core::{append_json_line, LogRotationPolicy};

use crate::run_record::RunStatus;

/// Kind of transition recorded in the event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Registered,
    Completed,
    Failed,
    Cleaned,
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub timestamp: f64,
    pub run_id: String,
    pub event: RunEventKind,
    pub status: RunStatus,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RunEventLog {
    path: PathBuf,
    rotation: LogRotationPolicy,
}

impl RunEventLog {
    pub(crate) fn new(path: PathBuf, rotation: LogRotationPolicy) -> Self {
        Self { path, rotation }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Appends events best-effort; failures are logged and dropped.
    pub(crate) fn append_all(&self, events: &[RunEventRecord]) {
        for event in events {
            if let Err(error) = append_json_line(&self.path, event, self.rotation) {
                tracing::warn!(
                    path = %self.path.display(),
                    run_id = %event.run_id,
                    error = %format!("{error:#}"),
                    "failed to append run event"
                );
                return;
            }
        }
    }
}

/// Reads every parseable event from an event log file, skipping malformed lines.
pub fn read_run_events(path: &Path) -> Vec<RunEventRecord> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<RunEventRecord>(line).ok())
        .collect()
}
