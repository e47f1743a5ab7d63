//! Persisted run records and the registry document that holds them.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ward_core::unix_seconds_to_rfc3339;

/// Lifecycle states for a tracked background run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub task: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub parent_session_key: String,
    #[serde(default)]
    pub origin_channel: String,
    #[serde(default)]
    pub origin_chat_id: String,
    pub status: RunStatus,
    pub created_at: f64,
    #[serde(default)]
    pub completed_at: Option<f64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub(crate) fn started(registration: RunRegistration, now: f64) -> Self {
        Self {
            run_id: registration.run_id,
            task: registration.task,
            label: registration.label,
            parent_session_key: registration.parent_session_key,
            origin_channel: registration.origin_channel,
            origin_chat_id: registration.origin_chat_id,
            status: RunStatus::Running,
            created_at: now,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Moves a running record to its terminal state. Returns false when it already left `running`.
    pub(crate) fn finish(&mut self, completion: RunCompletion, now: f64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = completion.status;
        self.completed_at = Some(now);
        self.result = completion.result;
        self.error = completion.error;
        true
    }

    /// Timestamp the retention sweep ages a terminal record by.
    pub(crate) fn finished_at(&self) -> f64 {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Persisted state of one registry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(rename = "runs", default)]
    pub records: BTreeMap<String, RunRecord>,
    #[serde(default)]
    pub last_updated: f64,
    #[serde(default)]
    pub last_updated_iso: String,
}

impl RegistryDocument {
    pub(crate) fn stamp(&mut self, now: f64) {
        self.last_updated = now;
        self.last_updated_iso = unix_seconds_to_rfc3339(now);
    }

    pub(crate) fn running_ids(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|record| record.status == RunStatus::Running)
            .map(|record| record.run_id.clone())
            .collect()
    }
}

/// Input payload used to register a new run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRegistration {
    pub run_id: String,
    pub task: String,
    pub label: String,
    pub parent_session_key: String,
    pub origin_channel: String,
    pub origin_chat_id: String,
}

impl RunRegistration {
    pub fn new(run_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Terminal outcome reported for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl RunCompletion {
    pub fn completed(result: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Completed,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}
