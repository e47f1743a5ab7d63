//! On-disk lock file contents and staleness classification.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use ward_core::current_unix_seconds;

use crate::process_probe::{host_identifier, owner_is_running};

static OWNER_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity written into a lock file by the process that holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(rename = "pid")]
    pub owner_pid: u32,
    pub created_at: f64,
    #[serde(rename = "hostname")]
    pub host_identifier: String,
    /// Distinguishes acquisitions made by the same process.
    #[serde(rename = "token", default)]
    pub owner_token: String,
}

impl LockRecord {
    /// Builds a fresh record for one acquisition by the current process.
    pub fn for_current_process() -> Self {
        Self {
            owner_pid: std::process::id(),
            created_at: current_unix_seconds(),
            host_identifier: host_identifier().to_string(),
            owner_token: next_owner_token(),
        }
    }

    /// Parses raw lock file bytes; empty and malformed contents are reported as stale reasons.
    pub fn parse(raw: &[u8]) -> Result<Self, StaleReason> {
        let text = String::from_utf8_lossy(raw);
        if text.trim().is_empty() {
            return Err(StaleReason::Empty);
        }
        let record = serde_json::from_str::<Self>(text.trim())
            .map_err(|error| StaleReason::Corrupt(error.to_string()))?;
        if record.owner_pid == 0 {
            return Err(StaleReason::Corrupt("lock record has pid 0".to_string()));
        }
        Ok(record)
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// True when `other` was written by the same acquisition as `self`.
    pub fn same_owner(&self, other: &Self) -> bool {
        self.owner_pid == other.owner_pid
            && self.host_identifier == other.host_identifier
            && self.owner_token == other.owner_token
    }

    /// True when this record was written on the current host.
    pub fn is_local(&self) -> bool {
        self.host_identifier == host_identifier()
    }

    /// Returns the stale reason when the owning process is gone or its pid was reused.
    ///
    /// Records from another host are never judged by pid.
    pub fn owner_staleness(&self) -> Option<StaleReason> {
        if self.is_local() && !owner_is_running(self.owner_pid, self.created_at) {
            return Some(StaleReason::DeadOwner {
                pid: self.owner_pid,
            });
        }
        None
    }
}

/// Unique per call within this process and across processes on one host.
pub(crate) fn next_owner_token() -> String {
    let owner_pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let sequence = OWNER_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{owner_pid}-{nanos:x}-{sequence}")
}

/// Why an existing lock file may be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    Empty,
    Corrupt(String),
    Unreadable(String),
    DeadOwner { pid: u32 },
}

impl StaleReason {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Empty => "lock_file_empty",
            Self::Corrupt(_) => "lock_file_corrupt",
            Self::Unreadable(_) => "lock_file_unreadable",
            Self::DeadOwner { .. } => "lock_owner_dead",
        }
    }

    /// Content problems may be a competitor mid-write; a dead owner is conclusive.
    pub fn is_content_problem(&self) -> bool {
        !matches!(self, Self::DeadOwner { .. })
    }
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "lock file is empty"),
            Self::Corrupt(detail) => write!(f, "lock file is corrupt: {detail}"),
            Self::Unreadable(detail) => write!(f, "lock file is unreadable: {detail}"),
            Self::DeadOwner { pid } => write!(f, "owner pid {pid} is not running"),
        }
    }
}
