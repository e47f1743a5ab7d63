//! Restart-durable registry of background runs built on the atomic record store.
//!
//! Each mutating call re-reads the registry file under its process lock,
//! applies the change, and commits atomically, so several processes can share
//! one registry path. Reads serve the snapshot from the last load or commit.

mod registry_config;
mod run_events;
mod run_record;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use ward_core::{current_unix_seconds, is_older_than};
use ward_lock::LockError;
use ward_store::{JsonStore, Mutation, Snapshot, StoreError, Updated};

pub use registry_config::RunRegistryConfig;
pub use run_events::{read_run_events, RunEventKind, RunEventRecord};
pub use run_record::{RegistryDocument, RunCompletion, RunRecord, RunRegistration, RunStatus};
pub use ward_store::{CommitReport, LoadOutcome};

use run_events::RunEventLog;

const EVENT_DETAIL_MAX_CHARS: usize = 240;

/// Errors surfaced to registry callers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("run '{0}' is already registered")]
    DuplicateRun(String),
    #[error("run '{run_id}' cannot be completed with non-terminal status '{status}'")]
    InvalidTerminalStatus { run_id: String, status: RunStatus },
    #[error(transparent)]
    LockTimeout(#[from] LockError),
}

impl From<StoreError> for RegistryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::LockTimeout(inner) => Self::LockTimeout(inner),
        }
    }
}

/// What a registry found on disk when it was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    pub load_outcome: LoadOutcome,
    /// Runs still marked `running`, left behind by a process that did not finish them.
    pub orphaned_runs: Vec<String>,
}

impl OpenReport {
    pub fn has_orphaned_runs(&self) -> bool {
        !self.orphaned_runs.is_empty()
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RunStats {
    pub fn total(&self) -> usize {
        self.running + self.completed + self.failed
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub commit: CommitReport,
}

#[derive(Debug, Default)]
struct RegistryState {
    snapshot: RegistryDocument,
    /// Runs whose latest change has not reached disk yet.
    unpersisted: BTreeSet<String>,
}

/// Persistent tracker for background task runs.
#[derive(Debug)]
pub struct RunRegistry {
    config: RunRegistryConfig,
    store: JsonStore<RegistryDocument>,
    events: Option<RunEventLog>,
    open_report: OpenReport,
    state: Mutex<RegistryState>,
}

impl RunRegistry {
    /// Opens the registry at `config.registry_path`, loading whatever was last committed.
    ///
    /// Running records found here are reported in [`OpenReport::orphaned_runs`]
    /// and stay `running`; call [`RunRegistry::fail_orphaned_runs`] to close them.
    pub fn open(config: RunRegistryConfig) -> Self {
        let store: JsonStore<RegistryDocument> = JsonStore::new(config.registry_path.clone(), config.lock);
        let Snapshot { document, outcome } = store.load();
        let orphaned_runs = document.running_ids();
        if !orphaned_runs.is_empty() {
            tracing::warn!(
                path = %config.registry_path.display(),
                count = orphaned_runs.len(),
                run_ids = ?orphaned_runs,
                "registry holds running records from an earlier process; leaving them running"
            );
        }
        let events = config
            .event_log_enabled
            .then(|| RunEventLog::new(config.event_log_path(), config.event_log_rotation));

        Self {
            config,
            store,
            events,
            open_report: OpenReport {
                load_outcome: outcome,
                orphaned_runs,
            },
            state: Mutex::new(RegistryState {
                snapshot: document,
                unpersisted: BTreeSet::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunRegistryConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn open_report(&self) -> &OpenReport {
        &self.open_report
    }

    pub fn event_log_path(&self) -> Option<&Path> {
        self.events.as_ref().map(RunEventLog::path)
    }

    /// Inserts a new `running` record. Fails if the id already exists.
    pub fn register(&self, registration: RunRegistration) -> Result<CommitReport, RegistryError> {
        self.mutate(move |document, now| {
            if document.records.contains_key(&registration.run_id) {
                return Err(RegistryError::DuplicateRun(registration.run_id));
            }
            let record = RunRecord::started(registration, now);
            let event = run_event(&record, RunEventKind::Registered, now, &record.task);
            document.records.insert(record.run_id.clone(), record);
            Ok(vec![event])
        })
    }

    /// Moves a running record to `completion.status`.
    ///
    /// Unknown ids and runs that already finished are ignored with a warning.
    pub fn complete(
        &self,
        run_id: &str,
        completion: RunCompletion,
    ) -> Result<CommitReport, RegistryError> {
        if !completion.status.is_terminal() {
            return Err(RegistryError::InvalidTerminalStatus {
                run_id: run_id.to_string(),
                status: completion.status,
            });
        }

        self.mutate(|document, now| {
            let Some(record) = document.records.get_mut(run_id) else {
                tracing::warn!(run_id = %run_id, "ignoring completion for unknown run");
                return Ok(Vec::new());
            };
            if !record.finish(completion, now) {
                tracing::warn!(
                    run_id = %run_id,
                    status = %record.status,
                    "ignoring completion for run that already finished"
                );
                return Ok(Vec::new());
            }
            let kind = match record.status {
                RunStatus::Failed => RunEventKind::Failed,
                _ => RunEventKind::Completed,
            };
            let detail = record
                .error
                .as_deref()
                .or(record.result.as_deref())
                .unwrap_or_default();
            Ok(vec![run_event(record, kind, now, detail)])
        })
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        lock_unpoisoned(&self.state)
            .snapshot
            .records
            .get(run_id)
            .cloned()
    }

    pub fn list_running(&self) -> Vec<RunRecord> {
        self.collect(|record| record.status == RunStatus::Running)
    }

    pub fn list_all(&self) -> Vec<RunRecord> {
        self.collect(|_| true)
    }

    pub fn list_for_session(&self, parent_session_key: &str) -> Vec<RunRecord> {
        self.collect(|record| record.parent_session_key == parent_session_key)
    }

    pub fn stats(&self) -> RunStats {
        let state = lock_unpoisoned(&self.state);
        let mut stats = RunStats::default();
        for record in state.snapshot.records.values() {
            match record.status {
                RunStatus::Running => stats.running += 1,
                RunStatus::Completed => stats.completed += 1,
                RunStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Reloads the snapshot from disk, keeping changes that have not been persisted yet.
    pub fn refresh(&self) -> LoadOutcome {
        let Snapshot {
            mut document,
            outcome,
        } = self.store.load();
        let mut state = lock_unpoisoned(&self.state);
        overlay_unpersisted(&mut document, &state.snapshot, &state.unpersisted);
        state.snapshot = document;
        outcome
    }

    /// Removes terminal runs that finished more than `max_age` ago. Running records are never removed.
    pub fn cleanup_old_runs(&self, max_age: Duration) -> Result<CleanupReport, RegistryError> {
        let mut removed = 0;
        let commit = self.mutate(|document, now| {
            let expired = document
                .records
                .values()
                .filter(|record| {
                    record.status.is_terminal()
                        && is_older_than(record.finished_at(), max_age, now)
                })
                .map(|record| record.run_id.clone())
                .collect::<Vec<_>>();
            let events = expired
                .iter()
                .filter_map(|run_id| document.records.remove(run_id))
                .map(|record| run_event(&record, RunEventKind::Cleaned, now, ""))
                .collect::<Vec<_>>();
            removed = events.len();
            Ok(events)
        })?;
        if removed > 0 {
            tracing::debug!(removed, "retention sweep removed finished runs");
        }
        Ok(CleanupReport { removed, commit })
    }

    /// Retention sweep using the configured [`RunRegistryConfig::retention`].
    pub fn run_retention_sweep(&self) -> Result<CleanupReport, RegistryError> {
        self.cleanup_old_runs(self.config.retention)
    }

    /// Marks the runs found orphaned at open time as failed with `reason`.
    ///
    /// Never called implicitly; runs completed since open are left alone.
    pub fn fail_orphaned_runs(&self, reason: &str) -> Result<CommitReport, RegistryError> {
        let orphaned = &self.open_report.orphaned_runs;
        self.mutate(|document, now| {
            let mut events = Vec::new();
            for run_id in orphaned {
                let Some(record) = document.records.get_mut(run_id) else {
                    continue;
                };
                if record.finish(RunCompletion::failed(reason), now) {
                    events.push(run_event(record, RunEventKind::Failed, now, reason));
                }
            }
            Ok(events)
        })
    }

    fn collect<F>(&self, filter: F) -> Vec<RunRecord>
    where
        F: Fn(&RunRecord) -> bool,
    {
        let mut records = lock_unpoisoned(&self.state)
            .snapshot
            .records
            .values()
            .filter(|record| filter(*record))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            right
                .created_at
                .total_cmp(&left.created_at)
                .then_with(|| left.run_id.cmp(&right.run_id))
        });
        records
    }

    /// Applies `op` to the freshly loaded document under the process lock and commits it.
    ///
    /// `op` returns one event per changed run; an empty list means nothing changed.
    fn mutate<F>(&self, op: F) -> Result<CommitReport, RegistryError>
    where
        F: FnOnce(&mut RegistryDocument, f64) -> Result<Vec<RunEventRecord>, RegistryError>,
    {
        let mut state = lock_unpoisoned(&self.state);
        let updated = {
            let local = &state.snapshot;
            let pending = &state.unpersisted;
            self.store.update_and_then(
                |document| {
                    overlay_unpersisted(document, local, pending);
                    let now = current_unix_seconds();
                    match op(document, now) {
                        Ok(events) if events.is_empty() && pending.is_empty() => {
                            Mutation::Skip(Ok(events))
                        }
                        Ok(events) => {
                            document.stamp(now);
                            Mutation::Write(Ok(events))
                        }
                        Err(error) => Mutation::Skip(Err(error)),
                    }
                },
                |_, value, commit| {
                    // Appended under the registry lock so log order follows commit order.
                    let (Some(log), Ok(events)) = (self.events.as_ref(), value) else {
                        return;
                    };
                    if !events.is_empty() && !matches!(commit, CommitReport::Skipped) {
                        log.append_all(events);
                    }
                },
            )?
        };

        let Updated {
            document,
            value,
            commit,
        } = updated;
        state.snapshot = document;
        let events = value?;
        match &commit {
            CommitReport::Persisted => state.unpersisted.clear(),
            CommitReport::Deferred { .. } => state
                .unpersisted
                .extend(events.iter().map(|event| event.run_id.clone())),
            CommitReport::Skipped => {}
        }
        Ok(commit)
    }
}

fn overlay_unpersisted(
    document: &mut RegistryDocument,
    local: &RegistryDocument,
    pending: &BTreeSet<String>,
) {
    for run_id in pending {
        match local.records.get(run_id) {
            Some(record) => {
                document.records.insert(run_id.clone(), record.clone());
            }
            None => {
                document.records.remove(run_id);
            }
        }
    }
}

fn run_event(
    record: &RunRecord,
    event: RunEventKind,
    timestamp: f64,
    detail: &str,
) -> RunEventRecord {
    RunEventRecord {
        timestamp,
        run_id: record.run_id.clone(),
        event,
        status: record.status,
        detail: detail.chars().take(EVENT_DETAIL_MAX_CHARS).collect(),
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
