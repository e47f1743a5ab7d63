//! Advisory, file-based, cross-process exclusive locks with stale-owner reclamation.
//!
//! A lock over resource `R` is the file `R.lock`, created with create-if-absent
//! semantics and holding a [`LockRecord`]. Holders release through
//! [`LockGuard`], explicitly or on drop. Locks abandoned by crashed processes
//! are recognised from the recorded pid and reclaimed by the next acquirer.

mod lock_record;
mod process_probe;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

pub use lock_record::{LockRecord, StaleReason};
pub use process_probe::{host_identifier, owner_is_running, process_is_alive};

pub const LOCK_FILE_SUFFIX: &str = ".lock";
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOCK_POLL_MS: u64 = 50;
const DEFAULT_CORRUPT_GRACE_MS: u64 = 2_000;
const LOCK_TIMEOUT_ENV: &str = "WARD_LOCK_TIMEOUT_MS";
const LOCK_POLL_ENV: &str = "WARD_LOCK_POLL_MS";
const LOCK_CORRUPT_GRACE_ENV: &str = "WARD_LOCK_CORRUPT_GRACE_MS";
const RECLAIM_SUFFIX: &str = ".reclaim.";

/// Errors reported by [`ProcessLock::acquire`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock {} after {waited_ms}ms", .path.display())]
    Timeout { path: PathBuf, waited_ms: u64 },
}

/// Wait policy for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// How long an empty or unparseable lock file is left alone before it counts as stale.
    pub corrupt_grace: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            corrupt_grace: Duration::from_millis(DEFAULT_CORRUPT_GRACE_MS),
        }
    }
}

impl LockOptions {
    /// Reads `WARD_LOCK_TIMEOUT_MS`, `WARD_LOCK_POLL_MS` and
    /// `WARD_LOCK_CORRUPT_GRACE_MS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: env_millis(LOCK_TIMEOUT_ENV).unwrap_or(defaults.timeout),
            poll_interval: env_millis(LOCK_POLL_ENV)
                .filter(|interval| !interval.is_zero())
                .unwrap_or(defaults.poll_interval),
            corrupt_grace: env_millis(LOCK_CORRUPT_GRACE_ENV).unwrap_or(defaults.corrupt_grace),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Returns the lock file path guarding `resource` (`<resource>.lock`).
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut raw = resource.as_os_str().to_os_string();
    raw.push(LOCK_FILE_SUFFIX);
    PathBuf::from(raw)
}

/// Snapshot of a lock file as seen by a non-holder.
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Free,
    Held(LockRecord),
    /// Unreadable contents still inside the grace window; possibly a holder mid-write.
    Pending(StaleReason),
    Stale(StaleReason),
}

enum Attempt {
    Acquired(LockGuard),
    Held,
    Retry(String),
}

/// Handle for the exclusive lock over one resource path.
#[derive(Debug, Clone)]
pub struct ProcessLock {
    lock_path: PathBuf,
    options: LockOptions,
}

impl ProcessLock {
    pub fn new(resource: impl AsRef<Path>) -> Self {
        Self::with_options(resource, LockOptions::default())
    }

    pub fn with_options(resource: impl AsRef<Path>, options: LockOptions) -> Self {
        Self {
            lock_path: lock_path_for(resource.as_ref()),
            options,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquires the lock using the configured timeout.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        self.acquire_with_timeout(self.options.timeout)
    }

    /// Polls until the lock file is created for this caller or `timeout` elapses.
    ///
    /// Stale locks found along the way are reclaimed and the create retried
    /// immediately. Every other failure is retried until the deadline; only
    /// the timeout is reported.
    #[tracing::instrument(
        name = "ward_lock.acquire",
        skip_all,
        fields(lock_path = %self.lock_path.display())
    )]
    pub fn acquire_with_timeout(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let poll_interval = self.options.poll_interval.max(Duration::from_millis(1));

        loop {
            match self.try_create() {
                Attempt::Acquired(guard) => return Ok(guard),
                Attempt::Held => {
                    if self.reclaim_if_stale() {
                        if let Attempt::Acquired(guard) = self.try_create() {
                            return Ok(guard);
                        }
                        tracing::debug!("lost the race for a reclaimed lock");
                    }
                }
                Attempt::Retry(detail) => {
                    tracing::debug!(detail = %detail, "lock attempt failed; retrying");
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    path: self.lock_path.clone(),
                    waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }

    /// Reads the lock file without acquiring or modifying it.
    pub fn inspect(&self) -> LockState {
        self.observe().0
    }

    fn try_create(&self) -> Attempt {
        if let Some(parent) = self
            .lock_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            if let Err(error) = fs::create_dir_all(parent) {
                return Attempt::Retry(format!("failed to create {}: {error}", parent.display()));
            }
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = match options.open(&self.lock_path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Attempt::Held;
            }
            Err(error) => return Attempt::Retry(error.to_string()),
        };

        let record = LockRecord::for_current_process();
        let written = record
            .to_json_bytes()
            .map_err(|error| error.to_string())
            .and_then(|bytes| {
                file.write_all(&bytes)
                    .and_then(|()| file.sync_all())
                    .map_err(|error| error.to_string())
            });
        if let Err(detail) = written {
            drop(file);
            let _ = fs::remove_file(&self.lock_path);
            return Attempt::Retry(format!("failed to write lock record: {detail}"));
        }

        tracing::debug!(owner_token = %record.owner_token, "lock acquired");
        Attempt::Acquired(LockGuard {
            lock_path: self.lock_path.clone(),
            record,
            released: false,
        })
    }

    fn observe(&self) -> (LockState, Option<Vec<u8>>) {
        let raw = match fs::read(&self.lock_path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return (LockState::Free, None);
            }
            Err(error) => {
                let reason = StaleReason::Unreadable(error.to_string());
                return (self.classify_content_problem(reason), None);
            }
        };

        let state = match LockRecord::parse(&raw) {
            Ok(record) => match record.owner_staleness() {
                Some(reason) => LockState::Stale(reason),
                None => LockState::Held(record),
            },
            Err(reason) => self.classify_content_problem(reason),
        };
        (state, Some(raw))
    }

    fn classify_content_problem(&self, reason: StaleReason) -> LockState {
        let past_grace = self
            .lock_file_age()
            .map(|age| age >= self.options.corrupt_grace)
            .unwrap_or(true);
        if past_grace {
            LockState::Stale(reason)
        } else {
            LockState::Pending(reason)
        }
    }

    fn lock_file_age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.lock_path).ok()?.modified().ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }

    /// Deletes the lock file if it is stale. Returns true when the caller should retry the create.
    fn reclaim_if_stale(&self) -> bool {
        let (state, observed) = self.observe();
        let reason = match state {
            LockState::Free => return true,
            LockState::Held(_) | LockState::Pending(_) => return false,
            LockState::Stale(reason) => reason,
        };

        if !self.remove_if_unchanged(observed.as_deref()) {
            return false;
        }
        tracing::warn!(
            lock_path = %self.lock_path.display(),
            reason_code = reason.reason_code(),
            reason = %reason,
            "reclaimed stale lock"
        );
        true
    }

    /// Moves the lock file aside and deletes it only if it still holds `observed`.
    ///
    /// The rename is atomic, so a lock created by another reclaimer after our
    /// observation is moved intact and can be linked back. Returns true when the
    /// lock path is now free of the observed contents.
    fn remove_if_unchanged(&self, observed: Option<&[u8]>) -> bool {
        let parked = self.reclaim_path();
        match fs::rename(&self.lock_path, &parked) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return true,
            Err(error) => {
                tracing::debug!(error = %error, "failed to move stale lock aside; retrying");
                return false;
            }
        }

        let moved = fs::read(&parked).ok();
        let unchanged = moved.as_deref() == observed;
        if !unchanged {
            match fs::hard_link(&parked, &self.lock_path) {
                Ok(()) => tracing::debug!("lock changed before reclaim; restored it"),
                Err(error) => tracing::warn!(
                    lock_path = %self.lock_path.display(),
                    error = %error,
                    "lock changed before reclaim and could not be restored"
                ),
            }
        }
        if let Err(error) = fs::remove_file(&parked) {
            tracing::debug!(
                path = %parked.display(),
                error = %error,
                "failed to remove parked lock file"
            );
        }
        unchanged
    }

    fn reclaim_path(&self) -> PathBuf {
        let mut raw = self.lock_path.as_os_str().to_os_string();
        raw.push(RECLAIM_SUFFIX);
        raw.push(lock_record::next_owner_token());
        PathBuf::from(raw)
    }
}

/// Scoped ownership of an acquired lock. Dropping the guard releases it.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock_path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Removes the lock file if it still records this acquisition. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_lock_file(&self.lock_path, &self.record);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn release_lock_file(lock_path: &Path, owner: &LockRecord) {
    let raw = match fs::read(lock_path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(lock_path = %lock_path.display(), "lock file already removed");
            return;
        }
        Err(error) => {
            tracing::warn!(
                lock_path = %lock_path.display(),
                error = %error,
                "could not verify lock owner; leaving lock file in place"
            );
            return;
        }
    };

    match LockRecord::parse(&raw) {
        Ok(current) if current.same_owner(owner) => {
            if let Err(error) = fs::remove_file(lock_path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        lock_path = %lock_path.display(),
                        error = %error,
                        "failed to remove lock file on release"
                    );
                }
            }
        }
        Ok(current) => tracing::warn!(
            lock_path = %lock_path.display(),
            current_pid = current.owner_pid,
            "lock was taken over by another owner; leaving it in place"
        ),
        Err(reason) => tracing::warn!(
            lock_path = %lock_path.display(),
            reason = %reason,
            "lock file no longer records this owner; leaving it in place"
        ),
    }
}
