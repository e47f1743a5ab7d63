//! Lock-serialized, torn-write-free persistence for a single JSON document.
//!
//! Reads never take the lock and degrade to an empty document when the file
//! is missing or corrupt. Writes hold the [`ProcessLock`] for the target path
//! and commit through a sibling temp file plus atomic replace.


use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use ward_core::commit_file_atomic;
use ward_lock::{LockError, LockOptions, ProcessLock};

/// Errors that abort a store operation. Everything else degrades with a warning.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    LockTimeout(#[from] LockError),
}

/// How [`JsonStore::load`] obtained its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Missing,
    Loaded,
    /// The file existed but could not be read or decoded; an empty document was substituted.
    Corrupt { reason: String },
}

impl LoadOutcome {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// A loaded document together with how it was obtained.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub document: T,
    pub outcome: LoadOutcome,
}

/// Result of a write attempt that did not time out on the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitReport {
    Persisted,
    /// The mutation made no change, so nothing was written.
    Skipped,
    /// Encoding or I/O failed; the target file still holds its previous contents.
    Deferred { reason: String },
}

impl CommitReport {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted)
    }

    /// Returns the non-fatal warning carried by a deferred commit.
    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Deferred { reason } => Some(reason.as_str()),
            Self::Persisted | Self::Skipped => None,
        }
    }
}

/// Decision returned by an [`JsonStore::update`] mutation.
#[derive(Debug)]
pub enum Mutation<R> {
    Write(R),
    Skip(R),
}

/// Outcome of [`JsonStore::update`]: the post-mutation document, the mutation's value, and the commit result.
#[derive(Debug)]
pub struct Updated<T, R> {
    pub document: T,
    pub value: R,
    pub commit: CommitReport,
}

/// Decodes raw file bytes into a document, describing why decoding failed.
pub fn decode_document<T>(raw: &[u8]) -> Result<T, String>
where
    T: DeserializeOwned,
{
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err("file is empty".to_string());
    }
    serde_json::from_slice::<T>(raw).map_err(|error| format!("invalid JSON document: {error}"))
}

/// Durable home of one JSON document of type `T`.
pub struct JsonStore<T> {
    path: PathBuf,
    lock: ProcessLock,
    _document: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonStore<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock: self.lock.clone(),
            _document: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for JsonStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore")
            .field("path", &self.path)
            .field("lock", &self.lock)
            .finish()
    }
}

impl<T> JsonStore<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        let path = path.into();
        let lock = ProcessLock::with_options(&path, lock_options);
        Self {
            path,
            lock,
            _document: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &ProcessLock {
        &self.lock
    }

    /// Reads the last committed document without taking the lock.
    pub fn load(&self) -> Snapshot<T> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Snapshot {
                    document: T::default(),
                    outcome: LoadOutcome::Missing,
                };
            }
            Err(error) => return self.degraded(format!("failed to read file: {error}")),
        };
        match decode_document::<T>(&raw) {
            Ok(document) => Snapshot {
                document,
                outcome: LoadOutcome::Loaded,
            },
            Err(reason) => self.degraded(reason),
        }
    }

    /// Replaces the stored document with `document` under the lock.
    pub fn commit(&self, document: &T) -> Result<CommitReport, StoreError> {
        let mut guard = self.lock.acquire()?;
        let report = self.write_locked(document);
        guard.release();
        Ok(report)
    }

    /// Runs a read-modify-write cycle under the lock.
    ///
    /// The document is re-read after the lock is taken, so updates from other
    /// processes are never overwritten. A [`Mutation::Skip`] leaves the file untouched.
    pub fn update<R, F>(&self, mutation: F) -> Result<Updated<T, R>, StoreError>
    where
        F: FnOnce(&mut T) -> Mutation<R>,
    {
        self.update_and_then(mutation, |_, _, _| {})
    }

    /// Like [`JsonStore::update`], running `after_commit` before the lock is released.
    ///
    /// Side effects that must stay ordered with the commits (such as appending to
    /// a companion log) belong in `after_commit`.
    pub fn update_and_then<R, F, A>(
        &self,
        mutation: F,
        after_commit: A,
    ) -> Result<Updated<T, R>, StoreError>
    where
        F: FnOnce(&mut T) -> Mutation<R>,
        A: FnOnce(&T, &R, &CommitReport),
    {
        let mut guard = self.lock.acquire()?;
        let Snapshot { mut document, .. } = self.load();
        let (value, commit) = match mutation(&mut document) {
            Mutation::Write(value) => (value, self.write_locked(&document)),
            Mutation::Skip(value) => (value, CommitReport::Skipped),
        };
        after_commit(&document, &value, &commit);
        guard.release();
        Ok(Updated {
            document,
            value,
            commit,
        })
    }

    fn write_locked(&self, document: &T) -> CommitReport {
        let mut payload = match serde_json::to_vec_pretty(document) {
            Ok(payload) => payload,
            Err(error) => return self.deferred(format!("failed to encode document: {error}")),
        };
        payload.push(b'\n');
        match commit_file_atomic(&self.path, &payload) {
            Ok(()) => CommitReport::Persisted,
            Err(error) => self.deferred(format!("{error:#}")),
        }
    }

    fn degraded(&self, reason: String) -> Snapshot<T> {
        tracing::warn!(
            path = %self.path.display(),
            reason = %reason,
            "record store file is unusable; treating it as empty"
        );
        Snapshot {
            document: T::default(),
            outcome: LoadOutcome::Corrupt { reason },
        }
    }

    fn deferred(&self, reason: String) -> CommitReport {
        tracing::warn!(
            path = %self.path.display(),
            reason = %reason,
            "record store commit failed; in-memory state kept"
        );
        CommitReport::Deferred { reason }
    }
}
