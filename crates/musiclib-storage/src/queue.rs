//! Durable FIFO of operations that could not get the store lock in time.

use crate::{lock_or_timeout, read_json_or_default, write_json_atomic, LockFile, StorageError};
use chrono::{DateTime, Utc};
use musiclib_core::{DeferredOperation, DeferredState, Operation};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    entries: Vec<DeferredOperation>,
}

/// What happened when one queued operation was replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Applied,
    /// The store lock was still busy; the entry stays untouched.
    Contended,
    Failed(String),
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    /// Another process was already draining; nothing was replayed.
    pub already_running: bool,
    pub applied: usize,
    pub contended: bool,
    pub failed_attempts: usize,
    pub permanently_failed: Vec<DeferredOperation>,
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct DeferredQueue {
    path: PathBuf,
    lock: LockFile,
    drain_lock: LockFile,
    timeout: Duration,
}

impl DeferredQueue {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let lock = LockFile::beside(&path);
        let mut drain_name = OsString::from(path.as_os_str());
        drain_name.push(".drain");
        let drain_lock = LockFile::beside(Path::new(&drain_name));
        Self {
            path,
            lock,
            drain_lock,
            timeout,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.lock = self.lock.with_poll_interval(poll_interval);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enqueue(
        &self,
        operation: Operation,
        at: DateTime<Utc>,
    ) -> Result<DeferredOperation, StorageError> {
        let deferred = DeferredOperation::new(operation, at);
        self.update(|file| file.entries.push(deferred.clone()))?;
        info!(
            event = "operation_deferred",
            id = %deferred.id,
            op = deferred.operation.kind(),
            detail = %deferred.operation.describe()
        );
        Ok(deferred)
    }

    pub fn list(&self) -> Result<Vec<DeferredOperation>, StorageError> {
        Ok(self.load()?.entries)
    }

    pub fn queued(&self) -> Result<Vec<DeferredOperation>, StorageError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| entry.state == DeferredState::Queued)
            .collect())
    }

    /// Replays queued entries oldest first. Stops at the first contended
    /// replay. Entries whose failure count exceeds `max_retries` are marked
    /// permanently failed.
    ///
    /// Only one drain runs at a time across processes; a concurrent call
    /// returns immediately with `already_running` set.
    pub fn drain<F>(&self, max_retries: u32, mut replay: F) -> Result<DrainReport, StorageError>
    where
        F: FnMut(&DeferredOperation) -> ReplayOutcome,
    {
        let mut report = DrainReport::default();
        let Some(_drain_guard) = self.drain_lock.try_acquire()? else {
            debug!(event = "drain_already_running", path = %self.path.display());
            report.already_running = true;
            return Ok(report);
        };

        let snapshot = self.queued()?;
        for entry in &snapshot {
            match replay(entry) {
                ReplayOutcome::Applied => {
                    self.update(|file| file.entries.retain(|queued| queued.id != entry.id))?;
                    report.applied += 1;
                    info!(event = "deferred_replayed", id = %entry.id, op = entry.operation.kind());
                }
                ReplayOutcome::Contended => {
                    report.contended = true;
                    debug!(event = "drain_contended", id = %entry.id);
                    break;
                }
                ReplayOutcome::Failed(reason) => {
                    report.failed_attempts += 1;
                    let escalated = self.update(|file| {
                        let queued = file.entries.iter_mut().find(|queued| queued.id == entry.id)?;
                        queued.retry_count += 1;
                        queued.last_error = Some(reason.clone());
                        if queued.retry_count > max_retries {
                            queued.state = DeferredState::PermanentlyFailed;
                            return Some(queued.clone());
                        }
                        None
                    })?;
                    match escalated {
                        Some(failed) => {
                            warn!(
                                event = "deferred_permanently_failed",
                                id = %failed.id,
                                op = failed.operation.kind(),
                                retries = failed.retry_count,
                                error = %reason
                            );
                            report.permanently_failed.push(failed);
                        }
                        None => {
                            warn!(event = "deferred_replay_failed", id = %entry.id, error = %reason)
                        }
                    }
                }
            }
        }

        report.remaining = self.queued()?.len();
        Ok(report)
    }

    /// Puts a permanently failed entry back in the queue with a fresh retry
    /// budget. Returns `false` when no such entry exists.
    pub fn requeue(&self, id: &str) -> Result<bool, StorageError> {
        self.update(|file| match file.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.state = DeferredState::Queued;
                entry.retry_count = 0;
                entry.last_error = None;
                true
            }
            None => false,
        })
    }

    pub fn discard(&self, id: &str) -> Result<Option<DeferredOperation>, StorageError> {
        self.update(|file| {
            let index = file.entries.iter().position(|entry| entry.id == id)?;
            Some(file.entries.remove(index))
        })
    }

    fn load(&self) -> Result<QueueFile, StorageError> {
        read_json_or_default(&self.path)
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut QueueFile) -> R) -> Result<R, StorageError> {
        let _guard = lock_or_timeout(&self.lock, self.timeout)?;
        let mut file = self.load()?;
        let result = mutate(&mut file);
        write_json_atomic(&self.path, &file)?;
        Ok(result)
    }
}
