use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

mod atomic;
pub mod ledger;
pub mod lock;
pub mod queue;
pub mod sessions;
pub mod track_store;

pub use atomic::{read_json_or_default, write_atomic, write_json_atomic};
pub use ledger::RecoveryLedger;
pub use lock::{LockAttempt, LockError, LockFile, LockGuard};
pub use queue::{DeferredQueue, DrainReport, ReplayOutcome};
pub use sessions::{SessionBook, SessionRegister};
pub use track_store::{Lookup, TrackStore, TrackTable};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("timed out after {waited_ms}ms waiting for {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },
    #[error("{path}: missing or unrecognized header line")]
    MissingHeader { path: PathBuf },
    #[error("{path}:{line}: malformed row: {reason}")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] musiclib_core::TrackError),
    #[error("duplicate track path {path} (id {id})")]
    DuplicatePath { path: String, id: u64 },
    #[error("serialization error in {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },
    #[error("{0}")]
    Conflict(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Bounded acquire for the JSON side files, where a timeout is a system error
/// rather than a deferral.
pub(crate) fn lock_or_timeout(lock: &LockFile, timeout: Duration) -> Result<LockGuard, StorageError> {
    match lock.acquire(timeout)? {
        LockAttempt::Locked(guard) => Ok(guard),
        LockAttempt::TimedOut { waited } => Err(StorageError::LockTimeout {
            path: lock.path().to_path_buf(),
            waited_ms: waited.as_millis() as u64,
        }),
    }
}
