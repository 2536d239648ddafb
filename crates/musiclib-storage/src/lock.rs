//! Cross-process advisory locking on a dedicated lock file.
//!
//! Every writer of a shared file must go through [`LockFile::acquire`]; the
//! returned [`LockGuard`] releases the lock when dropped, so early returns,
//! `?` and panics all unlock.

use chrono::Utc;
use fs2::FileExt;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error on lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock {path} is already held by this thread")]
    Reentrant { path: PathBuf },
}

/// Result of a bounded wait. Timing out is a normal outcome, not an error.
#[derive(Debug)]
pub enum LockAttempt {
    Locked(LockGuard),
    TimedOut { waited: Duration },
}

impl LockAttempt {
    pub fn into_guard(self) -> Option<LockGuard> {
        match self {
            LockAttempt::Locked(guard) => Some(guard),
            LockAttempt::TimedOut { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    poll_interval: Duration,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Lock file guarding `target`, named `<target>.lock`.
    pub fn beside(target: &Path) -> Self {
        let mut name = OsString::from(target.as_os_str());
        name.push(".lock");
        Self::new(PathBuf::from(name))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits up to `timeout` for the exclusive lock.
    pub fn acquire(&self, timeout: Duration) -> Result<LockAttempt, LockError> {
        let registration = HeldRegistration::register(&self.path)?;
        let mut file = self.open()?;
        let started = Instant::now();

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    write_owner_metadata(&mut file, &self.path);
                    debug!(
                        event = "lock_acquired",
                        path = %self.path.display(),
                        waited_ms = started.elapsed().as_millis() as u64
                    );
                    return Ok(LockAttempt::Locked(LockGuard {
                        file,
                        path: self.path.clone(),
                        acquired: Instant::now(),
                        _registration: registration,
                    }));
                }
                Err(err) if is_contended(&err) => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                debug!(
                    event = "lock_timed_out",
                    path = %self.path.display(),
                    waited_ms = waited.as_millis() as u64
                );
                return Ok(LockAttempt::TimedOut { waited });
            }
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        Ok(self.acquire(Duration::ZERO)?.into_guard())
    }

    fn open(&self) -> Result<File, LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)
    }
}

/// Proof of holding a [`LockFile`]. Mutating APIs take `&LockGuard` so they
/// cannot be called without one.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    acquired: Instant,
    _registration: HeldRegistration,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn held_for(&self) -> Duration {
        self.acquired.elapsed()
    }

    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(
            event = "lock_released",
            path = %self.path.display(),
            held_ms = self.acquired.elapsed().as_millis() as u64
        );
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    err.kind() == contended.kind() || err.raw_os_error() == contended.raw_os_error()
}

fn write_owner_metadata(file: &mut File, path: &Path) {
    let metadata = format!(
        "owner_pid={}\nacquired_at={}\n",
        std::process::id(),
        Utc::now().to_rfc3339()
    );
    let written = file
        .set_len(0)
        .and_then(|()| file.write_all(metadata.as_bytes()))
        .and_then(|()| file.flush());
    if let Err(err) = written {
        debug!(event = "lock_owner_unrecorded", path = %path.display(), error = %err);
    }
}

type HeldKey = (PathBuf, ThreadId);

fn held_locks() -> &'static Mutex<HashSet<HeldKey>> {
    static HELD: OnceLock<Mutex<HashSet<HeldKey>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Marks a lock path as held by the current thread for the guard's lifetime.
#[derive(Debug)]
struct HeldRegistration {
    key: HeldKey,
}

impl HeldRegistration {
    fn register(path: &Path) -> Result<Self, LockError> {
        let key = (path.to_path_buf(), thread::current().id());
        let mut held = held_locks()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.clone()) {
            return Err(LockError::Reentrant {
                path: path.to_path_buf(),
            });
        }
        Ok(Self { key })
    }
}

impl Drop for HeldRegistration {
    fn drop(&mut self) {
        let mut held = held_locks()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}
