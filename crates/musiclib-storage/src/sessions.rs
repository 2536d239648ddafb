use crate::{lock_or_timeout, read_json_or_default, write_json_atomic, LockFile, StorageError};
use chrono::{DateTime, Utc};
use musiclib_core::PlaylistSession;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Contents of `sessions.json`: the playlist currently on the device plus the
/// ones it replaced.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBook {
    #[serde(default)]
    pub current: Option<PlaylistSession>,
    #[serde(default)]
    pub previous: Vec<PlaylistSession>,
}

impl SessionBook {
    /// Session an accounting pass for `name` should use: an unaccounted
    /// previous session first, then the current one, then an already
    /// accounted previous session.
    pub fn find_for_accounting(&self, name: &str) -> Option<&PlaylistSession> {
        let unaccounted = self
            .previous
            .iter()
            .find(|session| session.name == name && session.accounted_at.is_none());
        let current = self.current.as_ref().filter(|session| session.name == name);
        let accounted = self.previous.iter().find(|session| session.name == name);
        unaccounted.or(current).or(accounted)
    }

    pub fn find_previous(&self, name: &str) -> Option<&PlaylistSession> {
        self.previous.iter().find(|session| session.name == name)
    }

    pub fn is_current(&self, name: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|session| session.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionRegister {
    path: PathBuf,
    lock: LockFile,
    timeout: Duration,
}

impl SessionRegister {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let lock = LockFile::beside(&path);
        Self {
            path,
            lock,
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

    pub fn load(&self) -> Result<SessionBook, StorageError> {
        read_json_or_default(&self.path)
    }

    /// Makes `session` current. The session it replaces is stamped with
    /// `superseded_at = session.activated_at`, marked as not yet accounted
    /// for its full window, moved to `previous` and returned.
    pub fn activate(
        &self,
        session: PlaylistSession,
    ) -> Result<Option<PlaylistSession>, StorageError> {
        self.update(|book| {
            if let Some(current) = &book.current {
                if session.activated_at < current.activated_at {
                    return Err(StorageError::Conflict(format!(
                        "session {} activated at {} precedes current session {} activated at {}",
                        session.name,
                        session.activated_at.to_rfc3339(),
                        current.name,
                        current.activated_at.to_rfc3339()
                    )));
                }
            }

            let superseded = book.current.take().map(|mut old| {
                old.superseded_at = Some(session.activated_at);
                old.accounted_at = None;
                old
            });
            if let Some(old) = &superseded {
                if let Some(index) = book.previous.iter().position(|prev| prev.name == old.name) {
                    warn!(
                        event = "previous_session_replaced",
                        session = %old.name,
                        "an older session with the same name is replaced"
                    );
                    book.previous.remove(index);
                }
                book.previous.push(old.clone());
            }
            info!(
                event = "session_activated",
                session = %session.name,
                tracks = session.tracks.len(),
                superseded = superseded.as_ref().map(|old| old.name.as_str()).unwrap_or("")
            );
            book.current = Some(session);
            Ok(superseded)
        })?
    }

    /// Stamps the named session as accounted. Previous sessions win over the
    /// current one, matching [`SessionBook::find_for_accounting`].
    pub fn mark_accounted(&self, name: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        self.update(|book| {
            let target = match book
                .previous
                .iter()
                .position(|session| session.name == name && session.accounted_at.is_none())
            {
                Some(index) => Some(&mut book.previous[index]),
                None => book
                    .current
                    .as_mut()
                    .filter(|session| session.name == name)
                    .or_else(|| book.previous.iter_mut().find(|session| session.name == name)),
            };
            match target {
                Some(session) => {
                    session.accounted_at = Some(at);
                    true
                }
                None => false,
            }
        })
    }

    /// Drops a previous session that was too short to account.
    pub fn remove_previous(&self, name: &str) -> Result<Option<PlaylistSession>, StorageError> {
        self.update(|book| {
            let index = book.previous.iter().position(|session| session.name == name)?;
            Some(book.previous.remove(index))
        })
    }

    /// Removes every previous session for which `remove` returns true. The
    /// current session is never touched.
    pub fn remove_previous_where<F>(&self, mut remove: F) -> Result<Vec<PlaylistSession>, StorageError>
    where
        F: FnMut(&PlaylistSession) -> bool,
    {
        self.update(|book| {
            let (removed, kept) = std::mem::take(&mut book.previous)
                .into_iter()
                .partition(|session| remove(session));
            book.previous = kept;
            removed
        })
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut SessionBook) -> R) -> Result<R, StorageError> {
        let _guard = lock_or_timeout(&self.lock, self.timeout)?;
        let mut book = self.load()?;
        let result = mutate(&mut book);
        write_json_atomic(&self.path, &book)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 7, 30, 0)
            .single()
            .expect("valid timestamp")
            + ChronoDuration::days(n)
    }

    fn session(name: &str, at: DateTime<Utc>) -> PlaylistSession {
        PlaylistSession::new(name, vec![format!("/m/{name}.mp3")], at)
    }

    fn register(dir: &TempDir) -> SessionRegister {
        SessionRegister::new(dir.path().join("sessions.json"), Duration::from_millis(500))
    }

    #[test]
    fn activation_supersedes_the_current_session() {
        let dir = TempDir::new().expect("tempdir");
        let register = register(&dir);
        assert!(register.activate(session("gym", day(0))).expect("first").is_none());

        let superseded = register
            .activate(session("commute", day(4)))
            .expect("second")
            .expect("superseded");
        assert_eq!(superseded.name, "gym");
        assert_eq!(superseded.superseded_at, Some(day(4)));

        let book = register.load().expect("load");
        assert!(book.is_current("commute"));
        assert_eq!(book.previous.len(), 1);
        assert_eq!(book.find_for_accounting("gym"), Some(&superseded));
    }

    #[test]
    fn activation_before_current_is_refused() {
        let dir = TempDir::new().expect("tempdir");
        let register = register(&dir);
        register.activate(session("gym", day(3))).expect("first");
        let err = register
            .activate(session("commute", day(1)))
            .expect_err("out of order");
        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(register.load().expect("load").is_current("gym"));
    }

    #[test]
    fn accounting_lookup_prefers_unaccounted_previous() {
        let dir = TempDir::new().expect("tempdir");
        let register = register(&dir);
        register.activate(session("gym", day(0))).expect("a");
        register.activate(session("gym", day(2))).expect("b");

        let book = register.load().expect("load");
        let found = book.find_for_accounting("gym").expect("found");
        assert_eq!(found.superseded_at, Some(day(2)));

        assert!(register.mark_accounted("gym", day(2)).expect("mark"));
        let book = register.load().expect("load");
        assert!(book.previous[0].accounted_at.is_some());
        let found = book.find_for_accounting("gym").expect("found");
        assert!(found.is_current());
        assert!(!register.mark_accounted("nope", day(2)).expect("mark missing"));
    }

    #[test]
    fn removal_never_touches_current() {
        let dir = TempDir::new().expect("tempdir");
        let register = register(&dir);
        register.activate(session("a", day(0))).expect("a");
        register.activate(session("b", day(1))).expect("b");
        register.activate(session("c", day(2))).expect("c");

        let removed = register
            .remove_previous_where(|_| true)
            .expect("remove");
        assert_eq!(removed.len(), 2);
        let book = register.load().expect("load");
        assert!(book.previous.is_empty());
        assert!(book.is_current("c"));

        assert!(register.remove_previous("a").expect("remove a").is_none());
    }
}
