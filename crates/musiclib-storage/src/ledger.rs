use crate::{lock_or_timeout, read_json_or_default, write_json_atomic, LockFile, StorageError};
use musiclib_core::RecoveryEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    entries: Vec<RecoveryEntry>,
}

impl LedgerFile {
    fn upsert(&mut self, entry: &RecoveryEntry) {
        match self.entries.iter_mut().find(|existing| existing.same_key(entry)) {
            Some(existing) => {
                existing.status = entry.status;
                existing.last_error = entry.last_error.clone();
                existing.attempts = existing.attempts.max(entry.attempts);
            }
            None => self.entries.push(entry.clone()),
        }
    }

    fn remove(&mut self, session_name: &str, track: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.session_name == session_name && entry.track == track));
        before != self.entries.len()
    }
}

/// Per-track record of outstanding accounting work, one JSON file guarded by
/// its own lock file.
///
/// Re-recording a track for the same session activation keeps the timestamp
/// computed by the first pass. Activations that reuse a name get entries of
/// their own.
#[derive(Debug, Clone)]
pub struct RecoveryLedger {
    path: PathBuf,
    lock: LockFile,
    timeout: Duration,
}

impl RecoveryLedger {
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

    pub fn all(&self) -> Result<Vec<RecoveryEntry>, StorageError> {
        Ok(self.load()?.entries)
    }

    pub fn list(&self, session_name: &str) -> Result<Vec<RecoveryEntry>, StorageError> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .filter(|entry| entry.session_name == session_name)
            .collect())
    }

    /// Outstanding entry counts keyed by session name.
    pub fn counts_by_session(&self) -> Result<BTreeMap<String, usize>, StorageError> {
        let mut counts = BTreeMap::new();
        for entry in self.load()?.entries {
            *counts.entry(entry.session_name).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn record(&self, entry: &RecoveryEntry) -> Result<(), StorageError> {
        self.record_all(std::slice::from_ref(entry))
    }

    pub fn record_all(&self, entries: &[RecoveryEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.update(|file| {
            for entry in entries {
                file.upsert(entry);
            }
        })
    }

    /// Removes an entry. Resolving an entry that is already gone is a no-op
    /// and returns `false`.
    pub fn resolve(&self, session_name: &str, track: &str) -> Result<bool, StorageError> {
        self.update(|file| file.remove(session_name, track))
    }

    /// Applies the outcome of a pass or a retry in one write: `resolved`
    /// tracks are removed, `outstanding` entries are upserted.
    pub fn reconcile(
        &self,
        session_name: &str,
        resolved: &[String],
        outstanding: &[RecoveryEntry],
    ) -> Result<usize, StorageError> {
        if resolved.is_empty() && outstanding.is_empty() {
            return Ok(0);
        }
        self.update(|file| {
            let mut removed = 0;
            for track in resolved {
                if file.remove(session_name, track) {
                    removed += 1;
                }
            }
            for entry in outstanding {
                file.upsert(entry);
            }
            removed
        })
    }

    pub fn remove_session(&self, session_name: &str) -> Result<usize, StorageError> {
        self.update(|file| {
            let before = file.entries.len();
            file.entries.retain(|entry| entry.session_name != session_name);
            before - file.entries.len()
        })
    }

    fn load(&self) -> Result<LedgerFile, StorageError> {
        read_json_or_default(&self.path)
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut LedgerFile) -> R) -> Result<R, StorageError> {
        let guard = lock_or_timeout(&self.lock, self.timeout)?;
        let mut file = self.load()?;
        let result = mutate(&mut file);
        write_json_atomic(&self.path, &file)?;
        debug!(
            event = "ledger_written",
            path = %self.path.display(),
            entries = file.entries.len()
        );
        drop(guard);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use musiclib_core::serial::to_serial;
    use musiclib_core::RecoveryStatus;
    use tempfile::TempDir;

    fn ts(offset_minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0)
            .single()
            .expect("valid timestamp")
            + ChronoDuration::minutes(offset_minutes)
    }

    fn entry(
        session: &str,
        track: &str,
        status: RecoveryStatus,
        at: DateTime<Utc>,
    ) -> RecoveryEntry {
        RecoveryEntry {
            session_name: session.to_string(),
            session_id: format!("{session}-1"),
            track: track.to_string(),
            computed_at: at,
            computed_serial: to_serial(at),
            status,
            last_error: None,
            attempts: 0,
            recorded_at: at,
        }
    }

    fn ledger(dir: &TempDir) -> RecoveryLedger {
        RecoveryLedger::new(
            dir.path().join("recovery.json"),
            std::time::Duration::from_millis(500),
        )
    }

    #[test]
    fn record_list_and_resolve_are_scoped_by_session() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = ledger(&dir);
        ledger
            .record_all(&[
                entry("gym", "/m/a.mp3", RecoveryStatus::Pending, ts(0)),
                entry("gym", "/m/b.mp3", RecoveryStatus::Failed, ts(1)),
                entry("commute", "/m/a.mp3", RecoveryStatus::Pending, ts(2)),
            ])
            .expect("record");

        assert_eq!(ledger.list("gym").expect("gym").len(), 2);
        assert_eq!(ledger.counts_by_session().expect("counts")["commute"], 1);

        assert!(ledger.resolve("gym", "/m/a.mp3").expect("resolve"));
        assert!(!ledger.resolve("gym", "/m/a.mp3").expect("resolve again"));
        assert_eq!(ledger.list("commute").expect("commute").len(), 1);
    }

    #[test]
    fn re_recording_keeps_original_computed_timestamp() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = ledger(&dir);
        ledger
            .record(&entry("gym", "/m/a.mp3", RecoveryStatus::Pending, ts(0)))
            .expect("first");

        let mut later = entry("gym", "/m/a.mp3", RecoveryStatus::Failed, ts(90));
        later.attempts = 2;
        later.last_error = Some("tag tool exited 1".to_string());
        ledger.record(&later).expect("second");

        let entries = ledger.list("gym").expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].computed_at, ts(0));
        assert_eq!(entries[0].status, RecoveryStatus::Failed);
        assert_eq!(entries[0].attempts, 2);
    }

    #[test]
    fn reused_session_name_keeps_each_activation_timestamp() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = ledger(&dir);
        ledger
            .record(&entry("gym", "/m/x.mp3", RecoveryStatus::Pending, ts(0)))
            .expect("first activation");

        let mut newer = entry("gym", "/m/x.mp3", RecoveryStatus::Pending, ts(3_000));
        newer.session_id = "gym-2".to_string();
        ledger.record(&newer).expect("second activation");

        let entries = ledger.list("gym").expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].computed_at, ts(0));
        assert_eq!(entries[1].computed_at, ts(3_000));
        assert_eq!(entries[1].session_id, "gym-2");
    }

    #[test]
    fn reconcile_and_remove_session() {
        let dir = TempDir::new().expect("tempdir");
        let ledger = ledger(&dir);
        ledger
            .record_all(&[
                entry("gym", "/m/a.mp3", RecoveryStatus::Pending, ts(0)),
                entry("gym", "/m/b.mp3", RecoveryStatus::Pending, ts(1)),
            ])
            .expect("record");

        let removed = ledger
            .reconcile(
                "gym",
                &["/m/a.mp3".to_string(), "/m/zzz.mp3".to_string()],
                &[entry("gym", "/m/c.mp3", RecoveryStatus::Failed, ts(2))],
            )
            .expect("reconcile");
        assert_eq!(removed, 1);
        let tracks: Vec<String> = ledger
            .list("gym")
            .expect("list")
            .into_iter()
            .map(|entry| entry.track)
            .collect();
        assert_eq!(tracks, vec!["/m/b.mp3".to_string(), "/m/c.mp3".to_string()]);

        assert_eq!(ledger.remove_session("gym").expect("purge"), 2);
        assert!(ledger.all().expect("all").is_empty());
    }
}
