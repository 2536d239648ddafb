use chrono::{DateTime, Duration, TimeZone, Utc};
use fs2::FileExt;
use musiclib_core::serial::to_serial;
use musiclib_core::{Operation, RecoveryStatus, Stars, TrackImport};
use musiclib_engine::{
    ErrorKind, Library, LibraryConfig, LibraryError, Outcome, PassStatus, TagWriteError,
    TagWriter, TrackResult,
};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tempfile::TempDir;

fn t(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::hours(hours)
}

fn config(dir: &TempDir, lock_timeout_ms: u64) -> LibraryConfig {
    let mut config = LibraryConfig::in_dir(dir.path());
    config.lock_timeout_ms = lock_timeout_ms;
    config.lock_poll_ms = 5;
    config
}

fn library(dir: &TempDir, lock_timeout_ms: u64) -> Library {
    Library::open(config(dir, lock_timeout_ms)).expect("open library")
}

fn track_paths(prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("/music/{prefix}-{i:02}.mp3"))
        .collect()
}

fn import_all(library: &Library, paths: &[String], now: DateTime<Utc>) {
    for path in paths {
        library
            .import(
                TrackImport {
                    path: path.clone(),
                    title: format!("title of {path}"),
                    ..TrackImport::default()
                },
                now,
            )
            .expect("import")
            .completed()
            .expect("import not deferred");
    }
}

fn last_played(library: &Library, path: &str) -> Option<f64> {
    let rows = library.store().find(path).expect("find");
    assert_eq!(rows.len(), 1, "expected exactly one row for {path}");
    rows[0].last_played
}

/// Another writer holding the store lock.
fn hold_store_lock(dir: &TempDir) -> File {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.path().join("musiclib.dsv.lock"))
        .expect("open lock file");
    file.lock_exclusive().expect("hold lock");
    file
}

#[derive(Default)]
struct ScriptedTags {
    failing: Mutex<HashSet<String>>,
    written: Mutex<Vec<(String, f64)>>,
}

struct SharedTags(Arc<ScriptedTags>);

impl TagWriter for SharedTags {
    fn write_last_played(&self, path: &Path, serial: f64) -> Result<(), TagWriteError> {
        let path = path.display().to_string();
        if self.0.failing.lock().expect("failing").contains(&path) {
            return Err(TagWriteError::Exit {
                program: "scripted".to_string(),
                details: format!("cannot write {path}"),
            });
        }
        self.0.written.lock().expect("written").push((path, serial));
        Ok(())
    }

    fn write_rating(&self, _path: &Path, _stars: Stars) -> Result<(), TagWriteError> {
        Ok(())
    }
}

#[test]
fn four_day_session_with_forty_two_tracks_is_front_loaded() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    let paths = track_paths("gym", 42);
    import_all(&library, &paths, t(0));

    library
        .activate_session("gym", paths.clone(), t(0), t(0))
        .expect("activate gym");
    let activation = library
        .activate_session("commute", vec!["/music/commute.mp3".into()], t(96), t(96))
        .expect("activate commute");

    assert_eq!(activation.superseded.as_deref(), Some("gym"));
    let report = activation
        .accounting
        .expect("accounted")
        .completed()
        .expect("not deferred");
    assert_eq!(report.status, PassStatus::Complete);
    assert_eq!(report.applied, 42);

    let serials: Vec<f64> = paths
        .iter()
        .map(|path| last_played(&library, path).expect("played"))
        .collect();
    assert_eq!(serials[0], to_serial(t(96)));
    assert!(serials[41] > to_serial(t(0)));
    for pair in serials.windows(2) {
        assert!(pair[0] > pair[1], "timestamps must decrease by position");
    }
}

#[test]
fn missing_track_stays_pending_until_imported_and_retried() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    let paths = track_paths("mix", 50);
    let present: Vec<String> = paths
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 10)
        .map(|(_, path)| path.clone())
        .collect();
    import_all(&library, &present, t(0));
    library
        .activate_session("mix", paths.clone(), t(0), t(0))
        .expect("activate");

    let pass = library
        .account_session("mix", Some(t(48)), t(48))
        .expect("account")
        .completed()
        .expect("not deferred");
    assert_eq!(pass.status, PassStatus::Partial);
    assert_eq!(pass.applied, 49);
    assert_eq!(pass.pending, 1);
    assert_eq!(pass.tracks[10].result, TrackResult::Pending);

    let status = library.status().expect("status");
    assert_eq!(status.recovery.len(), 1);
    assert_eq!(status.recovery[0].status, RecoveryStatus::Pending);
    assert_eq!(status.current.as_ref().map(|s| s.outstanding), Some(1));

    import_all(&library, &paths[10..11], t(49));
    let retry = library
        .retry("mix", t(50))
        .expect("retry")
        .completed()
        .expect("not deferred");
    assert_eq!(retry.resolved, 1);
    assert!(retry.outstanding.is_empty());
    assert!(library.status().expect("status").recovery.is_empty());
    assert_eq!(last_played(&library, &paths[10]), Some(pass.tracks[10].serial));
}

#[test]
fn reused_session_name_retries_with_the_newest_pass_timestamp() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    let tracks = vec!["/music/a.mp3".to_string(), "/music/x.mp3".to_string()];
    import_all(&library, &tracks[..1], t(0));

    library
        .activate_session("gym", tracks.clone(), t(0), t(0))
        .expect("first gym");
    library
        .activate_session("gym", tracks.clone(), t(24), t(24))
        .expect("second gym");
    let newest = library
        .activate_session("gym", tracks.clone(), t(96), t(96))
        .expect("third gym")
        .accounting
        .expect("accounted")
        .completed()
        .expect("not deferred");
    assert_eq!(newest.tracks[1].result, TrackResult::Pending);

    let entries = library.status().expect("status").recovery;
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .any(|entry| entry.computed_serial == newest.tracks[1].serial));

    import_all(&library, &tracks[1..], t(97));
    let retry = library
        .retry("gym", t(98))
        .expect("retry")
        .completed()
        .expect("not deferred");
    assert_eq!(retry.resolved, 2);
    assert_eq!(last_played(&library, &tracks[1]), Some(newest.tracks[1].serial));
    assert!(library.status().expect("status").recovery.is_empty());
}

#[test]
fn retry_without_outstanding_entries_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    let report = library
        .retry("never-seen", t(0))
        .expect("retry")
        .completed()
        .expect("not deferred");
    assert_eq!(report.attempted, 0);
    assert_eq!(report.resolved, 0);
}

#[test]
fn rerunning_a_pass_never_double_advances() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    let paths = track_paths("loop", 5);
    import_all(&library, &paths, t(0));
    library
        .activate_session("loop", paths.clone(), t(0), t(0))
        .expect("activate");

    let first = library
        .account_session("loop", Some(t(24)), t(24))
        .expect("first")
        .completed()
        .expect("not deferred");
    let before: Vec<Option<f64>> = paths.iter().map(|p| last_played(&library, p)).collect();

    let second = library
        .account_session("loop", Some(t(24)), t(30))
        .expect("second")
        .completed()
        .expect("not deferred");
    let after: Vec<Option<f64>> = paths.iter().map(|p| last_played(&library, p)).collect();

    assert_eq!(first.applied, 5);
    assert_eq!(second.applied, 5);
    assert!(second
        .tracks
        .iter()
        .all(|track| track.result == TrackResult::AlreadyCurrent));
    assert_eq!(before, after);
}

#[test]
fn short_window_is_rejected_without_side_effects() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    let paths = track_paths("short", 2);
    import_all(&library, &paths, t(0));
    library
        .activate_session("short", paths.clone(), t(0), t(0))
        .expect("activate");

    let err = library
        .account_session("short", Some(t(0) + Duration::minutes(30)), t(1))
        .expect_err("rejected");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(paths.iter().all(|p| last_played(&library, p).is_none()));
    let status = library.status().expect("status");
    assert!(!status.has_outstanding_work());
}

#[test]
fn superseding_quickly_drops_the_old_session_as_noise() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    library
        .activate_session("a", vec!["/music/a.mp3".into()], t(0), t(0))
        .expect("a");
    let report = library
        .activate_session(
            "b",
            vec!["/music/b.mp3".into()],
            t(0) + Duration::minutes(30),
            t(1),
        )
        .expect("b");
    assert!(report.dropped_as_noise);
    assert!(report.accounting.is_none());

    let status = library.status().expect("status");
    assert!(status.previous.is_empty());
    assert_eq!(status.current.map(|s| s.name), Some("b".to_string()));

    let err = library
        .activate_session("c", vec!["/music/c.mp3".into()], t(0), t(1))
        .expect_err("activation before current");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn contended_operation_is_deferred_and_drained_later() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 100);
    import_all(&library, &["/music/busy.mp3".to_string()], t(0));

    let external = hold_store_lock(&dir);
    let started = Instant::now();
    let outcome = library
        .rate("/music/busy.mp3", 4, t(1))
        .expect("rate outcome");
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    let Outcome::Deferred(deferred) = outcome else {
        panic!("expected deferral while the lock is held");
    };
    assert_eq!(deferred.operation.kind(), "rate");
    assert_eq!(library.status().expect("status").queued.len(), 1);

    external.unlock().expect("release");
    let report = library.drain(t(2)).expect("drain");
    assert_eq!(report.applied, 1);
    assert_eq!(report.remaining, 0);
    assert!(library.pending().expect("pending").is_empty());

    let rows = library.store().find("/music/busy.mp3").expect("find");
    assert_eq!(rows[0].stars, Stars::new(4).expect("stars"));
    assert_eq!(rows[0].popm, "196");
}

#[test]
fn direct_operation_drains_the_queue_opportunistically() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 100);
    import_all(&library, &["/music/one.mp3".to_string()], t(0));

    let external = hold_store_lock(&dir);
    assert!(library
        .record_play("/music/one.mp3", t(3), t(3))
        .expect("play")
        .is_deferred());
    drop(external);

    import_all(&library, &["/music/two.mp3".to_string()], t(4));
    assert!(library.pending().expect("pending").is_empty());
    assert_eq!(last_played(&library, "/music/one.mp3"), Some(to_serial(t(3))));
}

#[test]
fn deferred_accounting_keeps_its_pinned_window_end() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 100);
    let paths = track_paths("pin", 3);
    import_all(&library, &paths, t(0));
    library
        .activate_session("pin", paths.clone(), t(0), t(0))
        .expect("activate");

    let external = hold_store_lock(&dir);
    let outcome = library
        .account_session("pin", None, t(30))
        .expect("account outcome");
    let Outcome::Deferred(deferred) = outcome else {
        panic!("expected deferral");
    };
    assert_eq!(
        deferred.operation,
        Operation::AccountSession {
            name: "pin".to_string(),
            window_end: Some(t(30)),
        }
    );
    drop(external);

    let report = library.drain(t(100)).expect("drain");
    assert_eq!(report.applied, 1);
    assert_eq!(last_played(&library, &paths[0]), Some(to_serial(t(30))));
}

#[test]
fn failing_replays_escalate_to_permanently_failed() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = config(&dir, 100);
    config.deferred_max_retries = 0;
    let library = Library::open(config).expect("open");

    let external = hold_store_lock(&dir);
    let deferred = match library.rate("/music/ghost.mp3", 2, t(1)).expect("rate") {
        Outcome::Deferred(deferred) => deferred,
        Outcome::Completed(_) => panic!("expected deferral"),
    };
    drop(external);

    let report = library.drain(t(2)).expect("drain");
    assert_eq!(report.applied, 0);
    assert_eq!(report.permanently_failed.len(), 1);
    assert!(report.permanently_failed[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("not found"));

    let status = library.status().expect("status");
    assert_eq!(status.permanently_failed.len(), 1);
    assert!(status.queued.is_empty());

    library.requeue(&deferred.id).expect("requeue");
    assert_eq!(library.status().expect("status").queued.len(), 1);
    library.discard(&deferred.id).expect("discard");
    assert!(library.pending().expect("pending").is_empty());

    let err = library.requeue("no-such-id").expect_err("unknown");
    assert!(matches!(err, LibraryError::UnknownDeferred(_)));
}

#[test]
fn tag_failures_are_retried_with_the_original_timestamp() {
    let dir = TempDir::new().expect("tempdir");
    let scripted = Arc::new(ScriptedTags::default());
    let library = Library::with_tag_writer(
        config(&dir, 2_000),
        Box::new(SharedTags(Arc::clone(&scripted))),
    )
    .expect("open");
    let paths = track_paths("tagged", 3);
    import_all(&library, &paths, t(0));
    library
        .activate_session("tagged", paths.clone(), t(0), t(0))
        .expect("activate");

    scripted
        .failing
        .lock()
        .expect("failing")
        .insert(paths[1].clone());
    let pass = library
        .account_session("tagged", Some(t(12)), t(12))
        .expect("account")
        .completed()
        .expect("not deferred");
    assert_eq!(pass.status, PassStatus::Partial);
    assert_eq!(pass.failed, 1);
    assert_eq!(pass.tracks[1].result, TrackResult::Failed);

    let entry = library
        .status()
        .expect("status")
        .recovery
        .into_iter()
        .next()
        .expect("ledger entry");
    assert_eq!(entry.status, RecoveryStatus::Failed);
    assert_eq!(entry.computed_serial, pass.tracks[1].serial);

    scripted.failing.lock().expect("failing").clear();
    let retry = library
        .retry("tagged", t(40))
        .expect("retry")
        .completed()
        .expect("not deferred");
    assert_eq!(retry.resolved, 1);

    let written = scripted.written.lock().expect("written");
    let (path, serial) = written.last().expect("tag written on retry");
    assert_eq!(path, &paths[1]);
    assert_eq!(*serial, pass.tracks[1].serial);
}

#[test]
fn cleanup_keeps_sessions_with_outstanding_entries_and_purge_removes_them() {
    let dir = TempDir::new().expect("tempdir");
    let library = library(&dir, 2_000);
    import_all(&library, &["/music/x.mp3".to_string()], t(0));

    library
        .activate_session(
            "a",
            vec!["/music/x.mp3".into(), "/music/not-yet.mp3".into()],
            t(0),
            t(0),
        )
        .expect("a");
    library
        .activate_session("b", vec!["/music/x.mp3".into()], t(5), t(5))
        .expect("b");
    library
        .activate_session("c", vec!["/music/x.mp3".into()], t(10), t(10))
        .expect("c");

    let cleanup = library.cleanup().expect("cleanup");
    assert_eq!(cleanup.removed, vec!["b".to_string()]);
    assert_eq!(cleanup.kept, vec!["a".to_string()]);

    let purge = library.purge("a").expect("purge");
    assert!(purge.removed_session);
    assert_eq!(purge.removed_entries, 1);

    let err = library.purge("c").expect_err("current");
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = library.purge("zzz").expect_err("unknown");
    assert!(matches!(err, LibraryError::UnknownSession(_)));
}

#[test]
fn concurrent_writers_from_two_handles_lose_no_updates() {
    let dir = TempDir::new().expect("tempdir");
    let first = library(&dir, 10_000);
    let second = library(&dir, 10_000);
    let paths = track_paths("conc", 16);
    import_all(&first, &paths, t(0));

    std::thread::scope(|scope| {
        for (i, path) in paths.iter().enumerate() {
            let handle = if i % 2 == 0 { &first } else { &second };
            scope.spawn(move || {
                let stars = (i % 5) as u8 + 1;
                handle
                    .rate(path, stars, t(1))
                    .expect("rate")
                    .completed()
                    .expect("not deferred");
                handle
                    .record_play(path, t(1) - Duration::minutes(i as i64), t(1))
                    .expect("play")
                    .completed()
                    .expect("not deferred");
            });
        }
    });

    for (i, path) in paths.iter().enumerate() {
        let rows = first.store().find(path).expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stars.get(), (i % 5) as u8 + 1);
        assert_eq!(
            rows[0].last_played,
            Some(to_serial(t(1) - Duration::minutes(i as i64)))
        );
    }
}
