//! Every operation the CLI exposes, each an independent unit that ends in
//! success, a validation error, a system error or a deferral.

use crate::accounting::{
    AccountingEngine, AccountingPlan, AccountingPolicy, AccountingReport, WriteBack,
    WriteBackResult,
};
use crate::config::LibraryConfig;
use crate::outcome::{Attempt, Outcome};
use crate::recovery::RetryReport;
use crate::tag_writer::{self, TagWriter};
use crate::LibraryError;
use chrono::{DateTime, Utc};
use musiclib_core::serial::to_serial;
use musiclib_core::{
    DeferredOperation, DeferredState, Operation, PlaylistSession, RecoveryEntry, Stars,
    TrackImport,
};
use musiclib_storage::{
    DeferredQueue, DrainReport, LockAttempt, Lookup, RecoveryLedger, ReplayOutcome,
    SessionRegister, StorageError, TrackStore,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateReport {
    pub id: u64,
    pub path: String,
    pub stars: Stars,
    pub popm: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayReport {
    pub id: u64,
    pub path: String,
    pub serial: f64,
    /// False when the store already held this or a later play.
    pub advanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub id: u64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationReport {
    pub session: String,
    pub tracks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded: Option<String>,
    /// The superseded session was current for less than the minimum window
    /// and was discarded without accounting.
    pub dropped_as_noise: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounting: Option<Outcome<AccountingReport>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub tracks: usize,
    pub activated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounted_at: Option<DateTime<Utc>>,
    pub outstanding: usize,
}

impl SessionSummary {
    fn new(session: &PlaylistSession, counts: &BTreeMap<String, usize>) -> Self {
        Self {
            name: session.name.clone(),
            tracks: session.tracks.len(),
            activated_at: session.activated_at,
            superseded_at: session.superseded_at,
            accounted_at: session.accounted_at,
            outstanding: counts.get(&session.name).copied().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub current: Option<SessionSummary>,
    pub previous: Vec<SessionSummary>,
    pub recovery: Vec<RecoveryEntry>,
    pub queued: Vec<DeferredOperation>,
    pub permanently_failed: Vec<DeferredOperation>,
}

impl StatusReport {
    pub fn has_outstanding_work(&self) -> bool {
        !self.recovery.is_empty() || !self.queued.is_empty() || !self.permanently_failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub session: String,
    pub removed_session: bool,
    pub removed_entries: usize,
}

pub struct Library {
    config: LibraryConfig,
    policy: AccountingPolicy,
    store: TrackStore,
    ledger: RecoveryLedger,
    queue: DeferredQueue,
    sessions: SessionRegister,
    tags: Box<dyn TagWriter>,
}

impl Library {
    pub fn open(config: LibraryConfig) -> Result<Self, LibraryError> {
        let tags = tag_writer::from_config(&config.tags);
        Self::with_tag_writer(config, tags)
    }

    pub fn with_tag_writer(
        config: LibraryConfig,
        tags: Box<dyn TagWriter>,
    ) -> Result<Self, LibraryError> {
        config.validate()?;
        let policy = AccountingPolicy::from_config(&config.accounting)?;
        let timeout = config.lock_timeout();
        let poll = config.lock_poll_interval();
        Ok(Self {
            policy,
            store: TrackStore::new(config.store_path()).with_poll_interval(poll),
            ledger: RecoveryLedger::new(config.ledger_path(), timeout).with_poll_interval(poll),
            queue: DeferredQueue::new(config.queue_path(), timeout).with_poll_interval(poll),
            sessions: SessionRegister::new(config.sessions_path(), timeout)
                .with_poll_interval(poll),
            tags,
            config,
        })
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn store(&self) -> &TrackStore {
        &self.store
    }

    fn engine(&self) -> AccountingEngine<'_> {
        AccountingEngine::new(
            &self.store,
            &self.ledger,
            self.tags.as_ref(),
            self.config.lock_timeout(),
        )
    }

    pub fn rate(
        &self,
        path: &str,
        stars: u8,
        now: DateTime<Utc>,
    ) -> Result<Outcome<RateReport>, LibraryError> {
        let path = required("track path", path)?;
        let stars = Stars::new(stars)?;
        let attempt = self.try_rate(&path, stars)?;
        self.finish(Operation::Rate { path, stars }, attempt, now)
    }

    /// A direct playback event from the "now playing" tracker.
    pub fn record_play(
        &self,
        path: &str,
        played_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<PlayReport>, LibraryError> {
        let path = required("track path", path)?;
        if played_at > now {
            return Err(LibraryError::Invalid(format!(
                "play time {} is in the future",
                played_at.to_rfc3339()
            )));
        }
        let attempt = self.try_record_play(&path, played_at)?;
        self.finish(Operation::RecordPlay { path, played_at }, attempt, now)
    }

    pub fn import(
        &self,
        track: TrackImport,
        now: DateTime<Utc>,
    ) -> Result<Outcome<ImportReport>, LibraryError> {
        track.validate()?;
        let attempt = self.try_import(&track)?;
        self.finish(Operation::Import { track }, attempt, now)
    }

    /// Makes a new playlist current on the device. The session it replaces
    /// is accounted right away over `[its activation, at]`, or dropped as
    /// noise when that window is shorter than the minimum.
    pub fn activate_session(
        &self,
        name: &str,
        tracks: Vec<String>,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ActivationReport, LibraryError> {
        let name = required("session name", name)?;
        let tracks: Vec<String> = tracks
            .into_iter()
            .map(|track| track.trim().to_string())
            .filter(|track| !track.is_empty())
            .collect();
        if tracks.is_empty() {
            return Err(LibraryError::Invalid(format!("session {name} has no tracks")));
        }
        if let Some(current) = self.sessions.load()?.current {
            if at < current.activated_at {
                return Err(LibraryError::Invalid(format!(
                    "activation time {} precedes current session {} ({})",
                    at.to_rfc3339(),
                    current.name,
                    current.activated_at.to_rfc3339()
                )));
            }
        }

        let mut report = ActivationReport {
            session: name.clone(),
            tracks: tracks.len(),
            superseded: None,
            dropped_as_noise: false,
            accounting: None,
        };
        let Some(old) = self
            .sessions
            .activate(PlaylistSession::new(name, tracks, at))?
        else {
            return Ok(report);
        };

        report.superseded = Some(old.name.clone());
        if at - old.activated_at < self.policy.min_window() {
            warn!(
                event = "session_dropped_as_noise",
                session = %old.name,
                minutes = (at - old.activated_at).num_minutes()
            );
            self.sessions.remove_previous(&old.name)?;
            report.dropped_as_noise = true;
        } else {
            report.accounting = Some(self.account_session(&old.name, Some(at), now)?);
        }
        Ok(report)
    }

    /// Runs an accounting pass. The window end is resolved now and pinned
    /// into the operation, so a deferred replay covers the same window.
    pub fn account_session(
        &self,
        name: &str,
        window_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<AccountingReport>, LibraryError> {
        let name = required("session name", name)?;
        let plan = self.plan_for(&name, window_end, now)?;
        let attempt = self.apply_plan(&plan, now)?;
        let operation = Operation::AccountSession {
            name,
            window_end: Some(plan.window_end),
        };
        self.finish(operation, attempt, now)
    }

    pub fn retry(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Outcome<RetryReport>, LibraryError> {
        let name = required("session name", name)?;
        let attempt = self.engine().retry_all(&name, now)?;
        self.finish(Operation::RetrySession { name }, attempt, now)
    }

    /// Replays queued operations. Safe to call from a timer; a concurrent
    /// drain makes this one a no-op.
    pub fn drain(&self, now: DateTime<Utc>) -> Result<DrainReport, LibraryError> {
        let report = self
            .queue
            .drain(self.config.deferred_max_retries, |entry| self.replay(entry, now))?;
        if !report.already_running {
            info!(
                event = "drain_finished",
                applied = report.applied,
                contended = report.contended,
                failed_attempts = report.failed_attempts,
                permanently_failed = report.permanently_failed.len(),
                remaining = report.remaining
            );
        }
        Ok(report)
    }

    pub fn status(&self) -> Result<StatusReport, LibraryError> {
        let book = self.sessions.load()?;
        let recovery = self.ledger.all()?;
        let mut counts = BTreeMap::new();
        for entry in &recovery {
            *counts.entry(entry.session_name.clone()).or_insert(0) += 1;
        }
        let (queued, permanently_failed) = self
            .queue
            .list()?
            .into_iter()
            .partition(|entry| entry.state == DeferredState::Queued);

        Ok(StatusReport {
            current: book
                .current
                .as_ref()
                .map(|session| SessionSummary::new(session, &counts)),
            previous: book
                .previous
                .iter()
                .map(|session| SessionSummary::new(session, &counts))
                .collect(),
            recovery,
            queued,
            permanently_failed,
        })
    }

    pub fn pending(&self) -> Result<Vec<DeferredOperation>, LibraryError> {
        Ok(self.queue.list()?)
    }

    /// Forgets previous sessions that are accounted and have nothing left in
    /// the ledger. The current session is never removed.
    pub fn cleanup(&self) -> Result<CleanupReport, LibraryError> {
        let counts = self.ledger.counts_by_session()?;
        let removed: Vec<String> = self
            .sessions
            .remove_previous_where(|session| {
                session.accounted_at.is_some() && !counts.contains_key(&session.name)
            })?
            .into_iter()
            .map(|session| session.name)
            .collect();
        let kept = self
            .sessions
            .load()?
            .previous
            .into_iter()
            .map(|session| session.name)
            .collect();
        info!(event = "sessions_cleaned", removed = removed.len());
        Ok(CleanupReport { removed, kept })
    }

    /// Removes a previous session and all of its recovery entries,
    /// outstanding or not.
    pub fn purge(&self, name: &str) -> Result<PurgeReport, LibraryError> {
        let name = required("session name", name)?;
        let book = self.sessions.load()?;
        if book.find_previous(&name).is_none() && book.is_current(&name) {
            return Err(LibraryError::Invalid(format!(
                "session {name} is current; activate another session before purging it"
            )));
        }
        let removed_session = self.sessions.remove_previous(&name)?.is_some();
        let removed_entries = self.ledger.remove_session(&name)?;
        if !removed_session && removed_entries == 0 {
            return Err(LibraryError::UnknownSession(name));
        }
        info!(
            event = "session_purged",
            session = %name,
            removed_entries
        );
        Ok(PurgeReport {
            session: name,
            removed_session,
            removed_entries,
        })
    }

    pub fn requeue(&self, id: &str) -> Result<(), LibraryError> {
        if !self.queue.requeue(id)? {
            return Err(LibraryError::UnknownDeferred(id.to_string()));
        }
        info!(event = "deferred_requeued", id);
        Ok(())
    }

    pub fn discard(&self, id: &str) -> Result<DeferredOperation, LibraryError> {
        let discarded = self
            .queue
            .discard(id)?
            .ok_or_else(|| LibraryError::UnknownDeferred(id.to_string()))?;
        info!(event = "deferred_discarded", id, op = discarded.operation.kind());
        Ok(discarded)
    }

    fn finish<T>(
        &self,
        operation: Operation,
        attempt: Attempt<T>,
        now: DateTime<Utc>,
    ) -> Result<Outcome<T>, LibraryError> {
        match attempt {
            Attempt::Completed(value) => {
                self.drain_opportunistically(now);
                Ok(Outcome::Completed(value))
            }
            Attempt::Contended { waited } => {
                warn!(
                    event = "store_lock_contended",
                    op = operation.kind(),
                    waited_ms = waited.as_millis() as u64
                );
                Ok(Outcome::Deferred(self.queue.enqueue(operation, now)?))
            }
        }
    }

    fn drain_opportunistically(&self, now: DateTime<Utc>) {
        match self.queue.queued() {
            Ok(queued) if queued.is_empty() => return,
            Ok(_) => {}
            Err(err) => {
                warn!(event = "opportunistic_drain_failed", error = %err);
                return;
            }
        }
        if let Err(err) = self.drain(now) {
            warn!(event = "opportunistic_drain_failed", error = %err);
        }
    }

    fn replay(&self, entry: &DeferredOperation, now: DateTime<Utc>) -> ReplayOutcome {
        debug!(event = "deferred_replay", id = %entry.id, op = entry.operation.kind());
        let attempt = match &entry.operation {
            Operation::Rate { path, stars } => self.try_rate(path, *stars).map(|a| a.map(drop)),
            Operation::RecordPlay { path, played_at } => self
                .try_record_play(path, *played_at)
                .map(|a| a.map(drop)),
            Operation::Import { track } => self.try_import(track).map(|a| a.map(drop)),
            Operation::AccountSession { name, window_end } => self
                .plan_for(name, *window_end, now)
                .and_then(|plan| self.apply_plan(&plan, now))
                .map(|a| a.map(drop)),
            Operation::RetrySession { name } => {
                self.engine().retry_all(name, now).map(|a| a.map(drop))
            }
        };
        match attempt {
            Ok(Attempt::Completed(())) => ReplayOutcome::Applied,
            Ok(Attempt::Contended { .. }) => ReplayOutcome::Contended,
            Err(err) => ReplayOutcome::Failed(err.to_string()),
        }
    }

    fn plan_for(
        &self,
        name: &str,
        window_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<AccountingPlan, LibraryError> {
        let book = self.sessions.load()?;
        let session = book
            .find_for_accounting(name)
            .ok_or_else(|| LibraryError::UnknownSession(name.to_string()))?;
        let end = session.window_end(window_end, now);
        Ok(self
            .policy
            .plan(&session.name, &session.tracks, session.activated_at, end)?
            .for_activation(session.id.clone()))
    }

    fn apply_plan(
        &self,
        plan: &AccountingPlan,
        now: DateTime<Utc>,
    ) -> Result<Attempt<AccountingReport>, LibraryError> {
        let attempt = self.engine().apply(plan, now)?;
        if let Attempt::Completed(_) = &attempt {
            self.sessions.mark_accounted(&plan.session_name, now)?;
        }
        Ok(attempt)
    }

    fn try_rate(&self, path: &str, stars: Stars) -> Result<Attempt<RateReport>, LibraryError> {
        let guard = match self
            .store
            .lock(self.config.lock_timeout())
            .map_err(StorageError::from)?
        {
            LockAttempt::Locked(guard) => guard,
            LockAttempt::TimedOut { waited } => return Ok(Attempt::Contended { waited }),
        };
        let mut table = self.store.load()?;
        let index = match table.lookup(path) {
            Lookup::Found(index) => index,
            Lookup::Missing => return Err(LibraryError::NotFound(path.to_string())),
            Lookup::Ambiguous(ids) => {
                return Err(LibraryError::Ambiguous {
                    path: path.to_string(),
                    ids,
                })
            }
        };
        let row = table
            .row_mut(index)
            .ok_or_else(|| LibraryError::NotFound(path.to_string()))?;
        row.set_stars(stars);
        let report = RateReport {
            id: row.id,
            path: row.path.clone(),
            stars,
            popm: stars.popm(),
        };
        self.store.replace_all(&guard, &table)?;
        drop(guard);

        self.tags.write_rating(Path::new(&report.path), stars)?;
        info!(event = "track_rated", id = report.id, path = %report.path, stars = stars.get());
        Ok(Attempt::Completed(report))
    }

    fn try_record_play(
        &self,
        path: &str,
        played_at: DateTime<Utc>,
    ) -> Result<Attempt<PlayReport>, LibraryError> {
        let serial = to_serial(played_at);
        let item = WriteBack {
            track: path.to_string(),
            serial,
            force_tag: false,
        };
        let results = match self.engine().write_back(std::slice::from_ref(&item))? {
            Attempt::Completed(results) => results,
            Attempt::Contended { waited } => return Ok(Attempt::Contended { waited }),
        };
        match results.into_iter().next() {
            Some(WriteBackResult::Applied { id, advanced }) => {
                info!(event = "play_recorded", id, path, serial, advanced);
                Ok(Attempt::Completed(PlayReport {
                    id,
                    path: path.to_string(),
                    serial,
                    advanced,
                }))
            }
            Some(WriteBackResult::Ambiguous(ids)) => Err(LibraryError::Ambiguous {
                path: path.to_string(),
                ids,
            }),
            Some(WriteBackResult::TagFailed(err)) => Err(LibraryError::Tag(err)),
            Some(WriteBackResult::NotFound) | None => {
                Err(LibraryError::NotFound(path.to_string()))
            }
        }
    }

    fn try_import(&self, track: &TrackImport) -> Result<Attempt<ImportReport>, LibraryError> {
        let guard = match self
            .store
            .lock(self.config.lock_timeout())
            .map_err(StorageError::from)?
        {
            LockAttempt::Locked(guard) => guard,
            LockAttempt::TimedOut { waited } => return Ok(Attempt::Contended { waited }),
        };
        let mut table = self.store.load()?;
        let id = table.insert(track)?;
        let path = table
            .rows()
            .last()
            .map(|row| row.path.clone())
            .unwrap_or_else(|| track.path.clone());
        self.store.replace_all(&guard, &table)?;
        drop(guard);
        info!(event = "track_imported", id, path = %path);
        Ok(Attempt::Completed(ImportReport { id, path }))
    }
}

fn required(what: &str, value: &str) -> Result<String, LibraryError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LibraryError::Invalid(format!("{what} cannot be empty")));
    }
    Ok(value.to_string())
}
