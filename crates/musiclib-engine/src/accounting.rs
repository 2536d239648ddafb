//! Turns "this playlist sat on the device between two instants" into
//! per-track last-played timestamps and applies them.

use crate::config::AccountingConfig;
use crate::curve::DecayCurve;
use crate::outcome::Attempt;
use crate::tag_writer::{TagWriteError, TagWriter};
use crate::LibraryError;
use chrono::{DateTime, Duration, Utc};
use musiclib_core::serial::to_serial;
use musiclib_core::{RecoveryEntry, RecoveryStatus};
use musiclib_storage::{LockAttempt, Lookup, RecoveryLedger, StorageError, TrackStore};
use serde::Serialize;
use std::path::Path;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_CONFIG_MINUTES: u64 = 1_000_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum AccountingError {
    #[error("window end {end} is not after window start {start}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("window of {minutes} minutes is shorter than the {min_minutes} minute minimum")]
    WindowTooShort { minutes: i64, min_minutes: i64 },
    #[error("decay rate must be positive and finite, got {0}")]
    InvalidDecayRate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountingPolicy {
    min_window: Duration,
    max_window: Duration,
    curve: DecayCurve,
}

impl AccountingPolicy {
    pub fn new(min_window: Duration, max_window: Duration, curve: DecayCurve) -> Self {
        Self {
            min_window,
            max_window,
            curve,
        }
    }

    pub fn from_config(config: &AccountingConfig) -> Result<Self, AccountingError> {
        let minutes = |value: u64| Duration::minutes(value.min(MAX_CONFIG_MINUTES) as i64);
        Ok(Self::new(
            minutes(config.min_window_minutes),
            minutes(config.max_window_days.saturating_mul(24 * 60)),
            DecayCurve::new(config.decay_rate)?,
        ))
    }

    pub fn min_window(&self) -> Duration {
        self.min_window
    }

    /// Validates the window and computes every track's timestamp. No state
    /// is touched; a rejected window has no effect at all.
    pub fn plan(
        &self,
        session_name: &str,
        tracks: &[String],
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<AccountingPlan, AccountingError> {
        if window_end <= window_start {
            return Err(AccountingError::InvalidWindow {
                start: window_start,
                end: window_end,
            });
        }
        let span = window_end - window_start;
        if span < self.min_window {
            return Err(AccountingError::WindowTooShort {
                minutes: span.num_minutes(),
                min_minutes: self.min_window.num_minutes(),
            });
        }
        let low_confidence = span > self.max_window;
        if low_confidence {
            warn!(
                event = "accounting_window_long",
                session = session_name,
                days = span.num_days(),
                max_days = self.max_window.num_days()
            );
        }

        let planned = self
            .curve
            .timestamps(tracks.len(), window_start, window_end)
            .into_iter()
            .zip(tracks)
            .enumerate()
            .map(|(position, (computed_at, track))| PlannedTrack {
                position,
                track: track.clone(),
                computed_at,
                serial: to_serial(computed_at),
            })
            .collect();

        Ok(AccountingPlan {
            session_name: session_name.to_string(),
            session_id: String::new(),
            window_start,
            window_end,
            low_confidence,
            tracks: planned,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedTrack {
    pub position: usize,
    pub track: String,
    pub computed_at: DateTime<Utc>,
    pub serial: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountingPlan {
    pub session_name: String,
    /// Activation id recorded on ledger entries this plan produces.
    pub session_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub low_confidence: bool,
    pub tracks: Vec<PlannedTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassStatus {
    /// Every track applied; nothing left in the ledger.
    Complete,
    /// Some tracks were recorded as pending or failed.
    Partial,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Complete => "complete",
            PassStatus::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackResult {
    Applied,
    /// The store already held this or a later value.
    AlreadyCurrent,
    Pending,
    Failed,
}

impl TrackResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackResult::Applied => "applied",
            TrackResult::AlreadyCurrent => "already-current",
            TrackResult::Pending => "pending",
            TrackResult::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackOutcome {
    pub position: usize,
    pub track: String,
    pub computed_at: DateTime<Utc>,
    pub serial: f64,
    pub result: TrackResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountingReport {
    pub session_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub low_confidence: bool,
    pub status: PassStatus,
    pub applied: usize,
    pub pending: usize,
    pub failed: usize,
    pub tracks: Vec<TrackOutcome>,
}

impl AccountingPlan {
    pub fn for_activation(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

impl AccountingReport {
    pub fn outstanding(&self) -> usize {
        self.pending + self.failed
    }
}

/// One last-played update to apply.
#[derive(Debug, Clone)]
pub(crate) struct WriteBack {
    pub track: String,
    pub serial: f64,
    /// Rewrite the tag even when the store value does not move.
    pub force_tag: bool,
}

#[derive(Debug)]
pub(crate) enum WriteBackResult {
    Applied { id: u64, advanced: bool },
    NotFound,
    Ambiguous(Vec<u64>),
    TagFailed(TagWriteError),
}

/// Store, ledger and tag collaborator for one pass or retry.
pub struct AccountingEngine<'a> {
    pub(crate) store: &'a TrackStore,
    pub(crate) ledger: &'a RecoveryLedger,
    pub(crate) tags: &'a dyn TagWriter,
    pub(crate) lock_timeout: StdDuration,
}

impl<'a> AccountingEngine<'a> {
    pub fn new(
        store: &'a TrackStore,
        ledger: &'a RecoveryLedger,
        tags: &'a dyn TagWriter,
        lock_timeout: StdDuration,
    ) -> Self {
        Self {
            store,
            ledger,
            tags,
            lock_timeout,
        }
    }

    /// Applies a plan under a single store lock acquisition, then writes
    /// tags, then reconciles the recovery ledger for the session.
    pub fn apply(
        &self,
        plan: &AccountingPlan,
        now: DateTime<Utc>,
    ) -> Result<Attempt<AccountingReport>, LibraryError> {
        let outstanding_before: Vec<String> = self
            .ledger
            .list(&plan.session_name)?
            .into_iter()
            .map(|entry| entry.track)
            .collect();
        let items: Vec<WriteBack> = plan
            .tracks
            .iter()
            .map(|planned| WriteBack {
                track: planned.track.clone(),
                serial: planned.serial,
                force_tag: outstanding_before.contains(&planned.track),
            })
            .collect();

        let results = match self.write_back(&items)? {
            Attempt::Completed(results) => results,
            Attempt::Contended { waited } => return Ok(Attempt::Contended { waited }),
        };

        let mut report = AccountingReport {
            session_name: plan.session_name.clone(),
            window_start: plan.window_start,
            window_end: plan.window_end,
            low_confidence: plan.low_confidence,
            status: PassStatus::Complete,
            applied: 0,
            pending: 0,
            failed: 0,
            tracks: Vec::with_capacity(plan.tracks.len()),
        };
        let mut resolved = Vec::new();
        let mut outstanding = Vec::new();

        for (planned, result) in plan.tracks.iter().zip(results) {
            let (track_result, error) = match result {
                WriteBackResult::Applied { advanced, .. } => {
                    report.applied += 1;
                    resolved.push(planned.track.clone());
                    if advanced {
                        (TrackResult::Applied, None)
                    } else {
                        (TrackResult::AlreadyCurrent, None)
                    }
                }
                WriteBackResult::NotFound => {
                    report.pending += 1;
                    (TrackResult::Pending, Some("not in record store".to_string()))
                }
                WriteBackResult::Ambiguous(ids) => {
                    report.failed += 1;
                    (
                        TrackResult::Failed,
                        Some(format!("ambiguous track reference (ids {ids:?})")),
                    )
                }
                WriteBackResult::TagFailed(err) => {
                    report.failed += 1;
                    (TrackResult::Failed, Some(err.to_string()))
                }
            };

            debug!(
                event = "track_accounted",
                session = %plan.session_name,
                position = planned.position,
                track = %planned.track,
                serial = planned.serial,
                result = ?track_result
            );
            if matches!(track_result, TrackResult::Pending | TrackResult::Failed) {
                outstanding.push(RecoveryEntry {
                    session_name: plan.session_name.clone(),
                    session_id: plan.session_id.clone(),
                    track: planned.track.clone(),
                    computed_at: planned.computed_at,
                    computed_serial: planned.serial,
                    status: if track_result == TrackResult::Pending {
                        RecoveryStatus::Pending
                    } else {
                        RecoveryStatus::Failed
                    },
                    last_error: error.clone(),
                    attempts: 0,
                    recorded_at: now,
                });
            }
            report.tracks.push(TrackOutcome {
                position: planned.position,
                track: planned.track.clone(),
                computed_at: planned.computed_at,
                serial: planned.serial,
                result: track_result,
                error,
            });
        }

        self.ledger
            .reconcile(&plan.session_name, &resolved, &outstanding)?;
        if report.outstanding() > 0 {
            report.status = PassStatus::Partial;
        }
        info!(
            event = "accounting_pass",
            session = %plan.session_name,
            status = ?report.status,
            applied = report.applied,
            pending = report.pending,
            failed = report.failed,
            low_confidence = report.low_confidence
        );
        Ok(Attempt::Completed(report))
    }

    /// Advances `last_played` for every item under one lock, replaces the
    /// store once, then writes tags after the lock is released.
    pub(crate) fn write_back(
        &self,
        items: &[WriteBack],
    ) -> Result<Attempt<Vec<WriteBackResult>>, LibraryError> {
        let guard = match self.store.lock(self.lock_timeout).map_err(StorageError::from)? {
            LockAttempt::Locked(guard) => guard,
            LockAttempt::TimedOut { waited } => return Ok(Attempt::Contended { waited }),
        };
        let mut table = self.store.load()?;
        let mut results = Vec::with_capacity(items.len());
        let mut tag_queue: Vec<(usize, String, f64)> = Vec::new();
        let mut dirty = false;

        for item in items {
            let index = match table.lookup(&item.track) {
                Lookup::Found(index) => index,
                Lookup::Missing => {
                    results.push(WriteBackResult::NotFound);
                    continue;
                }
                Lookup::Ambiguous(ids) => {
                    results.push(WriteBackResult::Ambiguous(ids));
                    continue;
                }
            };
            let Some(row) = table.row_mut(index) else {
                results.push(WriteBackResult::NotFound);
                continue;
            };
            let advanced = row.advance_last_played(item.serial);
            dirty |= advanced;
            if advanced || item.force_tag {
                let value = row.last_played.unwrap_or(item.serial);
                tag_queue.push((results.len(), row.path.clone(), value));
            }
            results.push(WriteBackResult::Applied {
                id: row.id,
                advanced,
            });
        }

        if dirty {
            self.store.replace_all(&guard, &table)?;
        }
        drop(guard);

        for (index, path, serial) in tag_queue {
            if let Err(err) = self.tags.write_last_played(Path::new(&path), serial) {
                warn!(event = "tag_write_failed", path = %path, error = %err);
                results[index] = WriteBackResult::TagFailed(err);
            }
        }
        Ok(Attempt::Completed(results))
    }
}
