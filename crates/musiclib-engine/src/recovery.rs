use crate::accounting::{AccountingEngine, WriteBack, WriteBackResult};
use crate::outcome::Attempt;
use crate::LibraryError;
use chrono::{DateTime, Utc};
use musiclib_core::{RecoveryEntry, RecoveryStatus};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RetryReport {
    pub session_name: String,
    pub attempted: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub failed: usize,
    pub outstanding: Vec<RecoveryEntry>,
}

impl AccountingEngine<'_> {
    /// Re-attempts every ledger entry of a session with its originally
    /// computed timestamp. Pending entries get a fresh lookup; failed ones a
    /// fresh store and tag write. A session with nothing outstanding is a
    /// no-op that never touches the store lock.
    pub fn retry_all(
        &self,
        session_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Attempt<RetryReport>, LibraryError> {
        let entries = self.ledger.list(session_name)?;
        let mut report = RetryReport {
            session_name: session_name.to_string(),
            ..RetryReport::default()
        };
        if entries.is_empty() {
            return Ok(Attempt::Completed(report));
        }

        let items: Vec<WriteBack> = entries
            .iter()
            .map(|entry| WriteBack {
                track: entry.track.clone(),
                serial: entry.computed_serial,
                force_tag: true,
            })
            .collect();
        let results = match self.write_back(&items)? {
            Attempt::Completed(results) => results,
            Attempt::Contended { waited } => return Ok(Attempt::Contended { waited }),
        };

        let mut resolved = Vec::new();
        for (entry, result) in entries.into_iter().zip(results) {
            report.attempted += 1;
            let (status, error) = match result {
                WriteBackResult::Applied { .. } => {
                    report.resolved += 1;
                    resolved.push(entry.track);
                    continue;
                }
                WriteBackResult::NotFound => {
                    report.still_pending += 1;
                    (RecoveryStatus::Pending, "not in record store".to_string())
                }
                WriteBackResult::Ambiguous(ids) => {
                    report.failed += 1;
                    (
                        RecoveryStatus::Failed,
                        format!("ambiguous track reference (ids {ids:?})"),
                    )
                }
                WriteBackResult::TagFailed(err) => {
                    report.failed += 1;
                    (RecoveryStatus::Failed, err.to_string())
                }
            };
            report.outstanding.push(RecoveryEntry {
                status,
                last_error: Some(error),
                attempts: entry.attempts + 1,
                recorded_at: now,
                ..entry
            });
        }

        self.ledger
            .reconcile(session_name, &resolved, &report.outstanding)?;
        info!(
            event = "recovery_retry",
            session = session_name,
            attempted = report.attempted,
            resolved = report.resolved,
            still_pending = report.still_pending,
            failed = report.failed
        );
        Ok(Attempt::Completed(report))
    }
}
