//! Plain-text rendering of operation reports. `--json` bypasses this and
//! prints the serialized report instead.

use musiclib_core::serial::from_serial;
use musiclib_core::DeferredOperation;
use musiclib_engine::{
    AccountingReport, ActivationReport, CleanupReport, DrainReport, ImportReport, Outcome,
    PlayReport, PurgeReport, RateReport, RetryReport, SessionSummary, StatusReport,
    TrackResult,
};
use std::fmt::Write;

fn serial_text(serial: f64) -> String {
    match from_serial(serial) {
        Some(at) => format!("{serial} ({})", at.to_rfc3339()),
        None => serial.to_string(),
    }
}

pub fn outcome<T>(outcome: &Outcome<T>, completed: impl FnOnce(&T) -> String) -> String {
    match outcome {
        Outcome::Completed(value) => completed(value),
        Outcome::Deferred(entry) => deferred(entry),
    }
}

fn deferred(entry: &DeferredOperation) -> String {
    format!(
        "deferred: store is busy; {} {} queued as {}",
        entry.operation.kind(),
        entry.operation.describe(),
        entry.id
    )
}

pub fn rate(report: &RateReport) -> String {
    format!(
        "rated {} (id {}): {} stars, POPM {}",
        report.path, report.id, report.stars, report.popm
    )
}

pub fn play(report: &PlayReport) -> String {
    let mut out = format!(
        "{} (id {}) last played {}",
        report.path,
        report.id,
        serial_text(report.serial)
    );
    if !report.advanced {
        out.push_str("; a later play was already recorded");
    }
    out
}

pub fn import(report: &ImportReport) -> String {
    format!("imported {} as id {}", report.path, report.id)
}

pub fn activation(report: &ActivationReport) -> String {
    let mut out = format!("activated {} with {} tracks", report.session, report.tracks);
    if let Some(old) = &report.superseded {
        if report.dropped_as_noise {
            let _ = write!(out, "\n{old}: dropped, it was current for less than the minimum window");
        } else if let Some(accounting) = &report.accounting {
            let _ = write!(out, "\n{}", outcome(accounting, pass));
        }
    }
    out
}

pub fn pass(report: &AccountingReport) -> String {
    let mut out = format!(
        "{}: {} ({} applied, {} pending, {} failed) over {} .. {}",
        report.session_name,
        report.status.as_str(),
        report.applied,
        report.pending,
        report.failed,
        report.window_start.to_rfc3339(),
        report.window_end.to_rfc3339()
    );
    if report.low_confidence {
        out.push_str("\nwarning: window is longer than the configured maximum");
    }
    for track in &report.tracks {
        if matches!(track.result, TrackResult::Pending | TrackResult::Failed) {
            let _ = write!(
                out,
                "\n  {:<8} #{:<4} {}  {}",
                track.result.as_str(),
                track.position,
                track.track,
                track.error.as_deref().unwrap_or("")
            );
        }
    }
    out
}

pub fn retry(report: &RetryReport) -> String {
    let mut out = format!(
        "{}: {} retried, {} resolved, {} still pending, {} failed",
        report.session_name, report.attempted, report.resolved, report.still_pending, report.failed
    );
    for entry in &report.outstanding {
        let _ = write!(
            out,
            "\n  {:<8} {}  {}",
            entry.status.as_str(),
            entry.track,
            entry.last_error.as_deref().unwrap_or("")
        );
    }
    out
}

pub fn drain(report: &DrainReport) -> String {
    if report.already_running {
        return "another drain is already running".to_string();
    }
    let mut out = format!(
        "{} applied, {} contended, {} failed attempts, {} permanently failed, {} remaining",
        report.applied,
        report.contended,
        report.failed_attempts,
        report.permanently_failed.len(),
        report.remaining
    );
    for entry in &report.permanently_failed {
        let _ = write!(out, "\n  {}", pending_line(entry));
    }
    out
}

fn session_line(summary: &SessionSummary) -> String {
    let mut line = format!(
        "{} ({} tracks) activated {}",
        summary.name,
        summary.tracks,
        summary.activated_at.to_rfc3339()
    );
    if let Some(at) = summary.superseded_at {
        let _ = write!(line, ", superseded {}", at.to_rfc3339());
    }
    match summary.accounted_at {
        Some(at) => {
            let _ = write!(line, ", accounted {}", at.to_rfc3339());
        }
        None => line.push_str(", not accounted"),
    }
    if summary.outstanding > 0 {
        let _ = write!(line, ", {} outstanding", summary.outstanding);
    }
    line
}

pub fn status(report: &StatusReport) -> String {
    let mut out = String::from("current session: ");
    match &report.current {
        Some(current) => out.push_str(&session_line(current)),
        None => out.push_str("none"),
    }
    if !report.previous.is_empty() {
        out.push_str("\nprevious sessions:");
        for summary in &report.previous {
            let _ = write!(out, "\n  {}", session_line(summary));
        }
    }
    if !report.recovery.is_empty() {
        out.push_str("\nrecovery entries:");
        for entry in &report.recovery {
            let _ = write!(
                out,
                "\n  {:<8} {} / {} at {} (attempts {}) {}",
                entry.status.as_str(),
                entry.session_name,
                entry.track,
                entry.computed_at.to_rfc3339(),
                entry.attempts,
                entry.last_error.as_deref().unwrap_or("")
            );
        }
    }
    if !report.queued.is_empty() || !report.permanently_failed.is_empty() {
        out.push_str("\ndeferred operations:");
        for entry in report.queued.iter().chain(&report.permanently_failed) {
            let _ = write!(out, "\n  {}", pending_line(entry));
        }
    }
    if !report.has_outstanding_work() {
        out.push_str("\nnothing outstanding");
    }
    out
}

pub fn pending_line(entry: &DeferredOperation) -> String {
    let mut line = format!(
        "{} [{}] {} {} (queued {}, retries {})",
        entry.id,
        entry.state,
        entry.operation.kind(),
        entry.operation.describe(),
        entry.enqueued_at.to_rfc3339(),
        entry.retry_count
    );
    if let Some(error) = &entry.last_error {
        let _ = write!(line, ": {error}");
    }
    line
}

pub fn pending(entries: &[DeferredOperation]) -> String {
    if entries.is_empty() {
        return "no deferred operations".to_string();
    }
    entries
        .iter()
        .map(pending_line)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn cleanup(report: &CleanupReport) -> String {
    let removed = if report.removed.is_empty() {
        "none".to_string()
    } else {
        report.removed.join(", ")
    };
    let mut out = format!("removed: {removed}");
    if !report.kept.is_empty() {
        let _ = write!(out, "\nkept: {}", report.kept.join(", "));
    }
    out
}

pub fn purge(report: &PurgeReport) -> String {
    format!(
        "purged {}: session {}, {} recovery entries removed",
        report.session,
        if report.removed_session { "removed" } else { "not registered" },
        report.removed_entries
    )
}
