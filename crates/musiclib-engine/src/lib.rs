//! Accounting, recovery and the operation facade over the record store.

pub mod accounting;
pub mod config;
pub mod curve;
mod error;
pub mod library;
mod outcome;
pub mod recovery;
pub mod tag_writer;

pub use accounting::{
    AccountingEngine, AccountingError, AccountingPlan, AccountingPolicy, AccountingReport,
    PassStatus, PlannedTrack, TrackOutcome, TrackResult,
};
pub use config::{AccountingConfig, ConfigError, LibraryConfig, TagConfig};
pub use curve::DecayCurve;
pub use error::{ErrorKind, LibraryError};
pub use library::{
    ActivationReport, CleanupReport, ImportReport, Library, PlayReport, PurgeReport, RateReport,
    SessionSummary, StatusReport,
};
pub use musiclib_storage::DrainReport;
pub use outcome::{Attempt, Outcome};
pub use recovery::RetryReport;
pub use tag_writer::{ExternalTagWriter, NoopTagWriter, TagWriteError, TagWriter};
