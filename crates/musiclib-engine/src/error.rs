use crate::accounting::AccountingError;
use crate::config::ConfigError;
use crate::tag_writer::TagWriteError;
use musiclib_core::TrackError;
use musiclib_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Caller-facing classification. Contention is not here: it surfaces as
/// [`crate::Outcome::Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    System,
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("track not found: {0}")]
    NotFound(String),
    #[error("track reference {path} is ambiguous (ids {ids:?})")]
    Ambiguous { path: String, ids: Vec<u64> },
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("unknown deferred operation: {0}")]
    UnknownDeferred(String),
    #[error(transparent)]
    Track(#[from] TrackError),
    #[error(transparent)]
    Accounting(#[from] AccountingError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("tag write failed: {0}")]
    Tag(#[from] TagWriteError),
}

impl LibraryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LibraryError::Invalid(_)
            | LibraryError::NotFound(_)
            | LibraryError::Ambiguous { .. }
            | LibraryError::UnknownSession(_)
            | LibraryError::UnknownDeferred(_)
            | LibraryError::Track(_)
            | LibraryError::Accounting(_) => ErrorKind::Validation,
            LibraryError::Storage(
                StorageError::DuplicatePath { .. }
                | StorageError::InvalidRecord(_)
                | StorageError::Conflict(_),
            ) => ErrorKind::Validation,
            LibraryError::Config(_) | LibraryError::Storage(_) | LibraryError::Tag(_) => {
                ErrorKind::System
            }
        }
    }
}
