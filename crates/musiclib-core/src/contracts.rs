use crate::{Stars, TrackError, DSV_DELIMITER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStatus {
    /// The track was not in the record store when the pass ran.
    Pending,
    /// The store or tag update raised an error.
    Failed,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Pending => "pending",
            RecoveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outstanding accounting work for one track of one session. The computed
/// timestamp is fixed at the time of the original pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub session_name: String,
    /// Activation id of the session whose pass computed the timestamp.
    #[serde(default)]
    pub session_id: String,
    pub track: String,
    pub computed_at: DateTime<Utc>,
    pub computed_serial: f64,
    pub status: RecoveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl RecoveryEntry {
    pub fn same_key(&self, other: &RecoveryEntry) -> bool {
        self.session_name == other.session_name
            && self.session_id == other.session_id
            && self.track == other.track
    }
}

/// Descriptive columns for a track being added to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackImport {
    pub path: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub album_artist: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub length_ms: String,
}

impl TrackImport {
    /// Checks the same constraints the store enforces on write, so a bad
    /// import is refused before any lock is taken.
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.path.trim().is_empty() {
            return Err(TrackError::EmptyPath);
        }
        let fields = [
            ("SongPath", &self.path),
            ("Artist", &self.artist),
            ("Album", &self.album),
            ("AlbumArtist", &self.album_artist),
            ("SongTitle", &self.title),
            ("Genre", &self.genre),
            ("SongLength", &self.length_ms),
        ];
        for (field, value) in fields {
            if value.contains([DSV_DELIMITER, '\n', '\r']) {
                return Err(TrackError::InvalidField { field });
            }
        }
        Ok(())
    }
}

/// A whole unit of work that can be replayed from the deferred queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    Rate {
        path: String,
        stars: Stars,
    },
    RecordPlay {
        path: String,
        played_at: DateTime<Utc>,
    },
    Import {
        track: TrackImport,
    },
    AccountSession {
        name: String,
        window_end: Option<DateTime<Utc>>,
    },
    RetrySession {
        name: String,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Rate { .. } => "rate",
            Operation::RecordPlay { .. } => "record-play",
            Operation::Import { .. } => "import",
            Operation::AccountSession { .. } => "account-session",
            Operation::RetrySession { .. } => "retry-session",
        }
    }

    /// Short human-readable argument summary for status listings.
    pub fn describe(&self) -> String {
        match self {
            Operation::Rate { path, stars } => format!("{path} -> {stars} stars"),
            Operation::RecordPlay { path, played_at } => {
                format!("{path} @ {}", played_at.to_rfc3339())
            }
            Operation::Import { track } => track.path.clone(),
            Operation::AccountSession { name, window_end } => match window_end {
                Some(end) => format!("{name} until {}", end.to_rfc3339()),
                None => name.clone(),
            },
            Operation::RetrySession { name } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeferredState {
    #[default]
    Queued,
    PermanentlyFailed,
}

impl DeferredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferredState::Queued => "queued",
            DeferredState::PermanentlyFailed => "permanently-failed",
        }
    }
}

impl fmt::Display for DeferredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredOperation {
    pub id: String,
    pub operation: Operation,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub state: DeferredState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeferredOperation {
    pub fn new(operation: Operation, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            enqueued_at,
            retry_count: 0,
            state: DeferredState::Queued,
            last_error: None,
        }
    }
}
