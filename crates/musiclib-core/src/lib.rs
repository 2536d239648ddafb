use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub mod contracts;
pub mod serial;
pub mod session;

pub use contracts::{
    DeferredOperation, DeferredState, Operation, RecoveryEntry, RecoveryStatus, TrackImport,
};
pub use session::PlaylistSession;

pub const DSV_DELIMITER: char = '^';
pub const DSV_HEADER: [&str; COLUMN_COUNT] = [
    "ID",
    "Artist",
    "IDAlbum",
    "Album",
    "AlbumArtist",
    "SongTitle",
    "SongPath",
    "Genre",
    "SongLength",
    "Rating",
    "Custom2",
    "GroupDesc",
    "LastTimePlayed",
];
pub const COLUMN_COUNT: usize = 13;
pub const MAX_STARS: u8 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("rating must be an integer between 0 and 5, got {0}")]
    InvalidStars(String),
    #[error("field {field} cannot contain '^' or line breaks")]
    InvalidField { field: &'static str },
    #[error("track path cannot be empty")]
    EmptyPath,
}

/// Star rating 0..=5 as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Stars(u8);

impl Stars {
    pub fn new(value: u8) -> Result<Self, TrackError> {
        if value > MAX_STARS {
            return Err(TrackError::InvalidStars(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Raw POPM byte written alongside the star rating.
    pub fn popm(self) -> u8 {
        match self.0 {
            0 => 0,
            1 => 1,
            2 => 64,
            3 => 128,
            4 => 196,
            _ => 255,
        }
    }
}

impl TryFrom<u8> for Stars {
    type Error = TrackError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Stars::new(value)
    }
}

impl From<Stars> for u8 {
    fn from(value: Stars) -> Self {
        value.0
    }
}

impl FromStr for Stars {
    type Err = TrackError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Stars(0));
        }
        trimmed
            .parse::<u8>()
            .map_err(|_| TrackError::InvalidStars(trimmed.to_string()))
            .and_then(Stars::new)
    }
}

impl fmt::Display for Stars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the record store.
///
/// Only `id`, `path`, `stars`, `popm` and `last_played` carry meaning for the
/// locking and accounting core; the descriptive columns are carried through
/// untouched so a rewrite never loses data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: u64,
    pub artist: String,
    pub album_id: String,
    pub album: String,
    pub album_artist: String,
    pub title: String,
    pub path: String,
    pub genre: String,
    pub length_ms: String,
    pub popm: String,
    pub custom2: String,
    pub stars: Stars,
    pub last_played: Option<f64>,
}

impl TrackRecord {
    pub fn new(id: u64, path: impl Into<String>) -> Self {
        Self {
            id,
            artist: String::new(),
            album_id: String::new(),
            album: String::new(),
            album_artist: String::new(),
            title: String::new(),
            path: path.into(),
            genre: String::new(),
            length_ms: String::new(),
            popm: String::new(),
            custom2: String::new(),
            stars: Stars::default(),
            last_played: None,
        }
    }

    pub fn set_stars(&mut self, stars: Stars) {
        self.stars = stars;
        self.popm = stars.popm().to_string();
    }

    /// Moves `last_played` forward to `serial`. Returns false when the stored
    /// value is already at or past it.
    pub fn advance_last_played(&mut self, serial: f64) -> bool {
        match self.last_played {
            Some(current) if current >= serial => false,
            _ => {
                self.last_played = Some(serial);
                true
            }
        }
    }

    pub fn text_fields(&self) -> [(&'static str, &str); 10] {
        [
            ("Artist", &self.artist),
            ("IDAlbum", &self.album_id),
            ("Album", &self.album),
            ("AlbumArtist", &self.album_artist),
            ("SongTitle", &self.title),
            ("SongPath", &self.path),
            ("Genre", &self.genre),
            ("SongLength", &self.length_ms),
            ("Rating", &self.popm),
            ("Custom2", &self.custom2),
        ]
    }

    pub fn validate_fields(&self) -> Result<(), TrackError> {
        if self.path.trim().is_empty() {
            return Err(TrackError::EmptyPath);
        }
        for (field, value) in self.text_fields() {
            if value.contains([DSV_DELIMITER, '\n', '\r']) {
                return Err(TrackError::InvalidField { field });
            }
        }
        Ok(())
    }
}

/// Canonical lookup key for a track path.
///
/// Existing files resolve through the filesystem; anything else is made
/// absolute against the working directory and cleaned lexically so that
/// tracks which are not imported yet still compare stably.
pub fn normalize_track_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
