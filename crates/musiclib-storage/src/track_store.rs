use crate::{write_atomic, LockAttempt, LockError, LockFile, LockGuard, StorageError};
use musiclib_core::serial::{format_serial, parse_serial};
use musiclib_core::{
    normalize_track_path, Stars, TrackImport, TrackRecord, COLUMN_COUNT, DSV_DELIMITER,
    DSV_HEADER,
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Result of resolving a track path against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Found(usize),
    Ambiguous(Vec<u64>),
}

/// In-memory copy of the whole record store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTable {
    rows: Vec<TrackRecord>,
}

impl TrackTable {
    pub fn new(rows: Vec<TrackRecord>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[TrackRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&TrackRecord> {
        self.rows.get(index)
    }

    pub fn row_mut(&mut self, index: usize) -> Option<&mut TrackRecord> {
        self.rows.get_mut(index)
    }

    /// Every row stored under the canonical form of `path`.
    pub fn find(&self, path: impl AsRef<Path>) -> Vec<&TrackRecord> {
        let key = path_key(path.as_ref());
        self.rows.iter().filter(|row| row.path == key).collect()
    }

    pub fn lookup(&self, path: impl AsRef<Path>) -> Lookup {
        let key = path_key(path.as_ref());
        let mut matches = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.path == key);
        match (matches.next(), matches.next()) {
            (None, _) => Lookup::Missing,
            (Some((index, _)), None) => Lookup::Found(index),
            (Some((_, first)), Some((_, second))) => {
                let mut ids = vec![first.id, second.id];
                ids.extend(matches.map(|(_, row)| row.id));
                Lookup::Ambiguous(ids)
            }
        }
    }

    pub fn next_id(&self) -> u64 {
        self.rows.iter().map(|row| row.id).max().unwrap_or(0) + 1
    }

    /// Appends a new row and returns its id. The path is canonicalized first
    /// and must not already be present.
    pub fn insert(&mut self, import: &TrackImport) -> Result<u64, StorageError> {
        let key = path_key(Path::new(&import.path));
        if let Some(existing) = self.rows.iter().find(|row| row.path == key) {
            return Err(StorageError::DuplicatePath {
                path: key,
                id: existing.id,
            });
        }

        let id = self.next_id();
        let mut record = TrackRecord::new(id, key);
        record.artist = import.artist.clone();
        record.album = import.album.clone();
        record.album_artist = import.album_artist.clone();
        record.title = import.title.clone();
        record.genre = import.genre.clone();
        record.length_ms = import.length_ms.clone();
        record.validate_fields()?;
        self.rows.push(record);
        Ok(id)
    }

    pub fn parse(source: &Path, content: &str) -> Result<Self, StorageError> {
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        match lines.next() {
            None => return Ok(Self::default()),
            Some((_, header)) => {
                if header.split(DSV_DELIMITER).next() != Some(DSV_HEADER[0]) {
                    return Err(StorageError::MissingHeader {
                        path: source.to_path_buf(),
                    });
                }
            }
        }

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            rows.push(parse_row(line).map_err(|reason| StorageError::MalformedRow {
                path: source.to_path_buf(),
                line: line_no,
                reason,
            })?);
        }
        Ok(Self { rows })
    }

    pub fn render(&self) -> Result<String, StorageError> {
        let separator = DSV_DELIMITER.to_string();
        let mut out = DSV_HEADER.join(separator.as_str());
        out.push('\n');
        for row in &self.rows {
            row.validate_fields()?;
            let id = row.id.to_string();
            let stars = row.stars.to_string();
            let last_played = row.last_played.map(format_serial).unwrap_or_default();
            let fields: [&str; COLUMN_COUNT] = [
                &id,
                &row.artist,
                &row.album_id,
                &row.album,
                &row.album_artist,
                &row.title,
                &row.path,
                &row.genre,
                &row.length_ms,
                &row.popm,
                &row.custom2,
                &stars,
                &last_played,
            ];
            out.push_str(&fields.join(separator.as_str()));
            out.push('\n');
        }
        Ok(out)
    }
}

fn parse_row(line: &str) -> Result<TrackRecord, String> {
    let mut fields: Vec<&str> = line.split(DSV_DELIMITER).collect();
    if fields.len() > COLUMN_COUNT {
        return Err(format!(
            "expected {COLUMN_COUNT} columns, found {}",
            fields.len()
        ));
    }
    fields.resize(COLUMN_COUNT, "");

    let id = fields[0]
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid ID '{}'", fields[0]))?;
    let stars = fields[11]
        .parse::<Stars>()
        .map_err(|err| err.to_string())?;
    let last_played = parse_serial(fields[12])?;

    Ok(TrackRecord {
        id,
        artist: fields[1].to_string(),
        album_id: fields[2].to_string(),
        album: fields[3].to_string(),
        album_artist: fields[4].to_string(),
        title: fields[5].to_string(),
        path: fields[6].to_string(),
        genre: fields[7].to_string(),
        length_ms: fields[8].to_string(),
        popm: fields[9].to_string(),
        custom2: fields[10].to_string(),
        stars,
        last_played,
    })
}

fn path_key(path: &Path) -> String {
    normalize_track_path(path).to_string_lossy().into_owned()
}

/// The flat-file record store and its lock.
///
/// Reads never lock: the file is only ever replaced whole. Writes require a
/// [`LockGuard`] for this store's lock file.
#[derive(Debug, Clone)]
pub struct TrackStore {
    path: PathBuf,
    lock: LockFile,
}

impl TrackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = LockFile::beside(&path);
        Self { path, lock }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.lock = self.lock.with_poll_interval(poll_interval);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_file(&self) -> &LockFile {
        &self.lock
    }

    pub fn lock(&self, timeout: Duration) -> Result<LockAttempt, LockError> {
        self.lock.acquire(timeout)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the whole store. A missing file is an empty store.
    pub fn load(&self) -> Result<TrackTable, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => TrackTable::parse(&self.path, &content),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(TrackTable::default()),
            Err(err) => Err(StorageError::io(&self.path, err)),
        }
    }

    pub fn find(&self, path: impl AsRef<Path>) -> Result<Vec<TrackRecord>, StorageError> {
        let table = self.load()?;
        Ok(table.find(path).into_iter().cloned().collect())
    }

    /// Atomically replaces the store with `table`.
    pub fn replace_all(&self, guard: &LockGuard, table: &TrackTable) -> Result<(), StorageError> {
        if guard.path() != self.lock.path() {
            return Err(StorageError::Conflict(format!(
                "replace of {} attempted while holding {}",
                self.path.display(),
                guard.path().display()
            )));
        }
        let rendered = table.render()?;
        write_atomic(&self.path, rendered.as_bytes())?;
        info!(
            event = "store_replaced",
            path = %self.path.display(),
            rows = table.len()
        );
        Ok(())
    }
}
