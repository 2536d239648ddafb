use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use musiclib_core::{Stars, TrackImport};
use musiclib_engine::{ErrorKind, Library, LibraryError, Outcome};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;

mod render;
mod settings;

const EXIT_VALIDATION: u8 = 1;
const EXIT_SYSTEM: u8 = 2;
const EXIT_DEFERRED: u8 = 3;

const LOCAL_TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

#[derive(Parser)]
#[command(name = "musiclib")]
#[command(about = "Play-history and rating maintenance for a music library", long_about = None)]
#[command(rename_all = "kebab-case")]
struct Cli {
    /// Config file (default: $MUSICLIB_CONFIG or <config dir>/musiclib/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// How long to wait for a busy store before deferring the operation
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    /// Print reports as JSON on stdout
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a track's star rating (0-5)
    Rate { path: String, stars: String },
    /// Record a playback event
    Play {
        path: String,
        /// When the track was played (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Add a track to the record store
    Import {
        path: String,
        #[arg(long, default_value = "")]
        artist: String,
        #[arg(long, default_value = "")]
        album: String,
        #[arg(long, default_value = "")]
        album_artist: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        genre: String,
        #[arg(long, default_value = "")]
        length_ms: String,
    },
    /// Playlists pushed to a mobile device
    Mobile {
        #[command(subcommand)]
        action: MobileCommands,
    },
    /// Replay operations deferred by lock contention
    ProcessPending {
        /// Keep draining every N seconds instead of once
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Inspect and manage deferred operations
    Pending {
        #[command(subcommand)]
        action: PendingCommands,
    },
}

#[derive(Subcommand)]
enum MobileCommands {
    /// Make a playlist current; the one it replaces is accounted
    Activate {
        name: String,
        /// File with one track path per line; `#` lines are ignored
        tracks: PathBuf,
        #[arg(long)]
        at: Option<String>,
    },
    /// Estimate play times for a session's tracks
    UpdateLastplayed {
        name: String,
        /// RFC 3339 or MM/DD/YYYY HH:MM:SS local time
        #[arg(long)]
        end_time: Option<String>,
    },
    /// Retry a session's pending and failed tracks
    Retry { name: String },
    Status,
    /// Forget accounted sessions with nothing outstanding
    Cleanup,
    /// Remove a previous session and all its recovery entries
    Purge { name: String },
}

#[derive(Subcommand)]
enum PendingCommands {
    List,
    /// Reset a permanently failed operation to queued
    Requeue { id: String },
    Discard { id: String },
}

/// Bad command-line input that never reached the library.
#[derive(Debug, Error)]
#[error("{0}")]
struct UsageError(String);

enum Exit {
    Done,
    Deferred,
}

impl Exit {
    fn of<T>(outcome: &Outcome<T>) -> Self {
        if outcome.is_deferred() {
            Exit::Deferred
        } else {
            Exit::Done
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(EXIT_VALIDATION)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    settings::init_logging(cli.debug);

    match run(cli) {
        Ok(Exit::Done) => ExitCode::SUCCESS,
        Ok(Exit::Deferred) => ExitCode::from(EXIT_DEFERRED),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<LibraryError>() {
            return match err.kind() {
                ErrorKind::Validation => EXIT_VALIDATION,
                ErrorKind::System => EXIT_SYSTEM,
            };
        }
        if cause.downcast_ref::<UsageError>().is_some() {
            return EXIT_VALIDATION;
        }
    }
    EXIT_SYSTEM
}

fn run(cli: Cli) -> Result<Exit> {
    let config = settings::resolve(cli.config.as_deref(), cli.lock_timeout_ms)?;
    let library = Library::open(config)?;
    let json = cli.json;

    match cli.command {
        Commands::Rate { path, stars } => {
            let stars: Stars = stars.parse().map_err(LibraryError::from)?;
            let outcome = library.rate(&path, stars.get(), Utc::now())?;
            emit(json, &outcome, |o| render::outcome(o, render::rate))?;
            Ok(Exit::of(&outcome))
        }
        Commands::Play { path, at } => {
            let now = Utc::now();
            let played_at = match at {
                Some(raw) => parse_timestamp(&raw)?,
                None => now,
            };
            let outcome = library.record_play(&path, played_at, now)?;
            emit(json, &outcome, |o| render::outcome(o, render::play))?;
            Ok(Exit::of(&outcome))
        }
        Commands::Import {
            path,
            artist,
            album,
            album_artist,
            title,
            genre,
            length_ms,
        } => {
            let track = TrackImport {
                path,
                artist,
                album,
                album_artist,
                title,
                genre,
                length_ms,
            };
            let outcome = library.import(track, Utc::now())?;
            emit(json, &outcome, |o| render::outcome(o, render::import))?;
            Ok(Exit::of(&outcome))
        }
        Commands::Mobile { action } => run_mobile(&library, action, json),
        Commands::ProcessPending { interval_secs } => {
            process_pending(&library, interval_secs, json)
        }
        Commands::Pending { action } => {
            match action {
                PendingCommands::List => {
                    let entries = library.pending()?;
                    emit(json, &entries, |entries| render::pending(entries))?;
                }
                PendingCommands::Requeue { id } => {
                    library.requeue(&id)?;
                    let entries = library.pending()?;
                    emit(json, &entries, |entries| render::pending(entries))?;
                }
                PendingCommands::Discard { id } => {
                    let discarded = library.discard(&id)?;
                    emit(json, &discarded, |entry| {
                        format!("discarded {}", render::pending_line(entry))
                    })?;
                }
            }
            Ok(Exit::Done)
        }
    }
}

fn run_mobile(library: &Library, action: MobileCommands, json: bool) -> Result<Exit> {
    match action {
        MobileCommands::Activate { name, tracks, at } => {
            let contents = fs::read_to_string(&tracks)
                .with_context(|| format!("failed to read track list {}", tracks.display()))
                .map_err(|err| UsageError(format!("{err:#}")))?;
            let now = Utc::now();
            let at = match at {
                Some(raw) => parse_timestamp(&raw)?,
                None => now,
            };
            let report = library.activate_session(&name, parse_track_list(&contents), at, now)?;
            emit(json, &report, render::activation)?;
            Ok(match &report.accounting {
                Some(outcome) => Exit::of(outcome),
                None => Exit::Done,
            })
        }
        MobileCommands::UpdateLastplayed { name, end_time } => {
            let end = end_time.as_deref().map(parse_timestamp).transpose()?;
            let outcome = library.account_session(&name, end, Utc::now())?;
            emit(json, &outcome, |o| render::outcome(o, render::pass))?;
            Ok(Exit::of(&outcome))
        }
        MobileCommands::Retry { name } => {
            let outcome = library.retry(&name, Utc::now())?;
            emit(json, &outcome, |o| render::outcome(o, render::retry))?;
            Ok(Exit::of(&outcome))
        }
        MobileCommands::Status => {
            let report = library.status()?;
            emit(json, &report, render::status)?;
            Ok(Exit::Done)
        }
        MobileCommands::Cleanup => {
            let report = library.cleanup()?;
            emit(json, &report, render::cleanup)?;
            Ok(Exit::Done)
        }
        MobileCommands::Purge { name } => {
            let report = library.purge(&name)?;
            emit(json, &report, render::purge)?;
            Ok(Exit::Done)
        }
    }
}

fn process_pending(library: &Library, interval_secs: Option<u64>, json: bool) -> Result<Exit> {
    let Some(interval) = interval_secs else {
        let report = library.drain(Utc::now())?;
        emit(json, &report, render::drain)?;
        return Ok(Exit::Done);
    };
    if interval == 0 {
        return Err(UsageError("--interval-secs must be greater than zero".to_string()).into());
    }
    loop {
        let report = library.drain(Utc::now())?;
        if json || report.applied > 0 || !report.permanently_failed.is_empty() {
            emit(json, &report, render::drain)?;
        }
        std::thread::sleep(Duration::from_secs(interval));
    }
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("failed to serialize report")?
        );
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

/// Accepts RFC 3339, or `MM/DD/YYYY HH:MM:SS` in local time.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, UsageError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, LOCAL_TIME_FORMAT).map_err(|_| {
        UsageError(format!(
            "invalid time {trimmed:?}: expected RFC 3339 or MM/DD/YYYY HH:MM:SS"
        ))
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| UsageError(format!("local time {trimmed:?} does not exist")))
}

fn parse_track_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn end_time_accepts_rfc3339_and_local_format() {
        let utc = parse_timestamp("2026-04-02T10:30:00+02:00").expect("rfc3339");
        assert_eq!(utc.to_rfc3339(), "2026-04-02T08:30:00+00:00");

        let local = parse_timestamp("04/02/2026 10:30:00").expect("local");
        let expected = Local
            .with_ymd_and_hms(2026, 4, 2, 10, 30, 0)
            .earliest()
            .expect("local time exists")
            .with_timezone(&Utc);
        assert_eq!(local, expected);

        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn track_list_skips_comments_and_blank_lines() {
        let tracks = parse_track_list("# exported playlist\n/m/a.mp3\n\n  /m/b.mp3  \n#/m/c.mp3\n");
        assert_eq!(tracks, vec!["/m/a.mp3".to_string(), "/m/b.mp3".to_string()]);
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        let validation = anyhow::Error::from(LibraryError::NotFound("/m/a.mp3".into()));
        assert_eq!(exit_code(&validation), EXIT_VALIDATION);

        let usage = anyhow::Error::from(UsageError("bad".into())).context("while parsing");
        assert_eq!(exit_code(&usage), EXIT_VALIDATION);

        let config = anyhow::anyhow!("failed to parse config");
        assert_eq!(exit_code(&config), EXIT_SYSTEM);
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "musiclib",
            "mobile",
            "update-lastplayed",
            "roadtrip",
            "--end-time",
            "2026-04-02T08:30:00Z",
            "--json",
            "--lock-timeout-ms",
            "250",
        ])
        .expect("parse");
        assert!(cli.json);
        assert_eq!(cli.lock_timeout_ms, Some(250));
        match cli.command {
            Commands::Mobile {
                action: MobileCommands::UpdateLastplayed { name, end_time },
            } => {
                assert_eq!(name, "roadtrip");
                assert_eq!(end_time.as_deref(), Some("2026-04-02T08:30:00Z"));
            }
            _ => panic!("unexpected command"),
        }
    }
}
