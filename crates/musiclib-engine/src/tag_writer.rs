//! Persists last-played and rating values into the media files themselves.

use crate::config::TagConfig;
use musiclib_core::serial::format_serial;
use musiclib_core::Stars;
use std::io::Read;
use std::path::Path;
use std::process::{ChildStderr, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const WAIT_POLL: Duration = Duration::from_millis(10);
/// How long to wait for stderr to reach EOF once the tool has exited.
const STDERR_GRACE: Duration = Duration::from_millis(500);
/// Tail of stderr kept for the error message.
const MAX_DETAILS: usize = 2_000;

#[derive(Debug, Error)]
pub enum TagWriteError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed: {details}")]
    Exit { program: String, details: String },
    #[error("{program} did not finish within {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },
}

pub trait TagWriter: Send + Sync {
    fn write_last_played(&self, path: &Path, serial: f64) -> Result<(), TagWriteError>;
    fn write_rating(&self, path: &Path, stars: Stars) -> Result<(), TagWriteError>;
}

/// Used when tag writing is disabled; the store stays authoritative.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagWriter;

impl TagWriter for NoopTagWriter {
    fn write_last_played(&self, _path: &Path, _serial: f64) -> Result<(), TagWriteError> {
        Ok(())
    }

    fn write_rating(&self, _path: &Path, _stars: Stars) -> Result<(), TagWriteError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExternalTagWriter {
    program: String,
    last_played_args: Vec<String>,
    rating_args: Vec<String>,
    timeout: Duration,
}

impl ExternalTagWriter {
    pub fn new(config: &TagConfig) -> Self {
        Self {
            program: config.program.clone(),
            last_played_args: config.last_played_args.clone(),
            rating_args: config.rating_args.clone(),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
        }
    }

    fn run(&self, templates: &[String], values: &[(&str, String)]) -> Result<(), TagWriteError> {
        let args: Vec<String> = templates
            .iter()
            .map(|template| substitute(template, values))
            .collect();
        debug!(event = "tag_write", program = %self.program, args = ?args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TagWriteError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drained concurrently so a chatty tool never blocks on a full pipe.
        let stderr = child.stderr.take().map(drain_stderr);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TagWriteError::Timeout {
                        program: self.program.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(source) => {
                    let _ = child.kill();
                    return Err(TagWriteError::Spawn {
                        program: self.program.clone(),
                        source,
                    });
                }
            }
        };

        if status.success() {
            return Ok(());
        }
        let output = stderr
            .and_then(|rx| rx.recv_timeout(STDERR_GRACE).ok())
            .unwrap_or_default();
        let output = String::from_utf8_lossy(&output);
        let output = tail(output.trim(), MAX_DETAILS);
        let details = if output.is_empty() {
            format!("exited with status {status}")
        } else {
            output.to_string()
        };
        Err(TagWriteError::Exit {
            program: self.program.clone(),
            details,
        })
    }
}

impl TagWriter for ExternalTagWriter {
    fn write_last_played(&self, path: &Path, serial: f64) -> Result<(), TagWriteError> {
        self.run(
            &self.last_played_args,
            &[
                ("path", path.display().to_string()),
                ("serial", format_serial(serial)),
            ],
        )
    }

    fn write_rating(&self, path: &Path, stars: Stars) -> Result<(), TagWriteError> {
        self.run(
            &self.rating_args,
            &[
                ("path", path.display().to_string()),
                ("stars", stars.to_string()),
                ("popm", stars.popm().to_string()),
            ],
        )
    }
}

pub fn from_config(config: &TagConfig) -> Box<dyn TagWriter> {
    if config.enabled {
        Box::new(ExternalTagWriter::new(config))
    } else {
        Box::new(NoopTagWriter)
    }
}

fn drain_stderr(mut pipe: ChildStderr) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn substitute(template: &str, values: &[(&str, String)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
}
