use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const LEDGER_FILE: &str = "recovery.json";
pub const QUEUE_FILE: &str = "pending_ops.json";
pub const SESSIONS_FILE: &str = "sessions.json";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("lock_timeout_ms must be greater than zero")]
    ZeroLockTimeout,
    #[error("decay_rate must be a positive finite number, got {0}")]
    InvalidDecayRate(f64),
    #[error("min_window_minutes ({min_minutes}) must be shorter than max_window_days ({max_days})")]
    WindowBounds { min_minutes: u64, max_days: u64 },
    #[error("tags.program must not be empty when tag writing is enabled")]
    EmptyTagProgram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_store_file")]
    pub store_file: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    #[serde(default = "default_deferred_max_retries")]
    pub deferred_max_retries: u32,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub tags: TagConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingConfig {
    /// Windows shorter than this are noise and rejected.
    #[serde(default = "default_min_window_minutes")]
    pub min_window_minutes: u64,
    /// Windows longer than this are still accounted but flagged.
    #[serde(default = "default_max_window_days")]
    pub max_window_days: u64,
    /// Steepness of the front-loading curve.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

/// External tag tool invocation. Arguments are templates: `{path}`,
/// `{serial}`, `{stars}` and `{popm}` are substituted per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tag_program")]
    pub program: String,
    #[serde(default = "default_last_played_args")]
    pub last_played_args: Vec<String>,
    #[serde(default = "default_rating_args")]
    pub rating_args: Vec<String>,
    #[serde(default = "default_tag_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("musiclib")
}

fn default_store_file() -> String {
    "musiclib.dsv".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_poll_ms() -> u64 {
    25
}

fn default_deferred_max_retries() -> u32 {
    5
}

fn default_min_window_minutes() -> u64 {
    60
}

fn default_max_window_days() -> u64 {
    40
}

fn default_decay_rate() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

fn default_tag_program() -> String {
    "kid3-cli".to_string()
}

fn default_last_played_args() -> Vec<String> {
    vec![
        "-c".to_string(),
        "set Songs-DB_Custom1 {serial}".to_string(),
        "{path}".to_string(),
    ]
}

fn default_rating_args() -> Vec<String> {
    vec![
        "-c".to_string(),
        "set POPM {popm}".to_string(),
        "{path}".to_string(),
    ]
}

fn default_tag_timeout_ms() -> u64 {
    10_000
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store_file: default_store_file(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            deferred_max_retries: default_deferred_max_retries(),
            accounting: AccountingConfig::default(),
            tags: TagConfig::default(),
        }
    }
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            min_window_minutes: default_min_window_minutes(),
            max_window_days: default_max_window_days(),
            decay_rate: default_decay_rate(),
        }
    }
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_tag_program(),
            last_played_args: default_last_played_args(),
            rating_args: default_rating_args(),
            timeout_ms: default_tag_timeout_ms(),
        }
    }
}

impl LibraryConfig {
    /// Defaults rooted at `data_dir`, with tag writing off.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self {
            data_dir: data_dir.into(),
            ..Self::default()
        };
        config.tags.enabled = false;
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::ZeroLockTimeout);
        }
        let rate = self.accounting.decay_rate;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidDecayRate(rate));
        }
        if self.accounting.min_window_minutes
            >= self.accounting.max_window_days.saturating_mul(24 * 60)
        {
            return Err(ConfigError::WindowBounds {
                min_minutes: self.accounting.min_window_minutes,
                max_days: self.accounting.max_window_days,
            });
        }
        if self.tags.enabled && self.tags.program.trim().is_empty() {
            return Err(ConfigError::EmptyTagProgram);
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_FILE)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }
}
