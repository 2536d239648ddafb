//! Config file discovery, environment overrides and logging setup.

use anyhow::{Context, Result};
use musiclib_engine::LibraryConfig;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const CONFIG_ENV: &str = "MUSICLIB_CONFIG";
pub const DATA_DIR_ENV: &str = "MUSICLIB_DATA_DIR";
pub const LOCK_TIMEOUT_ENV: &str = "MUSICLIB_LOCK_TIMEOUT_MS";
pub const LOG_LEVEL_ENV: &str = "MUSICLIB_LOG_LEVEL";

pub fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = env::var(LOG_LEVEL_ENV) {
        level
    } else {
        "warn".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Where the config file is looked up: `--config`, then `$MUSICLIB_CONFIG`,
/// then `<config_dir>/musiclib/config.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("musiclib/config.toml")
}

/// A missing file yields defaults unless the path was given explicitly.
pub fn load_config(path: &Path, explicit: bool) -> Result<LibraryConfig> {
    if !path.exists() {
        if explicit {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        debug!(event = "config_defaults", path = %path.display());
        return Ok(LibraryConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    debug!(event = "config_loaded", path = %path.display());
    Ok(config)
}

/// Environment first, then the command-line flag.
pub fn apply_overrides<F>(
    config: &mut LibraryConfig,
    lookup: F,
    lock_timeout_ms: Option<u64>,
) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup(DATA_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(raw) = lookup(LOCK_TIMEOUT_ENV) {
        config.lock_timeout_ms = raw
            .trim()
            .parse()
            .with_context(|| format!("{LOCK_TIMEOUT_ENV} must be a whole number of ms, got {raw:?}"))?;
    }
    if let Some(ms) = lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }
    Ok(())
}

pub fn resolve(explicit: Option<&Path>, lock_timeout_ms: Option<u64>) -> Result<LibraryConfig> {
    let path = config_path(explicit);
    let mut config = load_config(&path, explicit.is_some())?;
    apply_overrides(&mut config, |key| env::var(key).ok(), lock_timeout_ms)?;
    Ok(config)
}
