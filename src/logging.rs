//! Logging setup
//!
//! Log lines go to `<config dir>/vizdb.log` so terminal output stays clean.
//! The filter comes from `VIZDB_LOG`, then `RUST_LOG`, then `vizdb=info`.
//! When the file cannot be opened, warnings and errors go to stderr instead.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "VIZDB_LOG";

pub const DEFAULT_FILTER: &str = "vizdb=info";

/// Install the global subscriber. Returns the log file path when file
/// logging is active. Calling it twice is harmless.
pub fn init() -> Option<PathBuf> {
    let path = crate::config::config_dir()
        .ok()
        .map(|dir| dir.join("vizdb.log"));
    match path.as_deref().map(init_file) {
        Some(Ok(())) => path,
        Some(Err(e)) => {
            init_stderr();
            tracing::warn!(error = %e, "file logging unavailable, using stderr");
            None
        }
        None => {
            init_stderr();
            None
        }
    }
}

fn init_file(path: &Path) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    // Err only when a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_target(true)
        .try_init();
    Ok(())
}

fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
