//! Configuration management
//!
//! Handles loading connection profiles and user settings from the config
//! directory (`~/.vizdb/`, or `$VIZDB_HOME` when set).

pub mod connections;
pub mod settings;

pub use connections::{ConnectionProfile, Endpoint, ProfileStore, TunnelAuth, TunnelSpec};
pub use settings::{CredentialBackendChoice, Settings};

use crate::error::{ConfigError, ConfigResult};
use std::path::PathBuf;

/// Environment variable overriding the config directory
pub const HOME_ENV: &str = "VIZDB_HOME";

/// Get the config directory path
pub fn config_dir() -> ConfigResult<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".vizdb"))
}
