//! User settings and preferences
//!
//! Manages settings stored in ~/.vizdb/config.toml. Every key is optional;
//! missing sections fall back to their defaults.

use crate::config::config_dir;
use crate::db::capability::CancelPolicy;
use crate::error::{ConfigError, ConfigResult};
use crate::sql::AlertMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub credentials: CredentialSettings,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub cancel: CancelSettings,

    #[serde(default)]
    pub history: HistorySettings,

    #[serde(default)]
    pub alerts: AlertSettings,
}

/// Which credential backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialBackendChoice {
    /// OS keyring when reachable, else the encrypted file if consented
    #[default]
    Auto,
    Keyring,
    EncryptedFile,
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSettings {
    #[serde(default)]
    pub backend: CredentialBackendChoice,

    /// User agreed to the encrypted-file fallback when no keyring is reachable
    #[serde(default = "default_true")]
    pub allow_file_fallback: bool,

    /// User explicitly agreed to store secrets unencrypted
    #[serde(default)]
    pub plaintext_consent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_introspect_timeout_secs")]
    pub introspect_timeout_secs: u64,

    /// Rows per streamed batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows kept in memory per result set before spilling to disk
    #[serde(default = "default_max_buffered_rows")]
    pub max_buffered_rows: usize,

    /// Pages kept per natively paginated result set
    #[serde(default = "default_page_cache")]
    pub page_cache: usize,

    /// Background worker permits
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Overrides of the per-backend cancel policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelSettings {
    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_history_size")]
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default)]
    pub mode: AlertMode,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_introspect_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    500
}

fn default_max_buffered_rows() -> usize {
    100_000
}

fn default_page_cache() -> usize {
    16
}

fn default_workers() -> usize {
    4
}

fn default_history_size() -> usize {
    1000
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            backend: CredentialBackendChoice::default(),
            allow_file_fallback: default_true(),
            plaintext_consent: false,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            introspect_timeout_secs: default_introspect_timeout_secs(),
            batch_size: default_batch_size(),
            max_buffered_rows: default_max_buffered_rows(),
            page_cache: default_page_cache(),
            workers: default_workers(),
        }
    }
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            size: default_history_size(),
        }
    }
}

impl Limits {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn introspect_timeout(&self) -> Duration {
        Duration::from_secs(self.introspect_timeout_secs)
    }
}

impl CancelSettings {
    /// Apply user overrides on top of a backend's policy
    pub fn apply(&self, policy: CancelPolicy) -> CancelPolicy {
        CancelPolicy {
            retries: self.retries.unwrap_or(policy.retries),
            attempt_timeout: self
                .attempt_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(policy.attempt_timeout),
        }
    }
}

impl Settings {
    fn validate(self) -> ConfigResult<Self> {
        if self.limits.workers == 0 {
            return Err(ConfigError::Invalid("limits.workers must be > 0".into()));
        }
        if self.limits.batch_size == 0 {
            return Err(ConfigError::Invalid("limits.batch_size must be > 0".into()));
        }
        if self.limits.max_buffered_rows < self.limits.batch_size {
            return Err(ConfigError::Invalid(
                "limits.max_buffered_rows must be at least limits.batch_size".into(),
            ));
        }
        Ok(self)
    }
}

/// Load settings from ~/.vizdb/config.toml
pub fn load_settings() -> ConfigResult<Settings> {
    load_settings_from(&config_dir()?.join("config.toml"))
}

pub fn load_settings_from(path: &Path) -> ConfigResult<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Access {
        path: path.display().to_string(),
        source,
    })?;
    let settings: Settings = toml::from_str(&content)?;
    settings.validate()
}
