//! Configuration file parser for `feedsync.toml`.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as warnings, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{
    RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_MAX_FEED_SIZE, DEFAULT_MAX_RETRIES,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `None` means `feedsync.db` in the working directory.
    pub database_path: Option<PathBuf>,

    /// Default log level when `RUST_LOG` is not set.
    pub log_level: String,

    /// Update pipeline settings (`[update]` table).
    pub update: UpdateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            update: UpdateConfig::default(),
        }
    }
}

/// Settings for the feed update pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Total attempts per feed in concurrent mode, including the first.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Maximum feeds fetched at once in concurrent mode.
    pub max_concurrency: usize,
    pub max_feed_size_bytes: usize,
    /// Empty string means the built-in `feedsync/<version>` agent.
    pub user_agent: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_feed_size_bytes: DEFAULT_MAX_FEED_SIZE,
            user_agent: String::new(),
        }
    }
}

impl UpdateConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 3] = ["database_path", "log_level", "update"];
    const KNOWN_UPDATE_KEYS: [&'static str; 6] = [
        "max_retries",
        "base_delay_ms",
        "fetch_timeout_secs",
        "max_concurrency",
        "max_feed_size_bytes",
        "user_agent",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text. Blank input yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        tracing::debug!(config = ?config, "Loaded configuration");
        Ok(config)
    }

    /// Database path, falling back to `feedsync.db` in the working directory.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("feedsync.db"))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        if key != "update" {
            continue;
        }
        let Some(update) = value.as_table() else {
            continue;
        };
        for update_key in update.keys() {
            if !Config::KNOWN_UPDATE_KEYS.contains(&update_key.as_str()) {
                tracing::warn!(key = %update_key, table = "update", "Unknown key in config file, ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
