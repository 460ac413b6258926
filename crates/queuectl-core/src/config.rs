//! The two operator tunables plus the ambient process-supervision
//! knobs added by this repository's expanded spec (SPEC_FULL.md §4.6).
//!
//! Persisted as `config.json` inside the data directory (spec.md §6).
//! Unknown keys are rejected by `config set`; a config file that fails
//! to parse at all is reset to defaults on read. A config file with
//! unknown-but-harmless extra keys (e.g. written by a newer version)
//! keeps its known keys rather than being wholesale reset.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{QueueError, Result};

/// The four config keys the CLI's `config show`/`config set` operate on.
pub const KNOWN_KEYS: [&str; 4] = [
    "max_retries",
    "backoff_base",
    "busy_timeout_secs",
    "stale_processing_secs",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Retry budget snapshotted onto each job at enqueue time.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff delay is `backoff_base ^ attempts` seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u32,
    /// How long a writer waits for the SQLite write lock before the
    /// store reports "no job available" (spec.md §4.1).
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    /// How old a `PROCESSING` row's `updated_at` must be before the
    /// reaper sweep returns it to `PENDING` (SPEC_FULL.md §4.1/§9.1).
    #[serde(default = "default_stale_processing_secs")]
    pub stale_processing_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> u32 {
    2
}
fn default_busy_timeout_secs() -> u64 {
    10
}
fn default_stale_processing_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            busy_timeout_secs: default_busy_timeout_secs(),
            stale_processing_secs: default_stale_processing_secs(),
        }
    }
}

impl Config {
    /// Loads `config.json` from `path`, creating it with defaults if it
    /// doesn't exist, and resetting it to defaults if it's unparseable.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(path)?;
        match serde_json::from_str(&raw) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("config file at {} is corrupt ({e}), resetting to defaults", path.display());
                let config = Config::default();
                config.save(path)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Sets a single key by name, validating it's known and the value
    /// parses as the expected type (spec.md §6/§7: unknown key or type
    /// mismatch is a reported error, exit 1).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_retries" => self.max_retries = parse_uint(key, value)?,
            "backoff_base" => self.backoff_base = parse_uint(key, value)?,
            "busy_timeout_secs" => self.busy_timeout_secs = parse_u64(key, value)?,
            "stale_processing_secs" => self.stale_processing_secs = parse_u64(key, value)?,
            other => {
                return Err(QueueError::Input(format!(
                    "unknown config key '{other}'; available keys: {KNOWN_KEYS:?}"
                )))
            }
        }
        Ok(())
    }
}

fn parse_uint(key: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| QueueError::Input(format!("invalid value for '{key}': expected an integer, got '{value}'")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| QueueError::Input(format!("invalid value for '{key}': expected an integer, got '{value}'")))
}

/// Standard layout of the data directory (spec.md §6).
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: PathBuf) -> Self {
        DataDir { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("queue.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.root.join("workers.pid")
    }

    pub fn worker_log_dir(&self) -> PathBuf {
        self.root.join("worker-logs")
    }

    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
