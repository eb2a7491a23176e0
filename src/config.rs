//! Queue configuration
//!
//! Defaults are fixed constants; a deployment can override them from the
//! environment (`ACCESS_LEDGER_*`) or from a JSON file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default number of events committed per transaction
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default overflow log location
pub const DEFAULT_OVERFLOW_PATH: &str = "/tmp/entitlementErrors";

/// Default outage alert recipient
pub const DEFAULT_ALERT_RECIPIENT: &str = "errors@localhost";

/// Default interval between idle overflow retries
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 10;

pub const ENV_OVERFLOW_PATH: &str = "ACCESS_LEDGER_OVERFLOW_PATH";
pub const ENV_BATCH_SIZE: &str = "ACCESS_LEDGER_BATCH_SIZE";
pub const ENV_RETRY_INTERVAL_MS: &str = "ACCESS_LEDGER_RETRY_INTERVAL_MS";
pub const ENV_ALERT_RECIPIENT: &str = "ACCESS_LEDGER_ALERT_RECIPIENT";

/// Errors loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration for the queue, its worker and the overflow manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum events drained into one transaction
    pub batch_size: usize,
    /// How often the worker retries the overflow log while the queue is idle
    pub retry_interval_ms: u64,
    /// Canonical overflow log location
    pub overflow_path: PathBuf,
    /// Who receives outage alerts
    pub alert_recipient: String,
    /// Prefix for alert subjects
    pub alert_subject: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            overflow_path: PathBuf::from(DEFAULT_OVERFLOW_PATH),
            alert_recipient: DEFAULT_ALERT_RECIPIENT.to_string(),
            alert_subject: "Access Ledger".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create config with a custom overflow path
    pub fn new<P: AsRef<Path>>(overflow_path: P) -> Self {
        Self {
            overflow_path: overflow_path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `ACCESS_LEDGER_*` environment variables
    pub fn from_env() -> Self {
        Self::default().apply_vars(|key| env::var(key).ok())
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Override fields from a variable lookup. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_vars<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_OVERFLOW_PATH) {
            self.overflow_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            match raw.trim().parse() {
                Ok(size) => self.batch_size = size,
                Err(_) => warn!(var = ENV_BATCH_SIZE, value = %raw, "Ignoring invalid batch size"),
            }
        }
        if let Some(raw) = lookup(ENV_RETRY_INTERVAL_MS) {
            match raw.trim().parse() {
                Ok(ms) => self.retry_interval_ms = ms,
                Err(_) => {
                    warn!(var = ENV_RETRY_INTERVAL_MS, value = %raw, "Ignoring invalid retry interval")
                }
            }
        }
        if let Some(recipient) = lookup(ENV_ALERT_RECIPIENT) {
            self.alert_recipient = recipient;
        }
        self
    }

    pub fn with_overflow_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.overflow_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_alert_recipient(mut self, recipient: &str) -> Self {
        self.alert_recipient = recipient.to_string();
        self
    }

    /// Batch size, never below 1
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Retry interval, never below 1ms
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}
