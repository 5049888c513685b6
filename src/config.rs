//! Configuration types for backup and restore pipelines

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backup traversal mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Spool the changes feed and fetch winning revisions via `_bulk_get`.
    /// Supports resume through the batch-lifecycle log.
    #[default]
    Full,
    /// Page `_all_docs` with `include_docs=true`. Captures only winning
    /// revisions and does not support resume.
    Shallow,
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::Shallow => write!(f, "shallow"),
        }
    }
}

impl std::str::FromStr for BackupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupMode::Full),
            "shallow" => Ok(BackupMode::Shallow),
            other => Err(Error::InvalidOption(format!(
                "mode must be \"full\" or \"shallow\", got \"{other}\""
            ))),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (default: 2,
    /// i.e. three attempts in total)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Apply full jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Options for a backup run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Number of documents per batch (default: 500)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum concurrent `_bulk_get` requests (default: 5)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-attempt HTTP request timeout (default: 120 seconds)
    #[serde(default = "default_request_timeout", with = "duration_millis")]
    pub request_timeout: Duration,

    /// Path of the batch-lifecycle log file
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// Resume a previously interrupted run from the log file
    #[serde(default)]
    pub resume: bool,

    /// Backup traversal mode
    #[serde(default)]
    pub mode: BackupMode,

    /// Inline attachment bodies as base64 into each document
    #[serde(default)]
    pub attachments: bool,

    /// Retry policy for transient HTTP failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            parallelism: default_parallelism(),
            request_timeout: default_request_timeout(),
            log: None,
            resume: false,
            mode: BackupMode::Full,
            attachments: false,
            retry: RetryConfig::default(),
        }
    }
}

impl BackupOptions {
    /// Reject incompatible option combinations before any HTTP is issued.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidOption("buffer size must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::InvalidOption("parallelism must be at least 1".into()));
        }
        if self.resume && self.log.is_none() {
            return Err(Error::NoLogFileName);
        }
        if self.mode == BackupMode::Shallow {
            if self.log.is_some() {
                return Err(Error::InvalidOption(
                    "the log option is invalid in shallow mode".into(),
                ));
            }
            if self.resume {
                return Err(Error::InvalidOption(
                    "the resume option is invalid in shallow mode".into(),
                ));
            }
            if self.attachments {
                return Err(Error::InvalidOption(
                    "the attachments option is invalid in shallow mode".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Options for a restore run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Number of documents per `_bulk_docs` request (default: 500)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum concurrent `_bulk_docs` requests (default: 5)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-attempt HTTP request timeout (default: 120 seconds)
    #[serde(default = "default_request_timeout", with = "duration_millis")]
    pub request_timeout: Duration,

    /// Backup was taken with inlined attachments
    ///
    /// Inline bodies round-trip through `_bulk_docs` either way; the flag
    /// only acknowledges that the input may carry them.
    #[serde(default)]
    pub attachments: bool,

    /// Retry policy for transient HTTP failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            parallelism: default_parallelism(),
            request_timeout: default_request_timeout(),
            attachments: false,
            retry: RetryConfig::default(),
        }
    }
}

impl RestoreOptions {
    /// Reject invalid option values before any HTTP is issued.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidOption("buffer size must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::InvalidOption("parallelism must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_buffer_size() -> usize {
    500
}

fn default_parallelism() -> usize {
    5
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(120_000)
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Serialize durations as integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
