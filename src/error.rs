//! Error types for couchbackup
//!
//! This module provides the error taxonomy shared by every component:
//! - Named kinds with stable process exit codes
//! - Fatal vs. transient classification consumed by the retry loop
//! - A single conversion point for HTTP responses (`Error::http`)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for couchbackup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for couchbackup
///
/// Each variant maps to a stable exit code used by the CLI, and carries
/// enough context to diagnose the failure without re-running.
#[derive(Debug, Error)]
pub enum Error {
    /// Source database missing on backup, or target missing on restore
    #[error("database {db} does not exist")]
    DatabaseNotFound {
        /// The database name that was not found
        db: String,
    },

    /// Server rejected the credentials (HTTP 401)
    #[error("access is denied due to invalid credentials: {message}")]
    Unauthorized {
        /// Server-provided failure detail
        message: String,
    },

    /// Credentials are valid but lack permission (HTTP 403)
    #[error("access is forbidden: {message}")]
    Forbidden {
        /// Server-provided failure detail
        message: String,
    },

    /// Restore target already contains documents or tombstones
    #[error("target database {db} is not empty")]
    DatabaseNotEmpty {
        /// The non-empty target database name
        db: String,
    },

    /// Resume was requested without a log file path
    #[error("resume requires a log file to be specified")]
    NoLogFileName,

    /// Resume was requested but the log file is missing
    #[error("log file {path} does not exist")]
    LogDoesNotExist {
        /// The missing log file path
        path: PathBuf,
    },

    /// Resume log never recorded the end of the changes feed
    #[error("the log file did not record completion of the changes feed")]
    IncompleteChangesInLogFile,

    /// Malformed changes feed payload
    #[error("error spooling changes: {0}")]
    SpoolChanges(String),

    /// HTTP failure, transient or final
    ///
    /// Transient instances (429/500/503, connection failures, timeouts) are
    /// retried internally; once retries are exhausted, or for any other
    /// status, the same variant surfaces as a fatal `HTTPFatalError`.
    #[error("{status} {method} {path}")]
    Http {
        /// HTTP status code of the failing response
        status: u16,
        /// Request method, lowercase
        method: &'static str,
        /// Request path relative to the server root
        path: String,
        /// Whether the failure is eligible for automatic retry
        transient: bool,
    },

    /// The server does not support the `_bulk_get` endpoint
    #[error("database {db} does not support the _bulk_get endpoint")]
    BulkGet {
        /// The database whose server lacks `_bulk_get`
        db: String,
    },

    /// A line of the backup input could not be parsed
    #[error("error on line {line} of backup file: {message}")]
    BackupFileJson {
        /// 1-based line number of the bad line
        line: u64,
        /// Parse failure detail
        message: String,
    },

    /// Mutually incompatible or otherwise invalid options
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A `new_edits=false` bulk write reported per-document failures
    #[error("Error writing batch {batch} with new_edits:false and {items} items")]
    BatchWriteFailed {
        /// The failing batch number
        batch: u64,
        /// Number of documents in the failing batch
        items: usize,
    },

    /// Network-level failure (connection, TLS, body streaming)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error outside of backup-file parsing
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classify an HTTP response status into a transient or fatal error.
    ///
    /// This is the single conversion point for server responses: 429, 500
    /// and 503 are transient, everything else non-2xx is fatal. Callers map
    /// context-specific statuses (404 on an existence check, 401/403) to
    /// their dedicated kinds before falling back to this.
    pub fn http(status: u16, method: &'static str, path: impl Into<String>) -> Self {
        let transient = matches!(status, 429 | 500 | 503);
        Error::Http {
            status,
            method,
            path: path.into(),
            transient,
        }
    }

    /// Whether this failure is eligible for automatic retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { transient, .. } => *transient,
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Stable process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidOption(_) => 2,
            Error::DatabaseNotFound { .. } => 10,
            Error::Unauthorized { .. } => 11,
            Error::Forbidden { .. } => 12,
            Error::DatabaseNotEmpty { .. } => 13,
            Error::NoLogFileName => 20,
            Error::LogDoesNotExist { .. } => 21,
            Error::IncompleteChangesInLogFile => 22,
            Error::SpoolChanges(_) => 30,
            Error::Http { .. } => 40,
            Error::Network(_) => 40,
            Error::BulkGet { .. } => 50,
            Error::BackupFileJson { .. } => 60,
            Error::BatchWriteFailed { .. } => 1,
            Error::Io(_) => 1,
            Error::Serialization(_) => 1,
        }
    }

    /// Kind name prefixed to CLI error output, e.g. `DatabaseNotFound: ...`
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::DatabaseNotFound { .. } => "DatabaseNotFound",
            Error::Unauthorized { .. } => "Unauthorized",
            Error::Forbidden { .. } => "Forbidden",
            Error::DatabaseNotEmpty { .. } => "DatabaseNotEmpty",
            Error::NoLogFileName => "NoLogFileName",
            Error::LogDoesNotExist { .. } => "LogDoesNotExist",
            Error::IncompleteChangesInLogFile => "IncompleteChangesInLogFile",
            Error::SpoolChanges(_) => "SpoolChangesError",
            Error::Http { .. } => "HTTPFatalError",
            Error::Network(_) => "HTTPFatalError",
            Error::BulkGet { .. } => "BulkGetError",
            Error::BackupFileJson { .. } => "BackupFileJsonError",
            Error::InvalidOption(_) => "InvalidOption",
            Error::BatchWriteFailed { .. } => "Error",
            Error::Io(_) => "Error",
            Error::Serialization(_) => "Error",
        }
    }
}
