//! # couchbackup
//!
//! Streaming backup and restore for databases speaking the CouchDB HTTP
//! API.
//!
//! ## Design Philosophy
//!
//! - **Streaming with backpressure** - Documents flow through bounded
//!   channels; nothing buffers a whole database in memory
//! - **Resumable** - A batch-lifecycle log records every unit of work so an
//!   interrupted backup continues where it stopped
//! - **Fault tolerant** - Transient server and network failures retry with
//!   exponential backoff; fatal ones abort with a classified error
//! - **Library-first** - The CLI binaries are thin wrappers; consumers
//!   subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use couchbackup::{Backup, BackupOptions, ClientOptions, CouchClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CouchClient::connect(
//!         "http://localhost:5984/animaldb",
//!         ClientOptions::default(),
//!     )
//!     .await?;
//!
//!     let backup = Backup::new(client, BackupOptions::default());
//!
//!     // Subscribe to events
//!     let mut events = backup.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let file = tokio::fs::File::create("animaldb.backup").await?;
//!     let summary = backup.run(file).await?;
//!     println!("backed up {} documents", summary.total);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Backup pipeline
pub mod backup;
/// HTTP client for the database API
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Batch-lifecycle log format, parser and resume scan
pub mod logfile;
/// Restore pipeline
pub mod restore;
/// Retry logic with exponential backoff
pub mod retry;
/// Streaming primitives (line splitting, batching)
pub mod stream;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use backup::Backup;
pub use client::{ClientOptions, CouchClient};
pub use config::{BackupMode, BackupOptions, RestoreOptions, RetryConfig};
pub use error::{Error, Result};
pub use restore::Restore;
pub use types::{BackupSummary, DocumentRef, Event, RestoreSummary};

use tokio::io::{AsyncRead, AsyncWrite};

/// Back up the database at `url` into `sink`.
///
/// Connects with the parallelism, timeout and retry policy from `options`;
/// credentials embedded in the URL trigger a session login. For IAM or a
/// prebuilt handle, use [`CouchClient::connect`] and [`Backup`] directly.
pub async fn backup<W: AsyncWrite + Unpin>(
    url: &str,
    sink: W,
    options: BackupOptions,
) -> Result<BackupSummary> {
    let client = CouchClient::connect(
        url,
        ClientOptions {
            parallelism: options.parallelism,
            request_timeout: Some(options.request_timeout),
            iam_api_key: None,
            retry: options.retry.clone(),
        },
    )
    .await?;
    Backup::new(client, options).run(sink).await
}

/// Restore the backup stream `source` into the database at `url`.
///
/// Connects with the parallelism, timeout and retry policy from `options`;
/// credentials embedded in the URL trigger a session login. For IAM or a
/// prebuilt handle, use [`CouchClient::connect`] and [`Restore`] directly.
pub async fn restore<R: AsyncRead + Send + Unpin + 'static>(
    url: &str,
    source: R,
    options: RestoreOptions,
) -> Result<RestoreSummary> {
    let client = CouchClient::connect(
        url,
        ClientOptions {
            parallelism: options.parallelism,
            request_timeout: Some(options.request_timeout),
            iam_api_key: None,
            retry: options.retry.clone(),
        },
    )
    .await?;
    Restore::new(client, options).run(source).await
}
