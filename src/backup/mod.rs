//! Backup pipeline — spool, fetch, serialize, log
//!
//! The pipeline stages and their coupling:
//!
//! 1. The **changes spooler** ([`spool`]) streams `_changes`, partitions
//!    references into numbered batches, and appends a `:t` log record
//!    before each batch enters the channel to the fetcher.
//! 2. The **fetcher** ([`fetch`]) resolves up to `parallelism` batches
//!    concurrently via `_bulk_get`, optionally inlining attachments.
//! 3. The **serializer tail** (here) writes one JSON-array line per fetched
//!    batch to the output, appends `:d` once the line is durable, and emits
//!    a progress event.
//!
//! Lines appear in the output in fetch-completion order, not batch-number
//! order; the log's `:d` sequence is the canonical ordering record.

mod fetch;
mod shallow;
mod spool;

use crate::client::CouchClient;
use crate::config::{BackupMode, BackupOptions};
use crate::error::{Error, Result};
use crate::logfile::{self, LogWriter};
use crate::stream::escape_line_separators;
use crate::types::{BackupSummary, Event, TodoBatch};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel; slow subscribers lag and drop
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A backup run: one source database streamed to one output sink
///
/// Subscribe before calling [`Backup::run`] to observe progress; exactly
/// one terminal event ([`Event::Finished`] or [`Event::Failed`]) is emitted
/// per run.
#[derive(Debug)]
pub struct Backup {
    client: CouchClient,
    options: BackupOptions,
    event_tx: broadcast::Sender<Event>,
}

impl Backup {
    /// Create a backup over an already-connected database handle.
    pub fn new(client: CouchClient, options: BackupOptions) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            options,
            event_tx,
        }
    }

    /// Subscribe to the run's event feed.
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. A subscriber that falls behind by more than the
    /// channel capacity misses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Run the backup, streaming every batch to `sink`.
    ///
    /// Returns the totals on success. On failure the first fatal error is
    /// returned and mirrored as an [`Event::Failed`].
    pub async fn run<W: AsyncWrite + Unpin>(&self, sink: W) -> Result<BackupSummary> {
        match self.run_inner(sink).await {
            Ok(summary) => {
                self.emit(Event::Finished {
                    total: summary.total,
                });
                Ok(summary)
            }
            Err(e) => {
                self.emit(Event::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_inner<W: AsyncWrite + Unpin>(&self, mut sink: W) -> Result<BackupSummary> {
        self.options.validate()?;
        if self.options.attachments {
            tracing::warn!(
                "Attachments support is a preview feature for Apache CouchDB sources only"
            );
        }

        self.client.head_database().await?;

        if self.options.mode == BackupMode::Shallow {
            let summary = shallow::shallow_backup(
                &self.client,
                self.options.buffer_size,
                &mut sink,
                &self.event_tx,
            )
            .await?;
            shutdown_sink(&mut sink).await?;
            return Ok(summary);
        }

        // Probe for _bulk_get support before spooling anything
        self.client.post_bulk_get(&[], false).await?;

        // Resume plumbing: pre-computed unfinished batches feed the pipeline
        // head; the spooler only runs on a fresh backup. The scan must
        // precede opening the writer, which would create a missing file.
        let log_path = self.log_path();
        let (pending, spool_needed, next_batch) = if self.options.resume {
            let state = logfile::scan(&log_path).await?;
            if !state.changes_complete {
                return Err(Error::IncompleteChangesInLogFile);
            }
            tracing::info!(pending = state.pending.len(), "Resuming backup from log");
            (state.pending, false, state.next_batch)
        } else {
            (Vec::new(), true, 0)
        };

        let log = Arc::new(LogWriter::open(&log_path).await?);
        tracing::debug!(log = %log.path().display(), "Backup log open");

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<TodoBatch>(self.options.parallelism.max(1) * 2);

        let spooler = {
            let client = self.client.clone();
            let log = Arc::clone(&log);
            let event_tx = self.event_tx.clone();
            let cancel = cancel.clone();
            let buffer_size = self.options.buffer_size;
            tokio::spawn(async move {
                for batch in pending {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        sent = tx.send(batch) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                if spool_needed {
                    spool::spool_changes(
                        &client,
                        &log,
                        buffer_size,
                        next_batch,
                        &tx,
                        &event_tx,
                        &cancel,
                    )
                    .await?;
                }
                Ok::<(), Error>(())
            })
        };

        let drive_result = self.drive(rx, &log, &mut sink).await;

        // First fatal wins: stop the spooler, then observe its outcome.
        cancel.cancel();
        let spool_result = spooler.await;

        let summary = drive_result?;
        match spool_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => {
                return Err(Error::Io(std::io::Error::other(format!(
                    "changes spooler panicked: {join_err}"
                ))));
            }
        }

        shutdown_sink(&mut sink).await?;
        Ok(summary)
    }

    /// Fan todo batches out to the fetcher and serialize results as they
    /// complete.
    async fn drive<W: AsyncWrite + Unpin>(
        &self,
        rx: mpsc::Receiver<TodoBatch>,
        log: &LogWriter,
        sink: &mut W,
    ) -> Result<BackupSummary> {
        let attachments = self.options.attachments;
        let mut fetched = ReceiverStream::new(rx)
            .map(|batch| {
                let client = self.client.clone();
                async move { fetch::fetch_batch(&client, batch, attachments).await }
            })
            .buffer_unordered(self.options.parallelism.max(1));

        let mut summary = BackupSummary::default();
        while let Some(done) = fetched.next().await {
            let done = done?;
            match write_batch_line(sink, &done.docs).await? {
                WriteOutcome::DownstreamClosed => {
                    tracing::warn!("Backup output closed; stopping backup");
                    break;
                }
                WriteOutcome::Written => {}
            }
            log.done(done.number).await?;
            summary.total += done.docs.len() as u64;
            summary.batches += 1;
            self.emit(Event::BatchWritten {
                batch: done.number,
                documents: done.docs.len(),
                total: summary.total,
            });
        }
        Ok(summary)
    }

    fn log_path(&self) -> PathBuf {
        match &self.options.log {
            Some(path) => path.clone(),
            // The pipeline always records batch lifecycles; without a
            // user-supplied path the log lives in the temp directory.
            None => std::env::temp_dir().join(format!(
                "couchbackup-{}-{:08x}.log",
                std::process::id(),
                rand::random::<u32>()
            )),
        }
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// Close the sink, tolerating a pipe that closed mid-run.
async fn shutdown_sink<W: AsyncWrite + Unpin>(sink: &mut W) -> Result<()> {
    match sink.shutdown().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Outcome of writing one batch line to the output sink
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The line is durable in the sink
    Written,
    /// The sink reported a closed pipe; shut down cleanly
    DownstreamClosed,
}

/// Serialize a batch's documents as one newline-terminated JSON array line.
///
/// U+2028/U+2029 are escaped so the emitted line survives consumers that
/// treat them as line terminators. The sink is flushed before returning so
/// `:d` records never precede their output line.
pub(crate) async fn write_batch_line<W: AsyncWrite + Unpin>(
    sink: &mut W,
    docs: &[Value],
) -> Result<WriteOutcome> {
    let serialized = serde_json::to_string(docs)?;
    let line = escape_line_separators(&serialized);

    let write = async {
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        sink.flush().await
    };
    match write.await {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(WriteOutcome::DownstreamClosed),
        Err(e) => Err(Error::Io(e)),
    }
}
