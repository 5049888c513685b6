//! Restore pipeline — line-split, parse, batch, parallel bulk-write
//!
//! The input stream is split into lines, each line decoded as a JSON array
//! of documents, the documents re-batched into `buffer_size` groups, and
//! the groups written with up to `parallelism` concurrent `_bulk_docs`
//! requests. Batches whose documents carry `_rev` are written with
//! `new_edits=false` so server-side revision identifiers are preserved.

use crate::client::CouchClient;
use crate::error::{Error, Result};
use crate::stream::{Batcher, LineSplitter, NumberedLine};
use crate::types::{Event, RestoreSummary};
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// Capacity of the event broadcast channel; slow subscribers lag and drop
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Bytes read from the input per chunk
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One group of documents headed for a single `_bulk_docs` request
#[derive(Debug)]
struct RestoreBatch {
    number: u64,
    docs: Vec<Value>,
}

/// A restore run: one backup stream written into one target database
///
/// Subscribe before calling [`Restore::run`] to observe progress; exactly
/// one terminal event ([`Event::Finished`] or [`Event::Failed`]) is emitted
/// per run.
#[derive(Debug)]
pub struct Restore {
    client: CouchClient,
    options: crate::config::RestoreOptions,
    event_tx: broadcast::Sender<Event>,
}

impl Restore {
    /// Create a restore over an already-connected database handle.
    pub fn new(client: CouchClient, options: crate::config::RestoreOptions) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            options,
            event_tx,
        }
    }

    /// Subscribe to the run's event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Run the restore, reading the backup stream from `source`.
    pub async fn run<R>(&self, source: R) -> Result<RestoreSummary>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        match self.run_inner(source).await {
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

    async fn run_inner<R>(&self, source: R) -> Result<RestoreSummary>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.options.validate()?;
        self.check_target_empty().await?;

        let (tx, rx) = mpsc::channel::<Result<RestoreBatch>>(self.options.parallelism.max(1) * 2);
        let buffer_size = self.options.buffer_size;
        let reader = tokio::spawn(read_batches(source, buffer_size, tx));

        let drive_result = self.drive(rx).await;

        // On failure the receiver is gone and the reader stops at its next
        // send; join it to surface panics.
        let reader_result = reader.await;

        let summary = drive_result?;
        if let Err(join_err) = reader_result {
            return Err(Error::Io(std::io::Error::other(format!(
                "backup file reader panicked: {join_err}"
            ))));
        }
        Ok(summary)
    }

    /// `GET /<db>` and refuse non-empty targets.
    ///
    /// System databases (leading `_`, e.g. `_replicator`) always carry
    /// design documents, so the emptiness check is skipped for them.
    async fn check_target_empty(&self) -> Result<()> {
        let info = self.client.get_database().await?;
        let db = self.client.db_name();
        if !db.starts_with('_') && (info.doc_count > 0 || info.doc_del_count > 0) {
            return Err(Error::DatabaseNotEmpty { db: db.to_string() });
        }
        Ok(())
    }

    async fn drive(&self, rx: mpsc::Receiver<Result<RestoreBatch>>) -> Result<RestoreSummary> {
        let mut written = ReceiverStream::new(rx)
            .map(|item| {
                let client = self.client.clone();
                async move {
                    let batch = item?;
                    write_batch(&client, batch).await
                }
            })
            .buffer_unordered(self.options.parallelism.max(1));

        let mut summary = RestoreSummary::default();
        while let Some(result) = written.next().await {
            let documents = result?;
            summary.total += documents as u64;
            self.emit(Event::BatchRestored {
                documents,
                total: summary.total,
            });
        }
        Ok(summary)
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// Reader task: split lines, decode doc arrays, cut `buffer_size` batches.
///
/// Errors are forwarded through the channel so the writer side surfaces
/// them as the run's fatal error; the task itself always completes.
async fn read_batches<R: AsyncRead + Unpin>(
    mut source: R,
    buffer_size: usize,
    tx: mpsc::Sender<Result<RestoreBatch>>,
) {
    let mut splitter = LineSplitter::new();
    let mut batcher: Batcher<Value> = Batcher::new(buffer_size);
    let mut number = 0u64;
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    macro_rules! forward {
        ($result:expr) => {
            match $result {
                Ok(value) => value,
                Err(e) => {
                    tx.send(Err(e.into())).await.ok();
                    return;
                }
            }
        };
    }

    loop {
        let n = forward!(source.read(&mut chunk).await);
        if n == 0 {
            break;
        }
        for line in forward!(splitter.push(&chunk[..n])) {
            for doc in forward!(parse_backup_line(&line)) {
                if let Some(docs) = batcher.push(doc) {
                    let batch = RestoreBatch { number, docs };
                    number += 1;
                    if tx.send(Ok(batch)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    if let Some(tail) = forward!(splitter.finish()) {
        for doc in forward!(parse_backup_line(&tail)) {
            if let Some(docs) = batcher.push(doc) {
                let batch = RestoreBatch { number, docs };
                number += 1;
                if tx.send(Ok(batch)).await.is_err() {
                    return;
                }
            }
        }
    }
    if let Some(docs) = batcher.finish() {
        tx.send(Ok(RestoreBatch { number, docs })).await.ok();
    }
}

/// Decode one line of the backup stream into its documents.
///
/// Blank lines are ignored. Anything that is not a JSON array fails with
/// the 1-based line number.
fn parse_backup_line(line: &NumberedLine) -> Result<Vec<Value>> {
    if line.text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(&line.text).map_err(|e| Error::BackupFileJson {
            line: line.number,
            message: e.to_string(),
        })?;
    match value {
        Value::Array(docs) => Ok(docs),
        _ => Err(Error::BackupFileJson {
            line: line.number,
            message: "line is not a JSON array of documents".into(),
        }),
    }
}

/// Write one batch via `_bulk_docs`, returning the number of documents.
///
/// `new_edits=false` is used when any document carries `_rev`; in that mode
/// a non-empty response array means per-document failures, which are fatal.
async fn write_batch(client: &CouchClient, batch: RestoreBatch) -> Result<usize> {
    let preserve_revs = batch.docs.iter().any(|doc| doc.get("_rev").is_some());
    let results = client.post_bulk_docs(&batch.docs, !preserve_revs).await?;
    if preserve_revs && !results.is_empty() {
        return Err(Error::BatchWriteFailed {
            batch: batch.number,
            items: batch.docs.len(),
        });
    }
    tracing::debug!(
        batch = batch.number,
        documents = batch.docs.len(),
        new_edits = !preserve_revs,
        "Restored batch"
    );
    Ok(batch.docs.len())
}
