//! Batch-lifecycle log: append-only writer, line parsers, resume scan
//!
//! The log records every batch's lifecycle so an interrupted backup can
//! skip completed work:
//!
//! ```text
//! :t batch0 [{"id":"doc1","rev":"1-abc"}]
//! :d batch0
//! :changes_complete 23-g1AAAA
//! ```
//!
//! A `:t` line is appended (and flushed) before its batch enters the
//! fetcher; `:d` is appended only after the batch's output line is durable.
//! All appends go through one serialized writer so `:t` always precedes the
//! matching `:d` byte-for-byte.

use crate::error::{Error, Result};
use crate::types::{DocumentRef, TodoBatch};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// A fully parsed log line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    /// `:t batchN [refs]` — a pending batch with its document references
    Todo {
        /// Batch number
        batch: u64,
        /// Document references awaiting fetch
        refs: Vec<DocumentRef>,
    },
    /// `:d batchN` — the batch's output line is durable
    Done {
        /// Batch number
        batch: u64,
    },
    /// `:changes_complete` — the changes feed was fully spooled
    ChangesComplete,
    /// Corrupt or unrecognized line; skipped by every reader
    Ignored,
}

/// A parsed log line without document references
///
/// Used to compute pending work without loading batch content into memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaRecord {
    /// `:t batchN ...`
    Todo {
        /// Batch number
        batch: u64,
    },
    /// `:d batchN`
    Done {
        /// Batch number
        batch: u64,
    },
    /// `:changes_complete`
    ChangesComplete,
    /// Corrupt or unrecognized line
    Ignored,
}

/// Parse a log line into a full record, including `:t` document refs.
///
/// Corrupt lines (bad batch number, unparseable JSON) become
/// [`LogRecord::Ignored`] rather than errors: a torn final line from an
/// interrupted run must not poison the resume scan.
pub fn parse_line(line: &str) -> LogRecord {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(":changes_complete")
        && (rest.is_empty() || rest.starts_with(' '))
    {
        return LogRecord::ChangesComplete;
    }
    if let Some(rest) = line.strip_prefix(":t ") {
        let Some((batch, payload)) = split_batch_number(rest) else {
            return LogRecord::Ignored;
        };
        let Some(payload) = payload else {
            return LogRecord::Ignored;
        };
        match serde_json::from_str::<Vec<DocumentRef>>(payload) {
            Ok(refs) => return LogRecord::Todo { batch, refs },
            Err(_) => return LogRecord::Ignored,
        }
    }
    if let Some(rest) = line.strip_prefix(":d ") {
        if let Some((batch, None)) = split_batch_number(rest) {
            return LogRecord::Done { batch };
        }
        return LogRecord::Ignored;
    }
    LogRecord::Ignored
}

/// Parse a log line without materializing `:t` document refs.
pub fn parse_line_meta(line: &str) -> MetaRecord {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(":changes_complete")
        && (rest.is_empty() || rest.starts_with(' '))
    {
        return MetaRecord::ChangesComplete;
    }
    if let Some(rest) = line.strip_prefix(":t ") {
        if let Some((batch, Some(_))) = split_batch_number(rest) {
            return MetaRecord::Todo { batch };
        }
        return MetaRecord::Ignored;
    }
    if let Some(rest) = line.strip_prefix(":d ") {
        if let Some((batch, None)) = split_batch_number(rest) {
            return MetaRecord::Done { batch };
        }
        return MetaRecord::Ignored;
    }
    MetaRecord::Ignored
}

/// Split `batch<uint>[ <rest>]`, returning the number and optional payload.
fn split_batch_number(s: &str) -> Option<(u64, Option<&str>)> {
    let digits_and_rest = s.strip_prefix("batch")?;
    match digits_and_rest.split_once(' ') {
        Some((digits, rest)) => {
            let batch = digits.parse().ok()?;
            Some((batch, Some(rest)))
        }
        None => {
            let batch = digits_and_rest.parse().ok()?;
            Some((batch, None))
        }
    }
}

/// Serialized append-only writer for the batch-lifecycle log
///
/// One record per call, written as a single `write_all` of a full line and
/// flushed before returning, so a record the caller has awaited is durable.
#[derive(Debug)]
pub struct LogWriter {
    file: Mutex<File>,
    path: PathBuf,
}

impl LogWriter {
    /// Open the log at `path` for appending, creating it if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Path this writer appends to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `:t batchN [refs]`.
    pub async fn todo(&self, batch: u64, refs: &[DocumentRef]) -> Result<()> {
        let line = format!(":t batch{batch} {}\n", serde_json::to_string(refs)?);
        self.append(line.as_bytes()).await
    }

    /// Append `:d batchN`.
    pub async fn done(&self, batch: u64) -> Result<()> {
        let line = format!(":d batch{batch}\n");
        self.append(line.as_bytes()).await
    }

    /// Append `:changes_complete`, recording the feed's final sequence token.
    pub async fn changes_complete(&self, last_seq: Option<&str>) -> Result<()> {
        let line = match last_seq {
            Some(seq) => format!(":changes_complete {seq}\n"),
            None => ":changes_complete\n".to_string(),
        };
        self.append(line.as_bytes()).await
    }

    async fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Result of scanning an existing log for resumable work
#[derive(Clone, Debug, Default)]
pub struct ResumeState {
    /// Batches with a `:t` record but no `:d`, in log order
    pub pending: Vec<TodoBatch>,
    /// Whether the log recorded `:changes_complete`
    pub changes_complete: bool,
    /// One past the highest batch number seen in any `:t` record
    pub next_batch: u64,
}

/// Scan a log file and compute the unfinished batches.
///
/// Two passes, per the write-ahead-log replay shape: a metadata-only pass
/// computes the pending set and completion flag, then document refs are
/// dereferenced only for the batches that actually need replay.
pub async fn scan(path: impl AsRef<Path>) -> Result<ResumeState> {
    let path = path.as_ref();
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(Error::LogDoesNotExist {
            path: path.to_path_buf(),
        });
    }

    // Pass 1: metadata only
    let mut todo_order = Vec::new();
    let mut todo_seen = HashSet::new();
    let mut done = HashSet::new();
    let mut changes_complete = false;
    let mut next_batch = 0u64;

    let mut lines = BufReader::new(File::open(path).await?).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line_meta(&line) {
            MetaRecord::Todo { batch } => {
                if todo_seen.insert(batch) {
                    todo_order.push(batch);
                }
                next_batch = next_batch.max(batch + 1);
            }
            MetaRecord::Done { batch } => {
                done.insert(batch);
            }
            MetaRecord::ChangesComplete => changes_complete = true,
            MetaRecord::Ignored => {}
        }
    }

    let pending_set: HashSet<u64> = todo_seen.difference(&done).copied().collect();
    tracing::debug!(
        todo = todo_order.len(),
        done = done.len(),
        pending = pending_set.len(),
        changes_complete,
        "Scanned backup log"
    );

    if pending_set.is_empty() {
        return Ok(ResumeState {
            pending: Vec::new(),
            changes_complete,
            next_batch,
        });
    }

    // Pass 2: dereference refs for pending batches only
    let mut pending = Vec::with_capacity(pending_set.len());
    let mut collected = HashSet::new();
    let mut lines = BufReader::new(File::open(path).await?).lines();
    while let Some(line) = lines.next_line().await? {
        if let LogRecord::Todo { batch, refs } = parse_line(&line)
            && pending_set.contains(&batch)
            && collected.insert(batch)
        {
            pending.push(TodoBatch { number: batch, refs });
        }
    }

    Ok(ResumeState {
        pending,
        changes_complete,
        next_batch,
    })
}
