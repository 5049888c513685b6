//! Changes spooler — streams the `_changes` feed into numbered todo batches
//!
//! Single-streamed: one `_changes` response is read line-by-line, document
//! references accumulate into batches of `buffer_size`, and each batch's
//! `:t` record is durable in the log before the batch is pushed downstream.

use crate::client::CouchClient;
use crate::error::{Error, Result};
use crate::logfile::LogWriter;
use crate::stream::{Batcher, LineSplitter};
use crate::types::{DocumentRef, Event, TodoBatch};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// One row of the changes feed
#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    changes: Vec<ChangeRev>,
}

#[derive(Debug, Deserialize)]
struct ChangeRev {
    rev: String,
}

/// Spool the entire changes feed into the log and the fetch channel.
///
/// Batch numbers are allocated monotonically from `start_batch`. Returns
/// once `:changes_complete` is durable, or early (with `Ok`) when the
/// pipeline is cancelled or the receiver is gone.
pub(super) async fn spool_changes(
    client: &CouchClient,
    log: &LogWriter,
    buffer_size: usize,
    start_batch: u64,
    tx: &mpsc::Sender<TodoBatch>,
    event_tx: &broadcast::Sender<Event>,
    cancel: &CancellationToken,
) -> Result<()> {
    let resp = client.post_changes("0", buffer_size).await?;
    let mut body = Box::pin(resp.bytes_stream());

    let mut splitter = LineSplitter::new();
    let mut batcher: Batcher<DocumentRef> = Batcher::new(buffer_size);
    let mut next_batch = start_batch;
    let mut last_seq: Option<String> = None;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        for line in splitter.push(&chunk?)? {
            for doc_ref in consume_line(&line.text, &mut last_seq)? {
                if let Some(refs) = batcher.push(doc_ref) {
                    if !dispatch(log, tx, event_tx, cancel, next_batch, refs).await? {
                        return Ok(());
                    }
                    next_batch += 1;
                }
            }
        }
    }
    if let Some(tail) = splitter.finish()? {
        for doc_ref in consume_line(&tail.text, &mut last_seq)? {
            if let Some(refs) = batcher.push(doc_ref) {
                if !dispatch(log, tx, event_tx, cancel, next_batch, refs).await? {
                    return Ok(());
                }
                next_batch += 1;
            }
        }
    }

    if let Some(refs) = batcher.finish()
        && !dispatch(log, tx, event_tx, cancel, next_batch, refs).await?
    {
        return Ok(());
    }

    let Some(last_seq) = last_seq else {
        return Err(Error::SpoolChanges(
            "the changes response did not include last_seq".into(),
        ));
    };
    log.changes_complete(Some(&last_seq)).await?;
    tracing::debug!(last_seq = %last_seq, "Changes feed fully spooled");
    Ok(())
}

/// Append `:t`, emit the changes event, and push the batch downstream.
///
/// Returns `Ok(false)` when the pipeline has shut down.
async fn dispatch(
    log: &LogWriter,
    tx: &mpsc::Sender<TodoBatch>,
    event_tx: &broadcast::Sender<Event>,
    cancel: &CancellationToken,
    number: u64,
    refs: Vec<DocumentRef>,
) -> Result<bool> {
    log.todo(number, &refs).await?;
    event_tx
        .send(Event::ChangesBatch {
            batch: number,
            documents: refs.len(),
        })
        .ok();
    let batch = TodoBatch { number, refs };
    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        sent = tx.send(batch) => Ok(sent.is_ok()),
    }
}

/// Interpret one line of the changes response, yielding its document refs.
///
/// The feed arrives as a JSON object printed one result row per line:
/// a `{"results":[` header, comma-terminated row objects, a `],` closer
/// and a trailing `"last_seq":...` fragment. Compact single-line responses
/// are handled as a whole object.
fn consume_line(line: &str, last_seq: &mut Option<String>) -> Result<Vec<DocumentRef>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let body = trimmed.strip_suffix(',').unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return consume_value(value, last_seq);
    }

    // Multi-line framing fragments
    if body == r#"{"results":["# || body == "]" {
        return Ok(Vec::new());
    }
    if body.starts_with(r#""last_seq""#) {
        let wrapped = format!("{{{body}");
        let value: Value = serde_json::from_str(&wrapped).map_err(|e| {
            Error::SpoolChanges(format!("unparseable last_seq line in changes response: {e}"))
        })?;
        return consume_value(value, last_seq);
    }
    Err(Error::SpoolChanges(format!(
        "unexpected line in changes response: {}",
        &trimmed[..trimmed.len().min(80)]
    )))
}

fn consume_value(value: Value, last_seq: &mut Option<String>) -> Result<Vec<DocumentRef>> {
    let Some(object) = value.as_object() else {
        return Err(Error::SpoolChanges(
            "changes response row is not an object".into(),
        ));
    };

    if let Some(seq) = object.get("last_seq") {
        *last_seq = Some(seq_to_string(seq));
    }

    // A complete response object carries all rows at once
    if let Some(results) = object.get("results") {
        let rows = results.as_array().ok_or_else(|| {
            Error::SpoolChanges("changes response results is not an array".into())
        })?;
        return rows.iter().map(|row| row_to_ref(row.clone())).collect();
    }

    if object.contains_key("id") {
        return Ok(vec![row_to_ref(value)?]);
    }

    if let Some(error) = object.get("error") {
        return Err(Error::SpoolChanges(format!(
            "changes feed reported an error: {error}"
        )));
    }

    // Fragments such as a bare {"last_seq": ...} object
    Ok(Vec::new())
}

fn row_to_ref(row: Value) -> Result<DocumentRef> {
    let row: ChangeRow = serde_json::from_value(row)
        .map_err(|e| Error::SpoolChanges(format!("malformed changes row: {e}")))?;
    let rev = row
        .changes
        .first()
        .map(|c| c.rev.clone())
        .ok_or_else(|| Error::SpoolChanges(format!("changes row for {} has no revs", row.id)))?;
    // Deleted documents spool too; their tombstones restore
    Ok(DocumentRef {
        id: row.id,
        rev: Some(rev),
    })
}

/// Sequence tokens are strings on modern servers, integers on CouchDB 1.x.
fn seq_to_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
