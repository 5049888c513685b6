//! Shallow backup — pages `_all_docs` instead of spooling the changes feed
//!
//! Captures winning revisions only. No batch-lifecycle log is written and
//! the run cannot be resumed; each page becomes one output line.

use super::{WriteOutcome, write_batch_line};
use crate::client::CouchClient;
use crate::error::Result;
use crate::types::{BackupSummary, Event};
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;

/// Run a shallow backup to `sink`, one output line per `_all_docs` page.
///
/// Paging appends `U+0000` to the previous page's last id so the next page
/// starts strictly after it. Terminates on the first short page.
pub(super) async fn shallow_backup<W: AsyncWrite + Unpin>(
    client: &CouchClient,
    buffer_size: usize,
    sink: &mut W,
    event_tx: &broadcast::Sender<Event>,
) -> Result<BackupSummary> {
    let mut start_key: Option<String> = None;
    let mut summary = BackupSummary::default();

    loop {
        let docs = client.post_all_docs(buffer_size, start_key.as_deref()).await?;
        if docs.is_empty() {
            break;
        }

        let full_page = docs.len() == buffer_size;
        start_key = docs
            .last()
            .and_then(|doc| doc.get("_id"))
            .and_then(serde_json::Value::as_str)
            .map(|id| format!("{id}\u{0}"));

        match write_batch_line(sink, &docs).await? {
            WriteOutcome::DownstreamClosed => {
                tracing::warn!("Backup output closed; stopping shallow backup");
                break;
            }
            WriteOutcome::Written => {}
        }

        summary.total += docs.len() as u64;
        event_tx
            .send(Event::BatchWritten {
                batch: summary.batches,
                documents: docs.len(),
                total: summary.total,
            })
            .ok();
        summary.batches += 1;

        if !full_page {
            break;
        }
    }

    Ok(summary)
}
