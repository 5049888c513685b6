//! Batch fetcher — resolves todo batches into full document bodies
//!
//! Runs under the pipeline's `buffer_unordered(parallelism)` fan-out; each
//! invocation issues one `_bulk_get` and, in attachments mode, inlines every
//! attachment body as base64 before the batch moves to the serializer.

use crate::client::CouchClient;
use crate::error::Result;
use crate::types::{DoneBatch, TodoBatch};
use base64::{Engine as _, engine::general_purpose};
use serde_json::Value;

/// Fetch a todo batch's document bodies, producing a done-in-memory batch.
///
/// Rows the server reports as errors (deleted-and-purged, permissions) are
/// filtered out; only `ok` bodies are backed up.
pub(super) async fn fetch_batch(
    client: &CouchClient,
    batch: TodoBatch,
    attachments: bool,
) -> Result<DoneBatch> {
    let mut docs = client.post_bulk_get(&batch.refs, attachments).await?;
    if attachments {
        inline_attachments(client, &mut docs).await?;
    }
    tracing::debug!(
        batch = batch.number,
        requested = batch.refs.len(),
        fetched = docs.len(),
        "Fetched batch"
    );
    Ok(DoneBatch {
        number: batch.number,
        docs,
    })
}

/// Replace every attachment stub with its base64-encoded body.
///
/// Attachments within a batch are fetched sequentially; concurrency across
/// batches is already bounded by the pipeline's parallelism.
async fn inline_attachments(client: &CouchClient, docs: &mut [Value]) -> Result<()> {
    for doc in docs.iter_mut() {
        let Some(doc_id) = doc.get("_id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let Some(attachments) = doc.get_mut("_attachments").and_then(Value::as_object_mut) else {
            continue;
        };
        for (name, meta) in attachments.iter_mut() {
            let bytes = client.get_attachment(&doc_id, name).await?;
            let Some(meta) = meta.as_object_mut() else {
                continue;
            };
            meta.insert(
                "data".to_string(),
                Value::String(general_purpose::STANDARD.encode(&bytes)),
            );
            meta.remove("stub");
            meta.remove("length");
            meta.remove("revpos");
        }
    }
    Ok(())
}
