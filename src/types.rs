//! Core types for couchbackup

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a single document revision
///
/// The payload of pending batches and of `_bulk_get` requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Document id
    pub id: String,
    /// Revision, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

impl DocumentRef {
    /// Create a reference with a known revision
    pub fn new(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
        }
    }
}

/// A numbered batch of document references awaiting fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TodoBatch {
    /// Batch number, allocated monotonically from 0 in spool order
    pub number: u64,
    /// Document references in this batch
    pub refs: Vec<DocumentRef>,
}

/// A numbered batch with full document bodies attached
#[derive(Clone, Debug)]
pub struct DoneBatch {
    /// Batch number carried over from the todo batch
    pub number: u64,
    /// Fetched document bodies
    pub docs: Vec<Value>,
}

/// Database metadata returned by `GET /<db>`
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct DatabaseInfo {
    /// Number of live documents
    #[serde(default)]
    pub doc_count: u64,
    /// Number of deleted documents (tombstones)
    #[serde(default)]
    pub doc_del_count: u64,
}

/// Event emitted during a backup or restore run
///
/// Exactly one terminal event (`Finished` or `Failed`) is emitted per run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Event {
    /// A batch of changes was spooled to the log
    ChangesBatch {
        /// Batch number
        batch: u64,
        /// Number of document references in the batch
        documents: usize,
    },

    /// A fetched batch was written to the backup output
    BatchWritten {
        /// Batch number
        batch: u64,
        /// Number of documents in the batch
        documents: usize,
        /// Running total of documents written this run
        total: u64,
    },

    /// A batch of documents was written to the target database
    BatchRestored {
        /// Number of documents in the batch
        documents: usize,
        /// Running total of documents restored this run
        total: u64,
    },

    /// The run completed
    Finished {
        /// Total documents processed this run
        total: u64,
    },

    /// The run failed
    Failed {
        /// Failure description
        message: String,
    },
}

/// Totals reported by a completed backup run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    /// Documents written to the backup output this run
    pub total: u64,
    /// Batches written to the backup output this run
    pub batches: u64,
}

/// Totals reported by a completed restore run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    /// Documents written to the target database
    pub total: u64,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ref_omits_missing_rev() {
        let without_rev = DocumentRef {
            id: "doc1".into(),
            rev: None,
        };
        assert_eq!(
            serde_json::to_string(&without_rev).unwrap(),
            r#"{"id":"doc1"}"#
        );

        let with_rev = DocumentRef::new("doc1", "1-abc");
        assert_eq!(
            serde_json::to_string(&with_rev).unwrap(),
            r#"{"id":"doc1","rev":"1-abc"}"#
        );
    }

    #[test]
    fn document_ref_round_trips() {
        let original = DocumentRef::new("doc1", "3-917fa2381192822767f010b95b45325b");
        let json = serde_json::to_string(&original).unwrap();
        let back: DocumentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn database_info_tolerates_extra_fields() {
        let info: DatabaseInfo = serde_json::from_str(
            r#"{"db_name":"animaldb","doc_count":15,"doc_del_count":1,"update_seq":"23-g1A"}"#,
        )
        .unwrap();
        assert_eq!(info.doc_count, 15);
        assert_eq!(info.doc_del_count, 1);
    }

    #[test]
    fn database_info_defaults_missing_counts_to_zero() {
        let info: DatabaseInfo = serde_json::from_str(r#"{"db_name":"animaldb"}"#).unwrap();
        assert_eq!(info.doc_count, 0);
        assert_eq!(info.doc_del_count, 0);
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = Event::BatchWritten {
            batch: 2,
            documents: 500,
            total: 1500,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"batch_written""#), "json was {json}");
        assert!(json.contains(r#""total":1500"#));
    }
}
