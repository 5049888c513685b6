//! End-to-end backup and restore scenarios against a mock server.
//!
//! Covers the full pipeline: existence checks, changes spooling, parallel
//! fetch, log lifecycle, resume, shallow paging, bulk writes and the retry
//! policy, all through the public API.

use couchbackup::{
    Backup, BackupMode, BackupOptions, ClientOptions, CouchClient, Error, Event, Restore,
    RestoreOptions, RetryConfig, logfile,
};
use serde_json::{Value, json};
use std::io::Cursor;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ANIMALS: [&str; 15] = [
    "aardvark",
    "badger",
    "elephant",
    "flamingo",
    "giraffe",
    "kookaburra",
    "lemur",
    "llama",
    "mongoose",
    "narwhal",
    "otter",
    "panda",
    "snipe",
    "wallaby",
    "zebra",
];

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    }
}

async fn connect(server: &MockServer, db: &str) -> CouchClient {
    CouchClient::connect(
        &format!("{}/{db}", server.uri()),
        ClientOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    )
    .await
    .expect("connect should succeed")
}

fn animal_docs(n: usize) -> Vec<Value> {
    ANIMALS[..n]
        .iter()
        .enumerate()
        .map(|(i, name)| json!({"_id": name, "_rev": format!("1-{i:03}"), "class": "mammal"}))
        .collect()
}

fn changes_body(docs: &[Value]) -> Value {
    let results: Vec<Value> = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            json!({
                "seq": format!("{}-g1A", i + 1),
                "id": doc["_id"],
                "changes": [{"rev": doc["_rev"]}]
            })
        })
        .collect();
    json!({
        "results": results,
        "last_seq": format!("{}-g1A", docs.len()),
        "pending": 0
    })
}

fn bulk_get_body(docs: &[Value]) -> Value {
    let results: Vec<Value> = docs
        .iter()
        .map(|doc| json!({"id": doc["_id"], "docs": [{"ok": doc}]}))
        .collect();
    json!({ "results": results })
}

/// HEAD, `_bulk_get` probe, changes feed and a catch-all `_bulk_get`.
async fn mount_backup_mocks(server: &MockServer, docs: &[Value]) {
    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .and(body_json(json!({"docs": []})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(changes_body(docs)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bulk_get_body(docs)))
        .mount(server)
        .await;
}

fn output_lines(sink: &[u8]) -> Vec<Vec<Value>> {
    String::from_utf8(sink.to_vec())
        .expect("backup output is UTF-8")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("each backup line is a JSON array"))
        .collect()
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Scenario: animal DB, full mode, no resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_backup_of_fifteen_documents_in_one_batch() {
    let server = MockServer::start().await;
    let docs = animal_docs(15);
    mount_backup_mocks(&server, &docs).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("backup.log");

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            parallelism: 1,
            log: Some(log_path.clone()),
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let mut events = backup.subscribe();

    let mut sink = Vec::new();
    let summary = backup.run(&mut sink).await.expect("backup should succeed");
    assert_eq!(summary.total, 15);
    assert_eq!(summary.batches, 1);

    // One output line with all fifteen bodies
    let lines = output_lines(&sink);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].len(), 15);

    // Log lifecycle: todo, done, changes_complete
    let log_text = std::fs::read_to_string(&log_path).expect("log exists");
    assert!(log_text.contains(":t batch0 "), "log was: {log_text}");
    assert!(log_text.contains(":d batch0"), "log was: {log_text}");
    assert!(log_text.contains(":changes_complete"), "log was: {log_text}");
    let t_pos = log_text.find(":t batch0").expect(":t present");
    let d_pos = log_text.find(":d batch0").expect(":d present");
    assert!(t_pos < d_pos, ":t must precede :d");

    // Nothing left pending on a rescan
    let state = logfile::scan(&log_path).await.expect("scan");
    assert!(state.pending.is_empty());
    assert!(state.changes_complete);

    // Event feed ends with exactly one terminal event
    let events = drain_events(&mut events);
    assert!(
        matches!(events.first(), Some(Event::ChangesBatch { batch: 0, documents: 15 })),
        "first event should be the spooled batch, got {events:?}"
    );
    assert!(
        matches!(events.last(), Some(Event::Finished { total: 15 })),
        "last event should be Finished, got {events:?}"
    );
    let terminals = events
        .iter()
        .filter(|e| matches!(e, Event::Finished { .. } | Event::Failed { .. }))
        .count();
    assert_eq!(terminals, 1);
}

// ---------------------------------------------------------------------------
// Boundary: empty database
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_database_backs_up_zero_lines() {
    let server = MockServer::start().await;
    mount_backup_mocks(&server, &[]).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("backup.log");

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            log: Some(log_path.clone()),
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let mut events = backup.subscribe();

    let mut sink = Vec::new();
    let summary = backup.run(&mut sink).await.expect("backup should succeed");
    assert_eq!(summary.total, 0);
    assert!(sink.is_empty(), "no output lines for an empty database");

    let log_text = std::fs::read_to_string(&log_path).expect("log exists");
    assert!(log_text.contains(":changes_complete"));
    assert!(!log_text.contains(":t batch"));

    let events = drain_events(&mut events);
    assert!(matches!(events.last(), Some(Event::Finished { total: 0 })));
}

// ---------------------------------------------------------------------------
// Boundary: buffer_size=1 gives one line per document
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffer_size_one_writes_one_line_per_document() {
    let server = MockServer::start().await;
    let docs = animal_docs(3);

    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .and(body_json(json!({"docs": []})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(changes_body(&docs)))
        .mount(&server)
        .await;
    // One fetch per single-ref batch
    for doc in &docs {
        Mock::given(method("POST"))
            .and(path("/animaldb/_bulk_get"))
            .and(body_json(json!({"docs": [{"id": doc["_id"], "rev": doc["_rev"]}]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(bulk_get_body(std::slice::from_ref(doc))),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            buffer_size: 1,
            parallelism: 1,
            retry: fast_retry(),
            ..Default::default()
        },
    );

    let mut sink = Vec::new();
    let summary = backup.run(&mut sink).await.expect("backup should succeed");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.batches, 3);

    let lines = output_lines(&sink);
    assert_eq!(lines.len(), 3);
    for line in &lines {
        assert_eq!(line.len(), 1, "each line holds a one-element array");
    }
}

// ---------------------------------------------------------------------------
// Failure classification before any data flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_source_database_fails_with_code_10() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = backup.run(Vec::<u8>::new()).await.expect_err("backup must fail");
    assert!(matches!(err, Error::DatabaseNotFound { .. }));
    assert_eq!(err.exit_code(), 10);
}

#[tokio::test]
async fn server_without_bulk_get_fails_with_code_50() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = backup.run(Vec::<u8>::new()).await.expect_err("backup must fail");
    assert!(matches!(err, Error::BulkGet { .. }));
    assert_eq!(err.exit_code(), 50);
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_refetches_only_unfinished_batches() {
    let server = MockServer::start().await;
    let docs = animal_docs(4);

    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("backup.log");

    // A prior run spooled two batches, finished batch 0, then died
    let first: Vec<Value> = docs[..2]
        .iter()
        .map(|d| json!({"id": d["_id"], "rev": d["_rev"]}))
        .collect();
    let second: Vec<Value> = docs[2..]
        .iter()
        .map(|d| json!({"id": d["_id"], "rev": d["_rev"]}))
        .collect();
    std::fs::write(
        &log_path,
        format!(
            ":t batch0 {}\n:t batch1 {}\n:d batch0\n:changes_complete 4-g1A\n",
            serde_json::to_string(&first).expect("refs"),
            serde_json::to_string(&second).expect("refs"),
        ),
    )
    .expect("seed log");

    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .and(body_json(json!({"docs": []})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&server)
        .await;
    // The changes feed must not be spooled again
    Mock::given(method("POST"))
        .and(path("/animaldb/_changes"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .and(body_json(json!({"docs": second})))
        .respond_with(ResponseTemplate::new(200).set_body_json(bulk_get_body(&docs[2..])))
        .expect(1)
        .mount(&server)
        .await;

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            log: Some(log_path.clone()),
            resume: true,
            retry: fast_retry(),
            ..Default::default()
        },
    );

    let mut sink = Vec::new();
    let summary = backup.run(&mut sink).await.expect("resume should succeed");
    assert_eq!(summary.total, 2, "only batch 1 is re-fetched");

    let lines = output_lines(&sink);
    assert_eq!(lines.len(), 1);

    let log_text = std::fs::read_to_string(&log_path).expect("log exists");
    assert!(log_text.contains(":d batch1"), "log was: {log_text}");
}

#[tokio::test]
async fn resume_with_incomplete_changes_fails_with_code_22() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("backup.log");
    // Log ends with a torn :d line and never recorded changes_complete
    std::fs::write(
        &log_path,
        ":t batch0 [{\"id\":\"aardvark\",\"rev\":\"1-000\"}]\n:d batc",
    )
    .expect("seed log");

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            log: Some(log_path),
            resume: true,
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = backup.run(Vec::<u8>::new()).await.expect_err("resume must fail");
    assert!(matches!(err, Error::IncompleteChangesInLogFile));
    assert_eq!(err.exit_code(), 22);
}

#[tokio::test]
async fn resume_with_missing_log_fails_with_code_21() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            log: Some(dir.path().join("never-written.log")),
            resume: true,
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = backup.run(Vec::<u8>::new()).await.expect_err("resume must fail");
    assert!(matches!(err, Error::LogDoesNotExist { .. }));
    assert_eq!(err.exit_code(), 21);
}

// ---------------------------------------------------------------------------
// Shallow mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shallow_backup_pages_all_docs_until_a_short_page() {
    let server = MockServer::start().await;
    let docs = animal_docs(5);

    Mock::given(method("HEAD"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // Page 1: full page of 2
    Mock::given(method("POST"))
        .and(path("/animaldb/_all_docs"))
        .and(body_json(json!({"limit": 2, "include_docs": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{"doc": docs[0]}, {"doc": docs[1]}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    // Page 2: starts after "badger\0", full page of 2
    Mock::given(method("POST"))
        .and(path("/animaldb/_all_docs"))
        .and(body_json(json!({
            "limit": 2,
            "include_docs": true,
            "start_key": "badger\u{0}"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{"doc": docs[2]}, {"doc": docs[3]}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    // Page 3: short page terminates the run
    Mock::given(method("POST"))
        .and(path("/animaldb/_all_docs"))
        .and(body_json(json!({
            "limit": 2,
            "include_docs": true,
            "start_key": "flamingo\u{0}"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{"doc": docs[4]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backup = Backup::new(
        connect(&server, "animaldb").await,
        BackupOptions {
            mode: BackupMode::Shallow,
            buffer_size: 2,
            retry: fast_retry(),
            ..Default::default()
        },
    );

    let mut sink = Vec::new();
    let summary = backup.run(&mut sink).await.expect("shallow should succeed");
    assert_eq!(summary.total, 5);
    assert_eq!(summary.batches, 3);

    let lines = output_lines(&sink);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].len(), 2);
    assert_eq!(lines[2].len(), 1);
}

// ---------------------------------------------------------------------------
// Restore: happy path and retry policy
// ---------------------------------------------------------------------------

fn restore_input(docs: &[Value]) -> Cursor<Vec<u8>> {
    let line = serde_json::to_string(docs).expect("serialize docs");
    Cursor::new(format!("{line}\n").into_bytes())
}

async fn mount_empty_target(server: &MockServer, db: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{db}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": db,
            "doc_count": 0,
            "doc_del_count": 0
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn restore_retries_transient_bulk_docs_failures() {
    let server = MockServer::start().await;
    let docs = animal_docs(15);
    mount_empty_target(&server, "animaldb").await;

    // 429, then 500, then success on the third attempt
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .and(body_partial_json(json!({"new_edits": false})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let mut events = restore.subscribe();

    let summary = restore
        .run(restore_input(&docs))
        .await
        .expect("restore should succeed on the third attempt");
    assert_eq!(summary.total, 15);

    let events = drain_events(&mut events);
    assert!(matches!(events.last(), Some(Event::Finished { total: 15 })));
}

#[tokio::test]
async fn restore_retry_exhaustion_is_http_fatal_with_code_40() {
    let server = MockServer::start().await;
    let docs = animal_docs(15);
    mount_empty_target(&server, "animaldb").await;

    // 429, 500, 503: three attempts, all transient, then fatal
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = restore
        .run(restore_input(&docs))
        .await
        .expect_err("restore must fail");
    assert_eq!(err.kind_name(), "HTTPFatalError");
    assert_eq!(err.exit_code(), 40);
    let msg = err.to_string();
    assert!(msg.contains("503"), "message was {msg}");
    assert!(msg.contains("/animaldb/_bulk_docs"), "message was {msg}");
}

// ---------------------------------------------------------------------------
// Restore: new_edits inference
// ---------------------------------------------------------------------------

#[tokio::test]
async fn docs_without_revs_restore_with_new_edits_true() {
    let server = MockServer::start().await;
    let docs: Vec<Value> = (0..11).map(|i| json!({"_id": format!("doc{i}")})).collect();
    mount_empty_target(&server, "animaldb").await;

    let created: Vec<Value> = (0..11)
        .map(|i| json!({"ok": true, "id": format!("doc{i}"), "rev": "1-abc"}))
        .collect();
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .and(body_partial_json(json!({"new_edits": true})))
        .respond_with(ResponseTemplate::new(201).set_body_json(Value::Array(created)))
        .expect(1)
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let summary = restore
        .run(restore_input(&docs))
        .await
        .expect("restore should succeed");
    assert_eq!(summary.total, 11);
}

#[tokio::test]
async fn new_edits_false_write_failures_are_fatal() {
    let server = MockServer::start().await;
    let docs = animal_docs(2);
    mount_empty_target(&server, "animaldb").await;

    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            {"id": "aardvark", "error": "conflict", "reason": "Document update conflict."}
        ])))
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = restore
        .run(restore_input(&docs))
        .await
        .expect_err("restore must fail");
    assert_eq!(
        err.to_string(),
        "Error writing batch 0 with new_edits:false and 2 items"
    );
}

// ---------------------------------------------------------------------------
// Restore: target validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_empty_target_fails_with_code_13_before_any_write() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": "animaldb",
            "doc_count": 10,
            "doc_del_count": 0
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = restore
        .run(restore_input(&animal_docs(2)))
        .await
        .expect_err("restore must fail");
    assert!(matches!(err, Error::DatabaseNotEmpty { .. }));
    assert_eq!(err.exit_code(), 13);
}

#[tokio::test]
async fn tombstones_also_count_as_non_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": "animaldb",
            "doc_count": 0,
            "doc_del_count": 3
        })))
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = restore
        .run(restore_input(&animal_docs(1)))
        .await
        .expect_err("restore must fail");
    assert!(matches!(err, Error::DatabaseNotEmpty { .. }));
}

#[tokio::test]
async fn system_databases_skip_the_emptiness_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_replicator"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": "_replicator",
            "doc_count": 10,
            "doc_del_count": 0
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_replicator/_bulk_docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "_replicator").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let summary = restore
        .run(restore_input(&animal_docs(1)))
        .await
        .expect("system databases restore despite existing docs");
    assert_eq!(summary.total, 1);
}

#[tokio::test]
async fn missing_target_database_fails_with_code_10() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = restore
        .run(restore_input(&animal_docs(1)))
        .await
        .expect_err("restore must fail");
    assert!(matches!(err, Error::DatabaseNotFound { .. }));
    assert_eq!(err.exit_code(), 10);
}

// ---------------------------------------------------------------------------
// Restore: malformed input
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_backup_line_fails_with_its_line_number() {
    let server = MockServer::start().await;
    mount_empty_target(&server, "animaldb").await;
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .mount(&server)
        .await;

    let input = Cursor::new(b"[{\"_id\":\"a\",\"_rev\":\"1-a\"}]\n{\"not\":\"an array\"}\n".to_vec());
    let restore = Restore::new(
        connect(&server, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let err = restore.run(input).await.expect_err("restore must fail");
    match err {
        Error::BackupFileJson { line, .. } => assert_eq!(line, 2),
        other => panic!("expected BackupFileJson, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Round trip: backup output feeds restore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backup_output_round_trips_through_restore() {
    let source = MockServer::start().await;
    let docs = animal_docs(15);
    mount_backup_mocks(&source, &docs).await;

    let backup = Backup::new(
        connect(&source, "animaldb").await,
        BackupOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let mut sink = Vec::new();
    let backup_summary = backup.run(&mut sink).await.expect("backup should succeed");

    let target = MockServer::start().await;
    mount_empty_target(&target, "animaldb").await;
    // The backed-up docs carry revs, so the restore preserves them
    Mock::given(method("POST"))
        .and(path("/animaldb/_bulk_docs"))
        .and(body_partial_json(json!({"new_edits": false})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(1)
        .mount(&target)
        .await;

    let restore = Restore::new(
        connect(&target, "animaldb").await,
        RestoreOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    );
    let restore_summary = restore
        .run(Cursor::new(sink))
        .await
        .expect("restore should succeed");
    assert_eq!(restore_summary.total, backup_summary.total);
}
