//! CLI integration tests for spillwayctl against a temporary database.

use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use serde_json::Value;
use spillway::id::Identifier;
use spillway::storage::{
    ClaimRequest, Completion, Record, SqliteStore, Store, WorkItem, WriteOp, DEFAULT_QUEUE,
};
use tempfile::TempDir;

fn ctl(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_spillwayctl"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("SPILLWAY_NODE_ID")
        .output()
        .expect("failed to run spillwayctl")
}

fn json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

/// One pending item (id 1), one dead letter (id 2) and one record (id 3).
fn seed(db: &Path) {
    let store = SqliteStore::open(db, 2).unwrap();
    store
        .write_batch(&[
            WriteOp::Enqueue(WorkItem::pending(
                Identifier::from_raw(1),
                DEFAULT_QUEUE,
                b"first".to_vec(),
                1,
            )),
            WriteOp::Enqueue(WorkItem::pending(
                Identifier::from_raw(2),
                DEFAULT_QUEUE,
                b"second".to_vec(),
                2,
            )),
            WriteOp::InsertRecord(Record::new(Identifier::from_raw(3), b"profile".to_vec(), 3)),
        ])
        .unwrap();

    let batch = store
        .claim(&ClaimRequest {
            queue: DEFAULT_QUEUE.into(),
            worker_id: "w1".into(),
            limit: 2,
            now: 10,
            lease: Duration::from_secs(30),
            max_attempts: 5,
        })
        .unwrap();
    let second = &batch.items[1];
    assert_eq!(second.id.raw(), 2);
    let fence = second.fence().unwrap();
    let failed = Completion::Fail {
        reason: "bad payload".into(),
    };
    assert!(store.complete(&fence, &failed, 20).unwrap());

    let first = batch.items[0].fence().unwrap();
    assert!(store.complete(&first, &Completion::Ack, 20).unwrap());
    store
        .write_batch(&[WriteOp::Enqueue(WorkItem::pending(
            Identifier::from_raw(4),
            DEFAULT_QUEUE,
            b"third".to_vec(),
            4,
        ))])
        .unwrap();
}

#[test]
fn test_enqueue_creates_database_and_reports_id() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("nested").join("spillway.db");

    let output = ctl(&db, &["--output", "json", "enqueue", "hello", "--queue", "emails", "--node-id", "9"]);
    let body = json(&output);
    assert_eq!(body["queue"], "emails");
    assert_eq!(body["payload_size"], 5);

    let id = Identifier::from_raw(body["id"].as_u64().unwrap());
    assert_eq!(id.node().get(), 9);

    let store = SqliteStore::open(&db, 1).unwrap();
    let item = store.get_work_item(id).unwrap().unwrap();
    assert_eq!(item.queue, "emails");
    assert_eq!(item.payload, b"hello");
}

#[test]
fn test_enqueue_rejects_payload_and_file() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("spillway.db");
    let file = dir.path().join("payload.bin");
    std::fs::write(&file, b"x").unwrap();

    let output = ctl(&db, &["enqueue", "inline", "--file", file.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot specify both"));
}

#[test]
fn test_status_counts_each_state() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("spillway.db");
    seed(&db);

    let body = json(&ctl(&db, &["--output", "json", "status"]));
    assert_eq!(body["queue"], DEFAULT_QUEUE);
    assert_eq!(body["pending"], 1);
    assert_eq!(body["claimed"], 0);
    assert_eq!(body["done"], 1);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["total"], 3);

    let text = ctl(&db, &["status"]);
    assert!(text.status.success());
    assert!(String::from_utf8_lossy(&text.stdout).contains("Total: 3 item(s)"));
}

#[test]
fn test_dead_letters_lists_failed_items() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("spillway.db");
    seed(&db);

    let body = json(&ctl(&db, &["--output", "json", "dead-letters"]));
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], 2);
    assert_eq!(body["items"][0]["attempts"], 1);
    assert_eq!(body["items"][0]["last_error"], "bad payload");

    let empty = ctl(&db, &["dead-letters", "--queue", "other"]);
    assert!(empty.status.success());
    assert!(String::from_utf8_lossy(&empty.stdout).contains("No dead letters on 'other'."));
}

#[test]
fn test_show_finds_items_and_records() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("spillway.db");
    seed(&db);

    let item = json(&ctl(&db, &["--output", "json", "show", "2"]));
    assert_eq!(item["kind"], "work_item");
    assert_eq!(item["status"], "failed");
    assert_eq!(item["claimed_by"], "w1");

    let record = json(&ctl(&db, &["--output", "json", "show", "3"]));
    assert_eq!(record["kind"], "record");
    assert_eq!(record["version"], 0);

    let missing = ctl(&db, &["show", "99"]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("no work item or record with id 99"));
}

#[test]
fn test_inspection_refuses_missing_database() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("absent.db");

    let output = ctl(&db, &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("database not found"));
    assert!(!db.exists());
}
