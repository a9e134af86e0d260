//! Shared fixtures for Spillway integration tests.
//!
//! Provides:
//! - Temporary SQLite databases
//! - Helpers to seed queues directly through the store
//! - Polling helpers for asynchronous assertions
//!
//! Every helper installs the test tracing subscriber, so failures log errors.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spillway::id::Identifier;
use spillway::observability::tracing::init_test_tracing;
use spillway::storage::{SqliteStore, Store, WorkItem, WriteOp, DEFAULT_QUEUE};
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("spillway.db");
        Self { temp_dir, db_path }
    }

    /// Open a SQLite store on the fixture's database.
    pub fn sqlite(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open(&self.db_path, 8).expect("failed to open store"))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue `count` pending items with ids `1..=count` on the default queue.
///
/// `created_at` equals the id, so claim order is id order.
pub fn seed_queue(store: &dyn Store, count: u64) {
    init_test_tracing();
    let ops: Vec<WriteOp> = (1..=count)
        .map(|n| {
            WriteOp::Enqueue(WorkItem::pending(
                Identifier::from_raw(n),
                DEFAULT_QUEUE,
                format!("job-{n}").into_bytes(),
                n as i64,
            ))
        })
        .collect();
    store.write_batch(&ops).expect("failed to seed queue");
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met before the timeout.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    init_test_tracing();
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
