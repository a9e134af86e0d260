//! Persistence layer for Spillway.
//!
//! Provides:
//! - The [`Store`] trait: the narrow contract the engine needs from a
//!   relational store (atomic batch writes, versioned updates, skip-locked
//!   claims, fenced completions)
//! - [`SqliteStore`]: WAL-mode SQLite behind an r2d2 pool
//! - [`MemoryStore`]: in-process tables with row-level locks and fault injection
//! - The batch accumulator and the [`BatchBuffer`] that flushes it

pub mod batch;
pub mod buffer;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use batch::{BatchConfig, FlushFailurePolicy};
pub use buffer::{BatchBuffer, BufferHandle, FlushError, PendingWrite};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::id::Identifier;

/// Status label given to records that do not specify one.
pub const DEFAULT_RECORD_STATUS: &str = "active";

/// Queue name used when the caller does not pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Duplicate identifier: {0}")]
    Duplicate(Identifier),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Injected failure: {0}")]
    Injected(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Blocking task failed: {0}")]
    TaskFailed(String),
}

/// A versioned domain row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Identifier,
    /// Starts at 0, incremented by exactly 1 per successful guarded update.
    pub version: u64,
    pub payload: Vec<u8>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Record {
    /// A fresh record at version 0.
    pub fn new(id: Identifier, payload: Vec<u8>, now: i64) -> Self {
        Self {
            id,
            version: 0,
            payload,
            status: DEFAULT_RECORD_STATUS.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle of a queued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Claimed,
    Done,
    /// Terminal. Dead-lettered items stay here indefinitely.
    Failed,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 4] = [Self::Pending, Self::Claimed, Self::Done, Self::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!("unknown work status '{other}'"))),
        }
    }
}

/// A row in the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Identifier,
    pub queue: String,
    pub payload: Vec<u8>,
    pub status: WorkStatus,
    pub claimed_by: Option<String>,
    /// Unix ms after which the claim may be taken over.
    pub claim_expires_at: Option<i64>,
    /// Number of times the item has been claimed.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WorkItem {
    /// A new item waiting in `queue`.
    pub fn pending(id: Identifier, queue: impl Into<String>, payload: Vec<u8>, now: i64) -> Self {
        Self {
            id,
            queue: queue.into(),
            payload,
            status: WorkStatus::Pending,
            claimed_by: None,
            claim_expires_at: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The fence a holder must still match for its completion to apply.
    pub fn fence(&self) -> Option<Fence> {
        self.claimed_by.as_ref().map(|worker_id| Fence {
            id: self.id,
            worker_id: worker_id.clone(),
            attempts: self.attempts,
        })
    }
}

/// One buffered write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    InsertRecord(Record),
    Enqueue(WorkItem),
}

impl WriteOp {
    pub fn id(&self) -> Identifier {
        match self {
            Self::InsertRecord(record) => record.id,
            Self::Enqueue(item) => item.id,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::InsertRecord(record) => &record.payload,
            Self::Enqueue(item) => &item.payload,
        }
    }

    pub(crate) fn same_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::InsertRecord(_), Self::InsertRecord(_)) | (Self::Enqueue(_), Self::Enqueue(_))
        )
    }
}

/// Field changes applied by a guarded update. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    pub payload: Option<Vec<u8>>,
    pub status: Option<String>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Parameters of one skip-locked claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub queue: String,
    pub worker_id: String,
    pub limit: usize,
    /// Unix ms, read from the poller's clock.
    pub now: i64,
    pub lease: Duration,
    pub max_attempts: u32,
}

impl ClaimRequest {
    pub fn expires_at(&self) -> i64 {
        lease_deadline(self.now, self.lease)
    }
}

/// `now + lease` in Unix ms, saturating at `i64::MAX` for leases too long
/// to represent.
pub fn lease_deadline(now: i64, lease: Duration) -> i64 {
    now.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
}

/// Result of a claim. Empty `items` is a normal outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimBatch {
    /// Claimed items ordered by `(created_at, id)`.
    pub items: Vec<WorkItem>,
    /// Expired items that exceeded `max_attempts` and moved to `failed`.
    pub dead_lettered: Vec<Identifier>,
}

impl ClaimBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Identity a claim holder must match for a completion to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub id: Identifier,
    pub worker_id: String,
    pub attempts: u32,
}

/// What a claim holder does with its item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// `claimed -> done`
    Ack,
    /// `claimed -> failed`, permanently
    Fail { reason: String },
    /// Keep the claim, remember why processing failed
    RecordFailure { reason: String },
    /// Push the lease expiry out to the given Unix ms
    ExtendLease { expires_at: i64 },
}

/// Item counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: WorkStatus, count: u64) {
        match status {
            WorkStatus::Pending => self.pending += count,
            WorkStatus::Claimed => self.claimed += count,
            WorkStatus::Done => self.done += count,
            WorkStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.failed
    }
}

/// The relational store as seen by the engine.
///
/// Every method is a single atomic operation against the store. Methods block
/// on I/O; async callers go through [`run_blocking`].
pub trait Store: Send + Sync {
    /// Persist every op or none of them, in order.
    fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError>;

    fn get_record(&self, id: Identifier) -> Result<Option<Record>, StoreError>;

    /// Apply `mutation` iff the stored version equals `expected_version`,
    /// bumping the version by one. `None` means zero rows were affected.
    fn update_versioned(
        &self,
        id: Identifier,
        expected_version: u64,
        mutation: &Mutation,
        now: i64,
    ) -> Result<Option<Record>, StoreError>;

    /// Select, lock (skipping rows locked by other claimants) and mark up to
    /// `request.limit` claimable items in one atomic operation.
    fn claim(&self, request: &ClaimRequest) -> Result<ClaimBatch, StoreError>;

    /// Apply `completion` iff the item is still claimed under `fence`.
    /// Returns `false` when the fence no longer matches.
    fn complete(&self, fence: &Fence, completion: &Completion, now: i64)
        -> Result<bool, StoreError>;

    fn get_work_item(&self, id: Identifier) -> Result<Option<WorkItem>, StoreError>;

    /// Items of `queue` in `status`, oldest first.
    fn list_by_status(
        &self,
        queue: &str,
        status: WorkStatus,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    fn status_counts(&self, queue: &str) -> Result<StatusCounts, StoreError>;
}

/// Run a blocking store call on tokio's blocking pool.
pub async fn run_blocking<T, F>(store: &Arc<dyn Store>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_status_round_trip() {
        for status in WorkStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkStatus>().unwrap(), status);
        }
        assert!(matches!(
            "archived".parse::<WorkStatus>(),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_lease_deadline_saturates() {
        assert_eq!(lease_deadline(1_000, Duration::from_millis(500)), 1_500);
        assert_eq!(lease_deadline(1_000, Duration::from_millis(u64::MAX)), i64::MAX);
        assert_eq!(lease_deadline(i64::MAX - 1, Duration::from_millis(10)), i64::MAX);
        assert_eq!(lease_deadline(1_000, Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_fence_requires_claim() {
        let mut item = WorkItem::pending(Identifier::from_raw(1), DEFAULT_QUEUE, vec![], 0);
        assert!(item.fence().is_none());

        item.claimed_by = Some("w1".into());
        item.attempts = 2;
        let fence = item.fence().unwrap();
        assert_eq!(fence.worker_id, "w1");
        assert_eq!(fence.attempts, 2);
    }

    #[test]
    fn test_status_counts_total() {
        let mut counts = StatusCounts::default();
        counts.add(WorkStatus::Pending, 3);
        counts.add(WorkStatus::Failed, 2);
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.failed, 2);
    }
}
