//! In-process store with row-level locks.
//!
//! Models the store contract closely enough to test the engine's concurrency
//! claims without a database server:
//! - claims lock candidate rows, skip rows other claims hold, and only then
//!   mark and release them, so concurrent claimants interleave the way
//!   `FOR UPDATE SKIP LOCKED` transactions do
//! - completions wait for a row lock held by an in-flight claim and then
//!   re-check their fence, like a blocked `UPDATE` re-evaluating its predicate
//! - batch writes can be made to fail on demand

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    ClaimBatch, ClaimRequest, Completion, Fence, Mutation, Record, StatusCounts, Store,
    StoreError, WorkItem, WorkStatus, WriteOp,
};
use crate::id::Identifier;

type TxnId = u64;

#[derive(Debug)]
struct Row {
    item: WorkItem,
    locked_by: Option<TxnId>,
}

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<Identifier, Record>,
    items: BTreeMap<Identifier, Row>,
    /// Sizes of successful batch writes, in commit order.
    batches: Vec<usize>,
    write_attempts: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_writes: usize,
    poison: HashSet<Vec<u8>>,
    write_latency: Duration,
}

/// A [`Store`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unlocked: Condvar,
    faults: Mutex<Faults>,
    lock_hold: Duration,
    next_txn: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold claim locks for `hold` before committing, simulating a slow
    /// claim transaction so concurrent claimants have to skip its rows.
    #[must_use]
    pub fn with_lock_hold(mut self, hold: Duration) -> Self {
        self.lock_hold = hold;
        self
    }

    /// Fail the next `n` batch writes.
    pub fn fail_next_writes(&self, n: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_next_writes = n;
        }
    }

    /// Reject every batch that contains a write with this payload.
    pub fn poison(&self, payload: Vec<u8>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.poison.insert(payload);
        }
    }

    /// Delay every batch write by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.write_latency = latency;
        }
    }

    /// Sizes of the batches written so far.
    pub fn batch_log(&self) -> Vec<usize> {
        self.tables().map(|t| t.batches.clone()).unwrap_or_default()
    }

    /// Number of `write_batch` calls, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.tables().map(|t| t.write_attempts).unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.tables().map(|t| t.records.len()).unwrap_or_default()
    }

    pub fn work_item_count(&self) -> usize {
        self.tables().map(|t| t.items.len()).unwrap_or_default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Check injected faults for a batch, consuming a pending forced failure.
    fn check_faults(&self, ops: &[WriteOp]) -> Result<Duration, StoreError> {
        let mut faults = self.faults.lock().map_err(|_| StoreError::Poisoned)?;
        if faults.fail_next_writes > 0 {
            faults.fail_next_writes -= 1;
            return Err(StoreError::Injected("forced batch failure".into()));
        }
        if let Some(op) = ops.iter().find(|op| faults.poison.contains(op.payload())) {
            return Err(StoreError::Injected(format!("poison row {}", op.id())));
        }
        Ok(faults.write_latency)
    }

    /// Lock phase of a claim: dead-letter exhausted expired rows, then lock
    /// up to `limit` claimable rows nobody else holds.
    fn lock_candidates(
        tables: &mut Tables,
        txn: TxnId,
        request: &ClaimRequest,
    ) -> (Vec<Identifier>, Vec<Identifier>) {
        let mut candidates: Vec<(i64, Identifier)> = tables
            .items
            .values()
            .filter(|row| row.item.queue == request.queue && row.locked_by.is_none())
            .filter(|row| is_claimable(&row.item, request.now))
            .map(|row| (row.item.created_at, row.item.id))
            .collect();
        candidates.sort_unstable();

        let mut locked = Vec::new();
        let mut dead = Vec::new();
        for (_, id) in candidates {
            let Some(row) = tables.items.get_mut(&id) else {
                continue;
            };
            if row.item.status == WorkStatus::Claimed && row.item.attempts > request.max_attempts {
                dead_letter(&mut row.item, request.now);
                dead.push(id);
                continue;
            }
            if locked.len() < request.limit {
                row.locked_by = Some(txn);
                locked.push(id);
            }
        }
        (locked, dead)
    }
}

fn is_claimable(item: &WorkItem, now: i64) -> bool {
    match item.status {
        WorkStatus::Pending => true,
        WorkStatus::Claimed => item.claim_expires_at.is_some_and(|at| at <= now),
        WorkStatus::Done | WorkStatus::Failed => false,
    }
}

fn dead_letter(item: &mut WorkItem, now: i64) {
    item.status = WorkStatus::Failed;
    item.claim_expires_at = None;
    item.updated_at = now;
    item.last_error = Some(
        item.last_error
            .take()
            .unwrap_or_else(|| format!("lease expired after {} attempts", item.attempts)),
    );
}

impl Store for MemoryStore {
    fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        if let Ok(mut tables) = self.tables() {
            tables.write_attempts += 1;
        }
        let latency = self.check_faults(ops)?;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut tables = self.tables()?;
        let mut seen = HashSet::with_capacity(ops.len());
        for op in ops {
            let id = op.id();
            let exists = match op {
                WriteOp::InsertRecord(_) => tables.records.contains_key(&id),
                WriteOp::Enqueue(_) => tables.items.contains_key(&id),
            };
            if exists || !seen.insert(id) {
                return Err(StoreError::Duplicate(id));
            }
        }

        for op in ops {
            match op {
                WriteOp::InsertRecord(record) => {
                    tables.records.insert(record.id, record.clone());
                }
                WriteOp::Enqueue(item) => {
                    tables.items.insert(
                        item.id,
                        Row {
                            item: item.clone(),
                            locked_by: None,
                        },
                    );
                }
            }
        }
        tables.batches.push(ops.len());
        Ok(())
    }

    fn get_record(&self, id: Identifier) -> Result<Option<Record>, StoreError> {
        Ok(self.tables()?.records.get(&id).cloned())
    }

    fn update_versioned(
        &self,
        id: Identifier,
        expected_version: u64,
        mutation: &Mutation,
        now: i64,
    ) -> Result<Option<Record>, StoreError> {
        let mut tables = self.tables()?;
        let Some(record) = tables.records.get_mut(&id) else {
            return Ok(None);
        };
        if record.version != expected_version {
            return Ok(None);
        }
        if let Some(payload) = &mutation.payload {
            record.payload.clone_from(payload);
        }
        if let Some(status) = &mutation.status {
            record.status.clone_from(status);
        }
        record.version += 1;
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    fn claim(&self, request: &ClaimRequest) -> Result<ClaimBatch, StoreError> {
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);

        let (locked, dead_lettered) = {
            let mut tables = self.tables()?;
            Self::lock_candidates(&mut tables, txn, request)
        };

        if !self.lock_hold.is_zero() && !locked.is_empty() {
            std::thread::sleep(self.lock_hold);
        }

        let mut tables = self.tables()?;
        let expires_at = request.expires_at();
        let mut items = Vec::with_capacity(locked.len());
        for id in locked {
            let Some(row) = tables.items.get_mut(&id) else {
                continue;
            };
            row.locked_by = None;
            row.item.status = WorkStatus::Claimed;
            row.item.claimed_by = Some(request.worker_id.clone());
            row.item.claim_expires_at = Some(expires_at);
            row.item.attempts += 1;
            row.item.updated_at = request.now;
            items.push(row.item.clone());
        }
        drop(tables);
        self.unlocked.notify_all();

        items.sort_by_key(|item| (item.created_at, item.id));
        Ok(ClaimBatch {
            items,
            dead_lettered,
        })
    }

    fn complete(
        &self,
        fence: &Fence,
        completion: &Completion,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        while tables
            .items
            .get(&fence.id)
            .is_some_and(|row| row.locked_by.is_some())
        {
            tables = self
                .unlocked
                .wait(tables)
                .map_err(|_| StoreError::Poisoned)?;
        }

        let Some(row) = tables.items.get_mut(&fence.id) else {
            return Ok(false);
        };
        let item = &mut row.item;
        let holds = item.status == WorkStatus::Claimed
            && item.claimed_by.as_deref() == Some(fence.worker_id.as_str())
            && item.attempts == fence.attempts;
        if !holds {
            return Ok(false);
        }

        match completion {
            Completion::Ack => {
                item.status = WorkStatus::Done;
                item.claim_expires_at = None;
            }
            Completion::Fail { reason } => {
                item.status = WorkStatus::Failed;
                item.claim_expires_at = None;
                item.last_error = Some(reason.clone());
            }
            Completion::RecordFailure { reason } => {
                item.last_error = Some(reason.clone());
            }
            Completion::ExtendLease { expires_at } => {
                item.claim_expires_at = Some(*expires_at);
            }
        }
        item.updated_at = now;
        Ok(true)
    }

    fn get_work_item(&self, id: Identifier) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.tables()?.items.get(&id).map(|row| row.item.clone()))
    }

    fn list_by_status(
        &self,
        queue: &str,
        status: WorkStatus,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let tables = self.tables()?;
        let mut items: Vec<WorkItem> = tables
            .items
            .values()
            .filter(|row| row.item.queue == queue && row.item.status == status)
            .map(|row| row.item.clone())
            .collect();
        items.sort_by_key(|item| (item.created_at, item.id));
        items.truncate(limit);
        Ok(items)
    }

    fn status_counts(&self, queue: &str) -> Result<StatusCounts, StoreError> {
        let tables = self.tables()?;
        let mut counts = StatusCounts::default();
        for row in tables.items.values().filter(|row| row.item.queue == queue) {
            counts.add(row.item.status, 1);
        }
        Ok(counts)
    }
}
