//! Skip-locked claim protocol.
//!
//! A [`QueuePoller`] claims batches of work items for one worker identity.
//! Claims are leases: an item whose lease runs out becomes claimable again,
//! which is how crashed workers are recovered. Every completion is fenced on
//! `(claimed_by, attempts)`, so a worker that lost its lease can never
//! overwrite the outcome of whoever took the item over.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::id::{Identifier, SharedClock};
use crate::observability::metrics;
use crate::storage::{
    lease_deadline, run_blocking, ClaimBatch, ClaimRequest, Completion, Fence, StatusCounts, Store, StoreError,
    WorkItem, WorkStatus, DEFAULT_QUEUE,
};

/// Error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("lease on {id} lost by {worker_id}")]
    LeaseLost { id: Identifier, worker_id: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Per-queue claim settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub queue: String,
    pub lease_duration: Duration,
    /// Claims an item may consume; an expired claim beyond this is dead-lettered.
    pub max_attempts: u32,
    pub claim_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            lease_duration: Duration::from_secs(30),
            max_attempts: 5,
            claim_limit: 10,
        }
    }
}

/// Claims and completes work items on behalf of one worker.
#[derive(Clone)]
pub struct QueuePoller {
    store: Arc<dyn Store>,
    worker_id: String,
    config: QueueConfig,
    clock: SharedClock,
}

impl std::fmt::Debug for QueuePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePoller")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueuePoller {
    pub fn new(
        store: Arc<dyn Store>,
        worker_id: impl Into<String>,
        config: QueueConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            config,
            clock,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        self.clock.now_millis() as i64
    }

    /// Claim up to `limit` items under the configured lease.
    pub async fn claim(&self, limit: usize) -> Result<ClaimBatch, QueueError> {
        self.claim_with_lease(limit, self.config.lease_duration).await
    }

    /// Claim up to the configured `claim_limit` items.
    pub async fn claim_next(&self) -> Result<ClaimBatch, QueueError> {
        self.claim(self.config.claim_limit).await
    }

    /// Claim up to `limit` items, each leased for `lease`.
    ///
    /// An empty batch means nothing was claimable right now, which includes
    /// the case where every candidate was locked by a concurrent claim.
    pub async fn claim_with_lease(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<ClaimBatch, QueueError> {
        if limit == 0 {
            return Ok(ClaimBatch::default());
        }
        let request = ClaimRequest {
            queue: self.config.queue.clone(),
            worker_id: self.worker_id.clone(),
            limit,
            now: self.now(),
            lease,
            max_attempts: self.config.max_attempts,
        };
        let batch = run_blocking(&self.store, move |store| store.claim(&request)).await?;

        metrics::record_claim(&self.config.queue, batch.len(), batch.dead_lettered.len());
        if !batch.dead_lettered.is_empty() {
            tracing::warn!(
                queue = %self.config.queue,
                count = batch.dead_lettered.len(),
                ids = ?batch.dead_lettered,
                "Dead-lettered exhausted items"
            );
        }
        if !batch.is_empty() {
            tracing::debug!(
                queue = %self.config.queue,
                worker_id = %self.worker_id,
                claimed = batch.len(),
                "Claimed items"
            );
        }
        Ok(batch)
    }

    /// `claimed -> done`.
    pub async fn ack(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.complete(item, Completion::Ack).await
    }

    /// `claimed -> failed`, permanently.
    pub async fn fail(&self, item: &WorkItem, reason: impl Into<String>) -> Result<(), QueueError> {
        self.complete(item, Completion::Fail { reason: reason.into() })
            .await?;
        metrics::record_dead_letters(&self.config.queue, 1);
        Ok(())
    }

    /// Remember why processing failed and leave the claim to expire.
    pub async fn record_failure(
        &self,
        item: &WorkItem,
        reason: impl Into<String>,
    ) -> Result<(), QueueError> {
        self.complete(item, Completion::RecordFailure { reason: reason.into() })
            .await
    }

    /// Push the lease out to `now + lease`. Returns the new expiry (Unix ms).
    pub async fn extend_lease(&self, item: &WorkItem, lease: Duration) -> Result<i64, QueueError> {
        let expires_at = lease_deadline(self.now(), lease);
        self.complete(item, Completion::ExtendLease { expires_at })
            .await?;
        Ok(expires_at)
    }

    /// Whether an item has used up its attempts.
    pub fn is_exhausted(&self, item: &WorkItem) -> bool {
        item.attempts > self.config.max_attempts
    }

    /// Dead-lettered items, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<WorkItem>, QueueError> {
        let queue = self.config.queue.clone();
        Ok(run_blocking(&self.store, move |store| {
            store.list_by_status(&queue, WorkStatus::Failed, limit)
        })
        .await?)
    }

    pub async fn get(&self, id: Identifier) -> Result<Option<WorkItem>, QueueError> {
        Ok(run_blocking(&self.store, move |store| store.get_work_item(id)).await?)
    }

    /// Item counts per status for this poller's queue.
    pub async fn stats(&self) -> Result<StatusCounts, QueueError> {
        let queue = self.config.queue.clone();
        Ok(run_blocking(&self.store, move |store| store.status_counts(&queue)).await?)
    }

    async fn complete(&self, item: &WorkItem, completion: Completion) -> Result<(), QueueError> {
        let fence = Fence {
            id: item.id,
            worker_id: self.worker_id.clone(),
            attempts: item.attempts,
        };
        let now = self.now();
        let applied =
            run_blocking(&self.store, move |store| store.complete(&fence, &completion, now))
                .await?;
        if applied {
            return Ok(());
        }

        metrics::record_lease_lost(&self.config.queue);
        tracing::warn!(
            id = %item.id,
            worker_id = %self.worker_id,
            attempts = item.attempts,
            "Lease lost before completion"
        );
        Err(QueueError::LeaseLost {
            id: item.id,
            worker_id: self.worker_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ManualClock;
    use crate::storage::{MemoryStore, WriteOp};

    fn seed(store: &MemoryStore, count: u64) {
        let ops: Vec<WriteOp> = (1..=count)
            .map(|n| {
                WriteOp::Enqueue(WorkItem::pending(
                    Identifier::from_raw(n),
                    DEFAULT_QUEUE,
                    vec![n as u8],
                    n as i64,
                ))
            })
            .collect();
        store.write_batch(&ops).unwrap();
    }

    fn poller(store: &Arc<MemoryStore>, clock: &ManualClock, worker: &str) -> QueuePoller {
        let config = QueueConfig {
            lease_duration: Duration::from_millis(1_000),
            max_attempts: 2,
            ..QueueConfig::default()
        };
        QueuePoller::new(store.clone(), worker, config, clock.shared())
    }

    #[tokio::test]
    async fn test_claim_marks_items() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 3);
        let clock = ManualClock::new(10_000);
        let w1 = poller(&store, &clock, "w1");

        let batch = w1.claim(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        for item in &batch.items {
            assert_eq!(item.status, WorkStatus::Claimed);
            assert_eq!(item.claimed_by.as_deref(), Some("w1"));
            assert_eq!(item.claim_expires_at, Some(11_000));
            assert_eq!(item.attempts, 1);
        }

        let stats = w1.stats().await.unwrap();
        assert_eq!((stats.pending, stats.claimed), (1, 2));
    }

    #[tokio::test]
    async fn test_lease_boundary_is_inclusive() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1);
        let clock = ManualClock::new(0);
        let w1 = poller(&store, &clock, "w1");
        let w2 = poller(&store, &clock, "w2");

        w1.claim(1).await.unwrap();
        clock.set(999);
        assert!(w2.claim(1).await.unwrap().is_empty());
        clock.set(1_000);
        let batch = w2.claim(1).await.unwrap();
        assert_eq!(batch.items[0].claimed_by.as_deref(), Some("w2"));
        assert_eq!(batch.items[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_claim_with_lease_overrides_configured_lease() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 2);
        let clock = ManualClock::new(0);
        let w1 = poller(&store, &clock, "w1");
        let w2 = poller(&store, &clock, "w2");

        let short = w1.claim_with_lease(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(short.items[0].claim_expires_at, Some(200));
        let long = w1.claim_with_lease(1, Duration::from_millis(5_000)).await.unwrap();
        assert_eq!(long.items[0].claim_expires_at, Some(5_000));

        // Only the short lease has run out; the configured 1 s lease plays no part.
        clock.set(1_000);
        let batch = w2.claim(2).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.items[0].id, Identifier::from_raw(1));
        w2.ack(&batch.items[0]).await.unwrap();
        clock.set(4_999);
        assert!(w2.claim(2).await.unwrap().is_empty());
        clock.set(5_000);
        assert_eq!(w2.claim(2).await.unwrap().items[0].id, Identifier::from_raw(2));
    }

    #[tokio::test]
    async fn test_oversized_lease_saturates() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1);
        let clock = ManualClock::new(10_000);
        let w1 = poller(&store, &clock, "w1");
        let w2 = poller(&store, &clock, "w2");

        let item = w1
            .claim_with_lease(1, Duration::from_millis(u64::MAX))
            .await
            .unwrap()
            .items
            .remove(0);
        assert_eq!(item.claim_expires_at, Some(i64::MAX));
        assert!(w2.claim(1).await.unwrap().is_empty());

        let expires_at = w1.extend_lease(&item, Duration::MAX).await.unwrap();
        assert_eq!(expires_at, i64::MAX);
        w1.ack(&item).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_ack_is_lease_lost() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1);
        let clock = ManualClock::new(0);
        let w1 = poller(&store, &clock, "w1");
        let w2 = poller(&store, &clock, "w2");

        let mine = w1.claim(1).await.unwrap().items.remove(0);
        clock.advance(1_000);
        let theirs = w2.claim(1).await.unwrap().items.remove(0);

        let err = w1.ack(&mine).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { ref worker_id, .. } if worker_id == "w1"));

        w2.ack(&theirs).await.unwrap();
        let stored = w2.get(theirs.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkStatus::Done);
    }

    #[tokio::test]
    async fn test_extend_lease_keeps_item_claimed() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1);
        let clock = ManualClock::new(0);
        let w1 = poller(&store, &clock, "w1");
        let w2 = poller(&store, &clock, "w2");

        let item = w1.claim(1).await.unwrap().items.remove(0);
        clock.set(900);
        let expires_at = w1.extend_lease(&item, Duration::from_millis(1_000)).await.unwrap();
        assert_eq!(expires_at, 1_900);

        clock.set(1_500);
        assert!(w2.claim(1).await.unwrap().is_empty());
        w1.ack(&item).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_exhausted_item_is_dead_lettered() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1);
        let clock = ManualClock::new(0);
        let w1 = poller(&store, &clock, "w1");

        // Claims 1 and 2 are within max_attempts = 2; claim 3 pushes past it.
        for _ in 0..3 {
            let batch = w1.claim(1).await.unwrap();
            assert_eq!(batch.len(), 1);
            w1.record_failure(&batch.items[0], "handler error").await.unwrap();
            clock.advance(1_000);
        }

        let batch = w1.claim(1).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.dead_lettered, vec![Identifier::from_raw(1)]);

        let dead = w1.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].last_error.as_deref(), Some("handler error"));
    }

    #[tokio::test]
    async fn test_fail_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1);
        let clock = ManualClock::new(0);
        let w1 = poller(&store, &clock, "w1");

        let item = w1.claim(1).await.unwrap().items.remove(0);
        w1.fail(&item, "bad payload").await.unwrap();

        clock.advance(60_000);
        assert!(w1.claim(1).await.unwrap().is_empty());
        assert_eq!(w1.stats().await.unwrap().failed, 1);
    }
}
