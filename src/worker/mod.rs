//! Worker pool that drains a queue through a [`Handler`].
//!
//! Each worker runs its own state machine:
//!
//! ```text
//! Idle -> Polling -> Processing -> Committing -> Idle
//!                               \-> Failing ----/
//! ```
//!
//! Workers hold at most one claim batch. Cancellation is checked only in
//! `Idle`: a handler that has started always runs to completion and its
//! outcome is committed. Items of a batch that were never started when the
//! worker stops stay claimed until their lease expires.

use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::queue::{QueueError, QueuePoller};
use crate::storage::WorkItem;

/// Worker pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Sleep after the first empty claim
    pub poll_interval: Duration,
    /// Cap for the doubling sleep after consecutive empty claims
    pub max_poll_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(100),
            max_poll_backoff: Duration::from_secs(5),
        }
    }
}

/// A handler failure.
///
/// Retryable failures leave the item to be claimed again once its lease
/// expires. Permanent failures dead-letter it right away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    permanent: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure no retry can fix, such as an undecodable payload.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }
}

/// Processes one claimed work item.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, item: &WorkItem) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Processing,
    Committing,
    Failing,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Processing => "processing",
            Self::Committing => "committing",
            Self::Failing => "failing",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Totals across every worker of a coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Items claimed
    pub claimed: u64,
    /// Items handled and acked
    pub processed: u64,
    /// Handler failures, retried or not
    pub failed: u64,
    /// Items moved to `failed`, by a worker or at claim time
    pub dead_lettered: u64,
    /// Completions rejected because the lease had been taken over
    pub lease_lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    claimed: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    lease_lost: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
        }
    }
}

/// Runs `worker_count` workers until shut down.
pub struct WorkerCoordinator {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
    counters: Arc<Counters>,
}

impl WorkerCoordinator {
    /// Spawn the workers on the current tokio runtime.
    ///
    /// `make_poller` is called once per worker with a fresh worker identity.
    pub fn spawn<H, F>(make_poller: F, handler: Arc<H>, config: WorkerConfig) -> Self
    where
        H: Handler,
        F: Fn(&str) -> QueuePoller,
    {
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let mut tasks = Vec::with_capacity(config.worker_count);
        let mut worker_ids = Vec::with_capacity(config.worker_count);

        for _ in 0..config.worker_count {
            let worker_id = format!("worker-{}", Uuid::now_v7());
            let worker = Worker {
                poller: make_poller(&worker_id),
                handler: Arc::clone(&handler),
                config,
                cancel: cancel.clone(),
                counters: Arc::clone(&counters),
                state: WorkerState::Idle,
            };
            tasks.push(tokio::spawn(worker.run()));
            worker_ids.push(worker_id);
        }

        tracing::info!(workers = config.worker_count, "Worker pool started");
        Self {
            cancel,
            tasks,
            worker_ids,
            counters,
        }
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// A token that stops the workers when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every worker and wait for in-flight items to be committed.
    pub async fn shutdown(self) -> WorkerStats {
        tracing::info!(workers = self.tasks.len(), "Stopping worker pool");
        self.cancel.cancel();

        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        let stats = self.counters.snapshot();
        tracing::info!(?stats, "Worker pool stopped");
        stats
    }
}

struct Worker<H> {
    poller: QueuePoller,
    handler: Arc<H>,
    config: WorkerConfig,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    state: WorkerState,
}

impl<H: Handler> Worker<H> {
    async fn run(mut self) {
        tracing::debug!(worker_id = %self.poller.worker_id(), "Worker started");
        let mut backoff = self.config.poll_interval;

        loop {
            self.transition(WorkerState::Idle);
            if self.cancel.is_cancelled() {
                break;
            }

            self.transition(WorkerState::Polling);
            let batch = match self.poller.claim_next().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(worker_id = %self.poller.worker_id(), error = %e, "Claim failed");
                    self.transition(WorkerState::Idle);
                    if !self.idle(backoff).await {
                        break;
                    }
                    backoff = self.next_backoff(backoff);
                    continue;
                }
            };

            self.counters
                .dead_lettered
                .fetch_add(batch.dead_lettered.len() as u64, Ordering::Relaxed);
            if batch.is_empty() {
                self.transition(WorkerState::Idle);
                if !self.idle(backoff).await {
                    break;
                }
                backoff = self.next_backoff(backoff);
                continue;
            }

            backoff = self.config.poll_interval;
            self.counters
                .claimed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);

            let total = batch.len();
            for (done, item) in batch.items.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    tracing::info!(
                        worker_id = %self.poller.worker_id(),
                        abandoned = total - done,
                        "Cancelled mid-batch, leaving remaining items to lease expiry"
                    );
                    break;
                }
                self.process(item).await;
                self.transition(WorkerState::Idle);
            }
        }

        tracing::debug!(worker_id = %self.poller.worker_id(), "Worker stopped");
    }

    async fn process(&mut self, item: &WorkItem) {
        self.transition(WorkerState::Processing);
        let outcome = AssertUnwindSafe(self.handler.handle(item))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")));

        let result = match outcome {
            Ok(()) => {
                self.transition(WorkerState::Committing);
                let result = self.poller.ack(item).await;
                if result.is_ok() {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            Err(err) => {
                self.transition(WorkerState::Failing);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if err.is_permanent() || self.poller.is_exhausted(item) {
                    tracing::warn!(id = %item.id, attempts = item.attempts, error = %err, "Dead-lettering item");
                    let result = self.poller.fail(item, err.to_string()).await;
                    if result.is_ok() {
                        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    result
                } else {
                    tracing::debug!(id = %item.id, attempts = item.attempts, error = %err, "Handler failed, will retry after lease expiry");
                    self.poller.record_failure(item, err.to_string()).await
                }
            }
        };

        match result {
            Ok(()) => {}
            Err(QueueError::LeaseLost { .. }) => {
                self.counters.lease_lost.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(id = %item.id, error = %e, "Failed to commit item outcome");
            }
        }
    }

    /// Sleep in `Idle`. Returns `false` if cancelled while waiting.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.config.max_poll_backoff)
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::trace!(
                worker_id = %self.poller.worker_id(),
                from = %self.state,
                to = %next,
                "Worker state"
            );
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_kinds() {
        assert!(!HandlerError::new("timeout").is_permanent());
        let err = HandlerError::permanent("bad payload");
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "bad payload");
    }

    #[test]
    fn test_default_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_count, 4);
        assert!(config.max_poll_backoff > config.poll_interval);
    }
}
