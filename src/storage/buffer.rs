//! Write buffer that turns many small submissions into few atomic batches.
//!
//! A single flusher task owns the accumulator. Producers talk to it through a
//! bounded channel (backpressure) and get a [`PendingWrite`] back that
//! resolves once their batch is durable. Only one flush is in flight at a
//! time; anything submitted while it runs waits in the channel and lands in
//! the next batch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::batch::{BatchAccumulator, BatchConfig, FlushFailurePolicy, FlushReason};
use super::{Store, StoreError, WriteOp};
use crate::id::Identifier;
use crate::observability::metrics;

/// Error type for buffered writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlushError {
    #[error("batch of {batch_size} writes failed: {message}")]
    Batch { batch_size: usize, message: String },

    #[error("write {id} rejected: {message}")]
    Rejected { id: Identifier, message: String },

    #[error("batch buffer is closed")]
    Closed,
}

type Ack = oneshot::Sender<Result<(), FlushError>>;

enum Command {
    Write { op: WriteOp, ack: Ack },
    Flush { done: oneshot::Sender<()> },
    Shutdown { done: oneshot::Sender<()> },
}

struct Pending {
    op: WriteOp,
    ack: Ack,
}

/// Resolves when the batch holding this write has been flushed.
#[derive(Debug)]
#[must_use = "a pending write does nothing unless awaited"]
pub struct PendingWrite {
    id: Identifier,
    rx: oneshot::Receiver<Result<(), FlushError>>,
}

impl PendingWrite {
    pub fn id(&self) -> Identifier {
        self.id
    }
}

impl Future for PendingWrite {
    type Output = Result<(), FlushError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The flusher dropped the ack without answering.
            Poll::Ready(Err(_)) => Poll::Ready(Err(FlushError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Owner of the flusher task.
pub struct BatchBuffer {
    handle: BufferHandle,
    task: JoinHandle<()>,
}

impl BatchBuffer {
    /// Spawn the flusher task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn Store>, config: BatchConfig, channel_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let task = tokio::spawn(run_flusher(store, config, rx));
        Self {
            handle: BufferHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle.clone()
    }

    /// Wait for the flusher task to exit (after [`BufferHandle::shutdown`]).
    pub async fn join(self) -> Result<(), FlushError> {
        drop(self.handle);
        self.task.await.map_err(|e| FlushError::Batch {
            batch_size: 0,
            message: format!("flusher task failed: {e}"),
        })
    }
}

/// Cheap, cloneable producer side of a [`BatchBuffer`].
#[derive(Clone, Debug)]
pub struct BufferHandle {
    tx: mpsc::Sender<Command>,
}

impl BufferHandle {
    /// Queue a write. Waits only for channel capacity, not for durability.
    pub async fn submit(&self, op: WriteOp) -> Result<PendingWrite, FlushError> {
        let id = op.id();
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Write { op, ack })
            .await
            .map_err(|_| FlushError::Closed)?;
        Ok(PendingWrite { id, rx })
    }

    /// Queue a write and wait until it is durable.
    pub async fn write(&self, op: WriteOp) -> Result<(), FlushError> {
        self.submit(op).await?.await
    }

    /// Flush whatever is pending now and wait for it.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { done })
            .await
            .map_err(|_| FlushError::Closed)?;
        rx.await.map_err(|_| FlushError::Closed)
    }

    /// Flush everything already submitted and stop the flusher.
    pub async fn shutdown(&self) -> Result<(), FlushError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { done })
            .await
            .map_err(|_| FlushError::Closed)?;
        rx.await.map_err(|_| FlushError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_flusher(
    store: Arc<dyn Store>,
    config: BatchConfig,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut batch: BatchAccumulator<Pending> = BatchAccumulator::new(config);
    tracing::debug!(
        max_batch_size = config.max_batch_size,
        max_batch_delay_ms = config.max_batch_delay.as_millis() as u64,
        policy = ?config.failure_policy,
        "Batch flusher started"
    );

    let shutdown_done = loop {
        let command = match batch.deadline() {
            Some(deadline) => {
                tokio::select! {
                    command = rx.recv() => command,
                    () = tokio::time::sleep_until(deadline.into()) => {
                        flush(&store, config.failure_policy, batch.drain(), FlushReason::Delay).await;
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match command {
            Some(Command::Write { op, ack }) => {
                if let Some(reason) = batch.push(Pending { op, ack }) {
                    flush(&store, config.failure_policy, batch.drain(), reason).await;
                }
            }
            Some(Command::Flush { done }) => {
                flush(&store, config.failure_policy, batch.drain(), FlushReason::Forced).await;
                let _ = done.send(());
            }
            Some(Command::Shutdown { done }) => break Some(done),
            None => break None,
        }
    };

    // Refuse new work, then drain what was already accepted.
    rx.close();
    let mut late_waiters = Vec::new();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write { op, ack } => {
                if let Some(reason) = batch.push(Pending { op, ack }) {
                    flush(&store, config.failure_policy, batch.drain(), reason).await;
                }
            }
            Command::Flush { done } | Command::Shutdown { done } => late_waiters.push(done),
        }
    }
    flush(&store, config.failure_policy, batch.drain(), FlushReason::Forced).await;

    for done in shutdown_done.into_iter().chain(late_waiters) {
        let _ = done.send(());
    }
    tracing::debug!("Batch flusher stopped");
}

/// Write one batch and resolve every waiter in it.
async fn flush(
    store: &Arc<dyn Store>,
    policy: FlushFailurePolicy,
    batch: Vec<Pending>,
    reason: FlushReason,
) {
    if batch.is_empty() {
        return;
    }

    let batch_size = batch.len();
    let started = Instant::now();
    let (ops, acks): (Vec<WriteOp>, Vec<Ack>) =
        batch.into_iter().map(|p| (p.op, p.ack)).unzip();

    let outcomes = match policy {
        FlushFailurePolicy::AllOrNothing => {
            let (_, result) = write_blocking(store, ops).await;
            let outcome = result.map_err(|e| FlushError::Batch {
                batch_size,
                message: e.to_string(),
            });
            vec![outcome; batch_size]
        }
        FlushFailurePolicy::PartialReplay => replay(store, ops).await,
    };

    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    let elapsed = started.elapsed();
    metrics::record_flush(batch_size, failed > 0, elapsed.as_secs_f64());
    if failed == 0 {
        tracing::debug!(
            batch_size,
            reason = reason.as_str(),
            elapsed_us = elapsed.as_micros() as u64,
            "Batch flushed"
        );
    } else {
        tracing::warn!(
            batch_size,
            failed,
            reason = reason.as_str(),
            "Batch flush failed"
        );
    }

    for (ack, outcome) in acks.into_iter().zip(outcomes) {
        // The producer may have stopped waiting.
        let _ = ack.send(outcome);
    }
}

/// Bisect a failed batch until every write is either durable or isolated.
///
/// Left halves are written before right halves so durable rows keep the
/// submission order.
async fn replay(store: &Arc<dyn Store>, ops: Vec<WriteOp>) -> Vec<Result<(), FlushError>> {
    let mut outcomes: Vec<Result<(), FlushError>> = vec![Ok(()); ops.len()];
    let mut stack = vec![(0usize, ops)];

    while let Some((offset, ops)) = stack.pop() {
        let len = ops.len();
        let first = ops[0].id();
        let (mut ops, result) = write_blocking(store, ops).await;
        match result {
            Ok(()) => {}
            Err(e) if len == 1 => {
                tracing::warn!(id = %first, error = %e, "Isolated rejected write");
                outcomes[offset] = Err(FlushError::Rejected {
                    id: first,
                    message: e.to_string(),
                });
            }
            // The blocking task died and took the ops with it.
            Err(e) if ops.len() != len => {
                for outcome in &mut outcomes[offset..offset + len] {
                    *outcome = Err(FlushError::Batch {
                        batch_size: len,
                        message: e.to_string(),
                    });
                }
            }
            Err(e) => {
                tracing::debug!(len, error = %e, "Bisecting failed batch");
                let right = ops.split_off(len / 2);
                stack.push((offset + len / 2, right));
                stack.push((offset, ops));
            }
        }
    }
    outcomes
}

async fn write_blocking(
    store: &Arc<dyn Store>,
    ops: Vec<WriteOp>,
) -> (Vec<WriteOp>, Result<(), StoreError>) {
    let store = Arc::clone(store);
    let len = ops.len();
    match tokio::task::spawn_blocking(move || {
        let result = store.write_batch(&ops);
        (ops, result)
    })
    .await
    {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(error = %e, len, "Batch write task failed");
            (Vec::new(), Err(StoreError::TaskFailed(e.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Identifier;
    use crate::storage::{MemoryStore, Record};
    use std::time::Duration;

    fn record(n: u64) -> WriteOp {
        WriteOp::InsertRecord(Record::new(
            Identifier::from_raw(n),
            format!("payload-{n}").into_bytes(),
            0,
        ))
    }

    fn config(size: usize, delay_ms: u64, policy: FlushFailurePolicy) -> BatchConfig {
        BatchConfig {
            max_batch_size: size,
            max_batch_delay: Duration::from_millis(delay_ms),
            failure_policy: policy,
        }
    }

    #[tokio::test]
    async fn test_delay_trigger_flushes_partial_batch() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BatchBuffer::spawn(
            store.clone(),
            config(100, 10, FlushFailurePolicy::AllOrNothing),
            16,
        );
        let handle = buffer.handle();

        handle.write(record(1)).await.unwrap();
        assert_eq!(store.batch_log(), vec![1]);

        handle.shutdown().await.unwrap();
        buffer.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_flush() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BatchBuffer::spawn(
            store.clone(),
            config(100, 60_000, FlushFailurePolicy::AllOrNothing),
            16,
        );
        let handle = buffer.handle();

        let a = handle.submit(record(1)).await.unwrap();
        let b = handle.submit(record(2)).await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Ok(()));
        assert_eq!(store.batch_log(), vec![2]);

        handle.shutdown().await.unwrap();
        buffer.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BatchBuffer::spawn(
            store.clone(),
            config(100, 60_000, FlushFailurePolicy::AllOrNothing),
            16,
        );
        let handle = buffer.handle();

        let pending = handle.submit(record(7)).await.unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(pending.await, Ok(()));
        assert!(store.get_record(Identifier::from_raw(7)).unwrap().is_some());

        assert_eq!(handle.submit(record(8)).await.unwrap_err(), FlushError::Closed);
        buffer.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_isolates_single_poison_row() {
        let store = Arc::new(MemoryStore::new());
        store.poison(b"payload-3".to_vec());
        let buffer = BatchBuffer::spawn(
            store.clone(),
            config(4, 60_000, FlushFailurePolicy::PartialReplay),
            16,
        );
        let handle = buffer.handle();

        let mut pending = Vec::new();
        for n in 1..=4 {
            pending.push(handle.submit(record(n)).await.unwrap());
        }
        let mut results = Vec::new();
        for p in pending {
            results.push(p.await);
        }

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(
            &results[2],
            Err(FlushError::Rejected { id, .. }) if id.raw() == 3
        ));
        assert!(results[3].is_ok());
        // [1,2,3,4] fails, [1,2] ok, [3,4] fails, [3] rejected, [4] ok
        assert_eq!(store.batch_log(), vec![2, 1]);

        handle.shutdown().await.unwrap();
        buffer.join().await.unwrap();
    }
}
