//! Producer-facing facade.
//!
//! An [`Engine`] wires one identifier allocator, one write buffer and one
//! version guard over a shared [`Store`]. Producers get their identifier
//! back before the row is durable; they decide whether to wait for the ack.

use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::guard::VersionGuard;
use crate::id::{AllocError, IdAllocator, Identifier, SharedClock, SystemClock};
use crate::observability::metrics;
use crate::queue::QueuePoller;
use crate::storage::{
    BatchBuffer, BufferHandle, FlushError, PendingWrite, Record, Store, StoreError, WorkItem,
    WriteOp,
};
use crate::worker::{Handler, WorkerCoordinator};

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("identifier allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("buffered write failed: {0}")]
    Flush(#[from] FlushError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A write accepted by the buffer.
///
/// The identifier is final; `ack` resolves once the row is durable.
#[derive(Debug)]
pub struct Submitted {
    pub id: Identifier,
    pub ack: PendingWrite,
}

impl Submitted {
    /// Wait for durability and return the identifier.
    pub async fn durable(self) -> Result<Identifier, FlushError> {
        self.ack.await?;
        Ok(self.id)
    }
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    clock: SharedClock,
    allocator: Arc<IdAllocator>,
    buffer: BatchBuffer,
    handle: BufferHandle,
    guard: VersionGuard,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open an engine over `store` using the system clock.
    ///
    /// Must be called from within a tokio runtime; the buffer's flusher task
    /// is spawned here.
    pub fn open(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self, EngineError> {
        Self::open_with_clock(config, store, SystemClock::shared())
    }

    pub fn open_with_clock(
        config: EngineConfig,
        store: Arc<dyn Store>,
        clock: SharedClock,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let node = config.node()?;
        let allocator = Arc::new(IdAllocator::with_config(
            node,
            Arc::clone(&clock),
            config.allocator_config(),
        ));
        let buffer = BatchBuffer::spawn(
            Arc::clone(&store),
            config.batch_config(),
            config.write_channel_size,
        );
        let handle = buffer.handle();
        let guard = VersionGuard::new(Arc::clone(&store), Arc::clone(&clock));

        tracing::info!(
            node = node.get(),
            max_batch_size = config.max_batch_size,
            max_batch_delay_ms = config.max_batch_delay.as_millis() as u64,
            queue = %config.queue,
            "Engine opened"
        );
        Ok(Self {
            config,
            store,
            clock,
            allocator,
            buffer,
            handle,
            guard,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn allocator(&self) -> &Arc<IdAllocator> {
        &self.allocator
    }

    pub fn guard(&self) -> &VersionGuard {
        &self.guard
    }

    /// A producer handle onto the write buffer.
    pub fn buffer(&self) -> BufferHandle {
        self.handle.clone()
    }

    /// Waits for the clock on the runtime, never on the worker thread.
    async fn allocate(&self) -> Result<Identifier, AllocError> {
        let id = self.allocator.allocate_async().await?;
        metrics::record_id_allocated();
        Ok(id)
    }

    fn now(&self) -> i64 {
        self.clock.now_millis() as i64
    }

    /// Allocate an identifier and buffer a new record under it.
    ///
    /// Returns as soon as the buffer accepted the write.
    pub async fn submit(&self, payload: impl Into<Vec<u8>>) -> Result<Submitted, EngineError> {
        let id = self.allocate().await?;
        let record = Record::new(id, payload.into(), self.now());
        let ack = self.handle.submit(WriteOp::InsertRecord(record)).await?;
        Ok(Submitted { id, ack })
    }

    /// Insert a record and wait until it is durable.
    pub async fn insert(&self, payload: impl Into<Vec<u8>>) -> Result<Identifier, EngineError> {
        Ok(self.submit(payload).await?.durable().await?)
    }

    /// Enqueue a work item on the configured queue and wait until it is durable.
    pub async fn enqueue(&self, payload: impl Into<Vec<u8>>) -> Result<Identifier, EngineError> {
        let queue = self.config.queue.clone();
        self.enqueue_to(&queue, payload).await
    }

    pub async fn enqueue_to(
        &self,
        queue: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Identifier, EngineError> {
        let id = self.allocate().await?;
        let item = WorkItem::pending(id, queue, payload.into(), self.now());
        self.handle.write(WriteOp::Enqueue(item)).await?;
        Ok(id)
    }

    /// Flush buffered writes now.
    pub async fn flush(&self) -> Result<(), EngineError> {
        Ok(self.handle.flush().await?)
    }

    /// A poller on the configured queue.
    pub fn poller(&self, worker_id: impl Into<String>) -> QueuePoller {
        QueuePoller::new(
            Arc::clone(&self.store),
            worker_id,
            self.config.queue_config(),
            Arc::clone(&self.clock),
        )
    }

    pub fn poller_for(&self, queue: &str, worker_id: impl Into<String>) -> QueuePoller {
        QueuePoller::new(
            Arc::clone(&self.store),
            worker_id,
            self.config.queue_config_for(queue),
            Arc::clone(&self.clock),
        )
    }

    /// Start the configured number of workers on the configured queue.
    pub fn spawn_workers<H: Handler>(&self, handler: Arc<H>) -> WorkerCoordinator {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let queue_config = self.config.queue_config();
        WorkerCoordinator::spawn(
            move |worker_id| {
                QueuePoller::new(
                    Arc::clone(&store),
                    worker_id,
                    queue_config.clone(),
                    Arc::clone(&clock),
                )
            },
            handler,
            self.config.worker_config(),
        )
    }

    /// Flush everything accepted so far and stop the buffer.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        self.handle.shutdown().await?;
        drop(self.handle);
        self.buffer.join().await?;
        tracing::info!("Engine stopped");
        Ok(())
    }
}
