//! Worker daemon lifecycle.
//!
//! Opens the SQLite store, starts an engine and a worker pool on one queue,
//! and runs until the shutdown signal fires. Shutdown stops the workers
//! first (in-flight items are committed), then drains the write buffer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::Config;
use crate::engine::Engine;
use crate::storage::{SqliteStore, Store, WorkItem};
use crate::worker::{Handler, HandlerError};

/// How often the daemon logs queue depth.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Handler that logs every item it sees and acknowledges it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl Handler for LoggingHandler {
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
        let preview: String = String::from_utf8_lossy(&item.payload)
            .chars()
            .take(64)
            .collect();
        tracing::info!(
            id = %item.id,
            queue = %item.queue,
            attempts = item.attempts,
            bytes = item.payload.len(),
            payload = %preview,
            "Processed work item"
        );
        Ok(())
    }
}

/// Run the daemon until `shutdown_rx` flips to `true`.
pub async fn run_daemon(
    config: Config,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let engine_config = config.engine_config();
    engine_config.validate()?;

    let db_path = config.db_path();
    let sqlite = Arc::new(SqliteStore::open(&db_path, config.pool_size)?);
    let store: Arc<dyn Store> = sqlite.clone();
    tracing::info!(path = %db_path.display(), "Store opened");

    let engine = Engine::open(engine_config, Arc::clone(&store))?;
    let workers = engine.spawn_workers(Arc::new(LoggingHandler));

    let queue = engine.config().queue.clone();
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let poller = engine.poller("daemon-status");
                let pool = sqlite.pool_state();
                match poller.stats().await {
                    Ok(counts) => tracing::info!(
                        queue = %queue,
                        pending = counts.pending,
                        claimed = counts.claimed,
                        done = counts.done,
                        failed = counts.failed,
                        workers = ?workers.stats(),
                        pool_connections = pool.connections,
                        pool_idle = pool.idle_connections,
                        "Queue status"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Failed to read queue status"),
                }
            }
        }
    }

    tracing::info!("Shutdown signal received, stopping workers");
    let stats = workers.shutdown().await;
    tracing::info!(
        processed = stats.processed,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        "Workers stopped"
    );

    engine.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Identifier;
    use crate::storage::DEFAULT_QUEUE;

    #[tokio::test]
    async fn test_logging_handler_accepts_binary_payloads() {
        let item = WorkItem::pending(Identifier::from_raw(1), DEFAULT_QUEUE, vec![0xff, 0x00, 0x41], 0);
        assert!(LoggingHandler.handle(&item).await.is_ok());
    }
}
