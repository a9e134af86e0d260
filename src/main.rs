//! Spillway daemon: drains a work queue from a SQLite database.
//!
//! # Usage
//!
//! ```bash
//! spillway --data-dir ./data --queue default --workers 4
//! ```
//!
//! Environment variables can also be used:
//! - `SPILLWAY_DATA_DIR`: Data directory for SQLite
//! - `SPILLWAY_QUEUE`: Queue to drain
//! - `SPILLWAY_WORKERS`: Number of worker tasks
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use spillway::config::Config;
use spillway::daemon::run_daemon;
use spillway::observability::metrics::init_metrics_with_endpoint;
use spillway::observability::tracing::init_tracing;
use std::fs;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
   ___      _ _ _
  / __|_ __(_) | |_ __ ____ _ _  _
  \__ \ '_ \ | | \ V  V / _` | || |
  |___/ .__/_|_|_|\_/\_/\__,_|\_, |
      |_|                     |__/

  Spillway v{}

  Configuration:
    Database:   {}
    Queue:      {}
    Workers:    {}
    Batch:      {} writes / {} ms
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.db_path().display(),
        config.queue,
        config.workers,
        config.batch_size,
        config.batch_delay_ms,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse_args();

    init_tracing("spillway", &config.log_level, config.log_json);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    fs::create_dir_all(&config.data_dir)?;
    print_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating shutdown...");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                    let _ = ctrl_c.await;
                    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }

        let _ = shutdown_tx.send(true);
    });

    run_daemon(config, shutdown_rx).await?;

    tracing::info!("Spillway shutdown complete");
    Ok(())
}
