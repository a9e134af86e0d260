//! Spillway: a batched persistence engine for relational stores.
//!
//! Spillway combines three mechanisms that only make sense together:
//! application-side allocation of time-sortable IDs, a write buffer that
//! groups inserts into large atomic batches, and a skip-locked work queue
//! that lets many workers claim rows from one table without blocking each
//! other.
//!
//! # Architecture
//!
//! - **No round trips for IDs**: identifiers are stamped before persistence
//! - **Group commit**: one atomic statement set per batch, one ack per batch
//! - **Skip-locked claims**: select, lock and mark in a single store operation
//! - **Leases**: crashed workers are recovered by lease expiry, not by locks
//!
//! # Modules
//!
//! - [`config`]: CLI, environment and engine configuration
//! - [`daemon`]: Worker daemon lifecycle
//! - [`engine`]: Producer-facing facade (`submit`, `enqueue`)
//! - [`guard`]: Optimistic concurrency on versioned records
//! - [`id`]: Identifier layout, clocks and the allocator
//! - [`observability`]: Metrics and tracing setup
//! - [`queue`]: Skip-locked claim protocol
//! - [`storage`]: Store trait, SQLite and in-memory stores, batch buffer
//! - [`worker`]: Worker pool and per-worker state machine

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // queue::QueueConfig is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // id/ids/item are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod daemon;
pub mod engine;
pub mod guard;
pub mod id;
pub mod observability;
pub mod queue;
pub mod storage;
pub mod worker;

pub use engine::{Engine, EngineError, Submitted};
pub use guard::{GuardError, VersionConflict, VersionGuard};
pub use id::{Identifier, IdAllocator, NodeId};
pub use queue::{QueuePoller, QueueError};
pub use storage::{Record, Store, WorkItem, WorkStatus};
pub use worker::{Handler, HandlerError, WorkerCoordinator};

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
