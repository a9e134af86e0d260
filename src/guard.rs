//! Optimistic concurrency on versioned records.
//!
//! A guarded update carries the version the caller last read. The store
//! applies it with a single conditional statement and bumps the version by
//! one; if the version moved, nothing is written and the caller gets a
//! [`VersionConflict`] to resolve. Nothing here retries on its own except
//! [`VersionGuard::update_with_reload`], which the caller opts into.

use std::sync::Arc;
use thiserror::Error;

use crate::id::{Identifier, SharedClock};
use crate::observability::metrics;
use crate::storage::{run_blocking, Mutation, Record, Store, StoreError};

/// A guarded update found a different version than expected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("version conflict on {id}: expected version {expected}, found {actual:?}")]
pub struct VersionConflict {
    pub id: Identifier,
    pub expected: u64,
    /// Version read back after the conflict; `None` if the record is gone.
    pub actual: Option<u64>,
}

/// Error type for guarded updates.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Conflict(#[from] VersionConflict),

    #[error("record {0} not found")]
    NotFound(Identifier),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Applies version-checked updates to records.
#[derive(Clone)]
pub struct VersionGuard {
    store: Arc<dyn Store>,
    clock: SharedClock,
}

impl VersionGuard {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Apply `mutation` iff the record is still at `expected_version`.
    ///
    /// Returns the updated record at `expected_version + 1`.
    pub async fn check_and_apply(
        &self,
        id: Identifier,
        expected_version: u64,
        mutation: Mutation,
    ) -> Result<Record, GuardError> {
        let now = self.clock.now_millis() as i64;
        let (updated, current) = run_blocking(&self.store, move |store| {
            match store.update_versioned(id, expected_version, &mutation, now)? {
                Some(record) => Ok((Some(record), None)),
                // Diagnostic re-read; the update itself is already decided.
                None => Ok((None, store.get_record(id)?)),
            }
        })
        .await?;

        if let Some(record) = updated {
            tracing::trace!(%id, version = record.version, "Guarded update applied");
            return Ok(record);
        }

        let conflict = VersionConflict {
            id,
            expected: expected_version,
            actual: current.map(|r| r.version),
        };
        metrics::record_version_conflict();
        tracing::debug!(%id, expected = expected_version, actual = ?conflict.actual, "Version conflict");
        Err(conflict.into())
    }

    /// Load, compute, apply; on conflict reload and try again.
    ///
    /// `compute` sees the current record each time. After `max_attempts`
    /// conflicts the last [`VersionConflict`] is returned.
    pub async fn update_with_reload<F>(
        &self,
        id: Identifier,
        max_attempts: u32,
        mut compute: F,
    ) -> Result<Record, GuardError>
    where
        F: FnMut(&Record) -> Mutation,
    {
        let mut last_conflict = None;
        for attempt in 1..=max_attempts.max(1) {
            let current = run_blocking(&self.store, move |store| store.get_record(id))
                .await?
                .ok_or(GuardError::NotFound(id))?;

            let mutation = compute(&current);
            match self.check_and_apply(id, current.version, mutation).await {
                Err(GuardError::Conflict(conflict)) => {
                    tracing::debug!(%id, attempt, "Reloading after conflict");
                    last_conflict = Some(conflict);
                }
                other => return other,
            }
        }
        Err(last_conflict.map_or(GuardError::NotFound(id), GuardError::Conflict))
    }

    pub async fn get(&self, id: Identifier) -> Result<Option<Record>, GuardError> {
        Ok(run_blocking(&self.store, move |store| store.get_record(id)).await?)
    }
}
