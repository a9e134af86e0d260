//! Lock-free identifier allocation.
//!
//! The allocator keeps `(last_timestamp, counter)` packed in one `AtomicU64`
//! and advances it with compare-and-swap, so `allocate` never takes a lock
//! and never touches the store.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::SharedClock;
use super::{Identifier, NodeId, COUNTER_BITS, MAX_COUNTER, MAX_TIMESTAMP, SPILLWAY_EPOCH};

/// Wait steps before falling back to sleeping.
const SPIN_LIMIT: u32 = 64;

/// Error type for identifier allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("clock moved backward: last issued at {last_ms} ms, clock reads {now_ms} ms")]
    ClockRollback { last_ms: u64, now_ms: u64 },

    #[error("counter exhausted and clock did not advance within {waited_ms} ms")]
    ClockStalled { waited_ms: u64 },

    #[error("timestamp no longer fits in the identifier layout")]
    EpochExhausted,

    #[error("node id {0} out of range (max 1023)")]
    InvalidNode(u16),
}

/// What the allocator does when the wall clock reads earlier than the last
/// timestamp it issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ClockRollbackPolicy {
    /// Wait for the clock to catch up. A rollback larger than `max_wait`
    /// fails immediately with [`AllocError::ClockRollback`].
    Block {
        #[serde(with = "crate::config::duration_ms")]
        max_wait: Duration,
    },
    /// Keep issuing from the last timestamp, stepping it forward one
    /// millisecond whenever its counter runs out. Never fails on rollback;
    /// embedded timestamps run ahead of the wall clock until it catches up.
    Extend,
}

impl Default for ClockRollbackPolicy {
    fn default() -> Self {
        Self::Block {
            max_wait: Duration::from_secs(1),
        }
    }
}

/// Allocator tuning.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub rollback: ClockRollbackPolicy,
    /// Upper bound on the wait for the next millisecond after the counter
    /// overflows.
    pub max_stall: Duration,
    /// Start each millisecond's counter at a random value below
    /// [`RANDOM_COUNTER_SPAN`] instead of zero.
    ///
    /// Set this whenever the node tag is not coordinated: two allocators that
    /// drew the same random tag then collide only if they also drew the same
    /// counter start.
    pub random_counter_start: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            rollback: ClockRollbackPolicy::default(),
            max_stall: Duration::from_secs(1),
            random_counter_start: false,
        }
    }
}

/// Exclusive bound on a random counter start. The upper half of the counter
/// range stays free, so every millisecond still holds at least this many ids.
pub const RANDOM_COUNTER_SPAN: u64 = (MAX_COUNTER + 1) / 2;

/// Allocates unique, time-ordered identifiers without a database round trip.
///
/// Safe to share across threads. For a single instance, an `allocate` that
/// returns before another begins always yields the smaller identifier.
pub struct IdAllocator {
    state: AtomicU64,
    node: NodeId,
    clock: SharedClock,
    config: AllocatorConfig,
    rollbacks: AtomicU64,
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (last_timestamp, counter) = unpack(self.state.load(Ordering::Relaxed));
        f.debug_struct("IdAllocator")
            .field("node", &self.node)
            .field("last_timestamp", &last_timestamp)
            .field("counter", &counter)
            .field("config", &self.config)
            .finish()
    }
}

impl IdAllocator {
    pub fn new(node: NodeId, clock: SharedClock) -> Self {
        Self::with_config(node, clock, AllocatorConfig::default())
    }

    pub fn with_config(node: NodeId, clock: SharedClock, config: AllocatorConfig) -> Self {
        Self {
            state: AtomicU64::new(0),
            node,
            clock,
            config,
            rollbacks: AtomicU64::new(0),
        }
    }

    /// An allocator for an uncoordinated process: random node tag and random
    /// counter starts.
    pub fn uncoordinated(clock: SharedClock, config: AllocatorConfig) -> Self {
        Self::with_config(
            NodeId::random(),
            clock,
            AllocatorConfig {
                random_counter_start: true,
                ..config
            },
        )
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Allocations that found the clock behind the last issued timestamp.
    pub fn rollbacks_observed(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Allocate the next identifier, blocking the calling thread while the
    /// clock catches up.
    ///
    /// Fails only when the clock rolls back further than the configured
    /// policy tolerates, or stops advancing altogether. Async callers use
    /// [`IdAllocator::allocate_async`].
    pub fn allocate(&self) -> Result<Identifier, AllocError> {
        let mut wait = Wait::default();
        loop {
            if let Some(id) = self.try_allocate(&mut wait)? {
                return Ok(id);
            }
            wait.step_blocking();
        }
    }

    /// Allocate the next identifier, yielding to the runtime instead of
    /// blocking while the clock catches up.
    pub async fn allocate_async(&self) -> Result<Identifier, AllocError> {
        let mut wait = Wait::default();
        loop {
            if let Some(id) = self.try_allocate(&mut wait)? {
                return Ok(id);
            }
            wait.step_async().await;
        }
    }

    /// One allocation attempt. `Ok(None)` means the caller has to wait for
    /// the clock and try again.
    fn try_allocate(&self, wait: &mut Wait) -> Result<Option<Identifier>, AllocError> {
        loop {
            let now = self.epoch_millis()?;
            let current = self.state.load(Ordering::Acquire);
            let (last, counter) = unpack(current);

            let next = match now.cmp(&last) {
                cmp::Ordering::Greater => pack(now, self.counter_start()),
                cmp::Ordering::Equal => {
                    if counter < MAX_COUNTER {
                        pack(last, counter + 1)
                    } else {
                        let waited = wait.waited();
                        if waited > self.config.max_stall {
                            tracing::error!(
                                node = %self.node,
                                waited_ms = waited.as_millis() as u64,
                                "Clock stalled with counter exhausted"
                            );
                            return Err(AllocError::ClockStalled {
                                waited_ms: waited.as_millis() as u64,
                            });
                        }
                        return Ok(None);
                    }
                }
                cmp::Ordering::Less => {
                    self.note_rollback(wait, last, now);
                    match self.config.rollback {
                        ClockRollbackPolicy::Extend => {
                            if counter < MAX_COUNTER {
                                pack(last, counter + 1)
                            } else if last < MAX_TIMESTAMP {
                                pack(last + 1, self.counter_start())
                            } else {
                                return Err(AllocError::EpochExhausted);
                            }
                        }
                        ClockRollbackPolicy::Block { max_wait } => {
                            let behind = Duration::from_millis(last - now);
                            if behind > max_wait || wait.waited() > max_wait {
                                let err = AllocError::ClockRollback {
                                    last_ms: last + SPILLWAY_EPOCH,
                                    now_ms: now + SPILLWAY_EPOCH,
                                };
                                tracing::warn!(node = %self.node, error = %err, "Refusing to allocate");
                                return Err(err);
                            }
                            return Ok(None);
                        }
                    }
                }
            };

            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let (timestamp, counter) = unpack(next);
                return Ok(Some(Identifier::from_parts(timestamp, self.node, counter)));
            }
            // Another thread won the race; retry with fresh state.
        }
    }

    /// Counted once per allocation, however long it then waits.
    fn note_rollback(&self, wait: &mut Wait, last: u64, now: u64) {
        if wait.rollback_noted {
            return;
        }
        wait.rollback_noted = true;
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        crate::observability::metrics::record_clock_rollback(self.policy_label());
        tracing::debug!(node = %self.node, behind_ms = last - now, "Clock behind last issued timestamp");
    }

    fn policy_label(&self) -> &'static str {
        match self.config.rollback {
            ClockRollbackPolicy::Block { .. } => "block",
            ClockRollbackPolicy::Extend => "extend",
        }
    }

    fn counter_start(&self) -> u64 {
        if self.config.random_counter_start {
            rand::random_range(0..RANDOM_COUNTER_SPAN)
        } else {
            0
        }
    }

    fn epoch_millis(&self) -> Result<u64, AllocError> {
        let millis = self.clock.now_millis().saturating_sub(SPILLWAY_EPOCH);
        if millis > MAX_TIMESTAMP {
            return Err(AllocError::EpochExhausted);
        }
        Ok(millis)
    }
}

const fn pack(timestamp: u64, counter: u64) -> u64 {
    (timestamp << COUNTER_BITS) | counter
}

const fn unpack(state: u64) -> (u64, u64) {
    (state >> COUNTER_BITS, state & MAX_COUNTER)
}

/// Progress of one allocation that has to wait for the clock.
#[derive(Debug, Default)]
struct Wait {
    since: Option<Instant>,
    spins: u32,
    rollback_noted: bool,
}

impl Wait {
    fn waited(&self) -> Duration {
        self.since.map_or(Duration::ZERO, |since| since.elapsed())
    }

    fn step_blocking(&mut self) {
        self.since.get_or_insert_with(Instant::now);
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.spins < SPIN_LIMIT * 2 {
            self.spins += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    async fn step_async(&mut self) {
        self.since.get_or_insert_with(Instant::now);
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
