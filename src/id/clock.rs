//! Wall-clock sources.
//!
//! The allocator and the queue lease arithmetic both read time through
//! [`Clock`], so tests can drive rollbacks and lease expiry without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A source of Unix wall-clock time in milliseconds.
///
/// Implementations may move backward (NTP corrections); the allocator
/// handles that according to its
/// [`ClockRollbackPolicy`](super::ClockRollbackPolicy).
pub trait Clock: Send + Sync {
    /// Current Unix time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// Clock handle shared by the allocator, the buffer and the pollers.
pub type SharedClock = Arc<dyn Clock>;

/// The operating system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        crate::now_millis().max(0) as u64
    }
}

/// A settable clock for tests and simulations.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_millis())
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move the clock backward, saturating at zero.
    pub fn rewind(&self, millis: u64) {
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
                Some(m.saturating_sub(millis))
            });
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
