//! Monotonic clock abstraction
//!
//! Measurements read nanoseconds from a [`Timer`] so that durations can be made
//! deterministic in tests. Values only have meaning as differences.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic nanoseconds
pub trait Timer: Send + Sync {
    /// Current value of the clock in nanoseconds
    fn current_nanos(&self) -> u64;
}

/// Timer backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemTimer {
    origin: Instant,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for SystemTimer {
    fn current_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Timer that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTimer {
    nanos: AtomicU64,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Timer for ManualTimer {
    fn current_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
