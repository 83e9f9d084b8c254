//! Self-diagnostics
//!
//! Lock-free counters the engine bumps whenever it reports a problem through
//! the log, so misuse can be observed without scraping log output.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters describing how the engine and its collaborators behave
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Instrumentation misuse that was reported and ignored
    pub protocol_errors: Counter,
    /// Hierarchies discarded because too many measurements were left open
    pub leak_guard_trips: Counter,
    /// Trees handed to the sinks
    pub roots_dispatched: Counter,
    /// Collaborators that were permanently disabled
    pub collaborators_disabled: Counter,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            protocol_errors: self.protocol_errors.get(),
            leak_guard_trips: self.leak_guard_trips.get(),
            roots_dispatched: self.roots_dispatched.get(),
            collaborators_disabled: self.collaborators_disabled.get(),
        }
    }
}

/// Point-in-time copy of [`Diagnostics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub protocol_errors: u64,
    pub leak_guard_trips: u64,
    pub roots_dispatched: u64,
    pub collaborators_disabled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_snapshot() {
        let diagnostics = Diagnostics::new();
        diagnostics.protocol_errors.inc();
        diagnostics.leak_guard_trips.inc();

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.leak_guard_trips, 1);
        assert_eq!(snapshot.roots_dispatched, 0);
    }
}
