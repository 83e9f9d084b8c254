//! Fault-isolating breaker shared by all collaborator wrappers
//!
//! # State Machine
//!
//! ```text
//!            slow call                  slow call, count < max
//! Enabled ─────────────▶ TimedOut ───────────────────────────▶ Enabled
//!    ▲                      │
//!    └──── fast call ───────┤ slow call, count ≥ max
//!                           ▼
//!  any state ── error / panic ──▶ Disabled (terminal)
//! ```
//!
//! Timeouts are detected after the call returns. A collaborator that never
//! returns blocks its caller; the breaker cannot preempt it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::timer::Timer;

/// The kind of collaborator a breaker protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    ScalarProbe,
    EnvironmentProbe,
    DataSink,
}

impl std::fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaboratorKind::ScalarProbe => write!(f, "scalar probe"),
            CollaboratorKind::EnvironmentProbe => write!(f, "environment probe"),
            CollaboratorKind::DataSink => write!(f, "data sink"),
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through
    Enabled,
    /// The last call was slow; calls still pass through
    TimedOut,
    /// Permanently off
    Disabled,
}

impl BreakerState {
    fn to_u8(self) -> u8 {
        match self {
            BreakerState::Enabled => 0,
            BreakerState::TimedOut => 1,
            BreakerState::Disabled => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BreakerState::Enabled,
            1 => BreakerState::TimedOut,
            _ => BreakerState::Disabled,
        }
    }
}

/// Outcome of one [`Breaker::call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The collaborator was invoked and returned `Ok`
    Completed,
    /// The collaborator was invoked and failed; it is now disabled
    Failed,
    /// The breaker is disabled; the collaborator was not invoked
    Skipped,
}

pub struct Breaker {
    kind: CollaboratorKind,
    name: String,
    timeout_nanos: u64,
    max_timeouts: u32,
    timer: Arc<dyn Timer>,
    diagnostics: Arc<Diagnostics>,
    state: AtomicU8,
    num_timeouts: AtomicU32,
}

impl Breaker {
    pub fn new(
        kind: CollaboratorKind,
        name: impl Into<String>,
        timeout: Duration,
        max_timeouts: u32,
        timer: Arc<dyn Timer>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            timeout_nanos: timeout.as_nanos() as u64,
            max_timeouts,
            timer,
            diagnostics,
            state: AtomicU8::new(BreakerState::Enabled.to_u8()),
            num_timeouts: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CollaboratorKind {
        self.kind
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn num_timeouts(&self) -> u32 {
        self.num_timeouts.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_nanos)
    }

    /// Invoke `f` unless disabled, timing it and absorbing errors and panics
    pub fn call<F>(&self, f: F) -> CallOutcome
    where
        F: FnOnce() -> Result<()>,
    {
        self.invoke(f, true)
    }

    /// Like [`Breaker::call`], but the duration of `f` does not count
    /// towards timeouts. Used for `prepare` and `shutdown`.
    pub fn call_untimed<F>(&self, f: F) -> CallOutcome
    where
        F: FnOnce() -> Result<()>,
    {
        self.invoke(f, false)
    }

    fn invoke<F>(&self, f: F, timed: bool) -> CallOutcome
    where
        F: FnOnce() -> Result<()>,
    {
        let state = self.state();
        if state == BreakerState::Disabled {
            return CallOutcome::Skipped;
        }

        let start = self.timer.current_nanos();
        let result = catch_unwind(AssertUnwindSafe(f));
        let duration = self.timer.current_nanos().saturating_sub(start);

        match result {
            Ok(Ok(())) => {
                if timed {
                    self.handle_duration(state, duration);
                }
                CallOutcome::Completed
            }
            Ok(Err(e)) => {
                warn!(
                    kind = %self.kind,
                    name = %self.name,
                    error = %e,
                    "disabling {} because an error occurred", self.kind
                );
                self.disable();
                CallOutcome::Failed
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(
                    kind = %self.kind,
                    name = %self.name,
                    panic = %reason,
                    "disabling {} because it panicked", self.kind
                );
                self.disable();
                CallOutcome::Failed
            }
        }
    }

    fn handle_duration(&self, state: BreakerState, duration_nanos: u64) {
        if duration_nanos <= self.timeout_nanos {
            if state == BreakerState::TimedOut {
                self.transition(BreakerState::TimedOut, BreakerState::Enabled);
            }
            return;
        }

        let count = self.num_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        match state {
            BreakerState::Enabled => {
                if self.transition(BreakerState::Enabled, BreakerState::TimedOut) {
                    warn!(
                        kind = %self.kind,
                        name = %self.name,
                        duration_nanos,
                        "{} timed out", self.kind
                    );
                }
            }
            BreakerState::TimedOut if count >= self.max_timeouts => {
                warn!(
                    kind = %self.kind,
                    name = %self.name,
                    timeouts = count,
                    "{} timed out {} times - permanently disabling", self.kind, count
                );
                self.disable();
            }
            BreakerState::TimedOut => {
                self.transition(BreakerState::TimedOut, BreakerState::Enabled);
            }
            BreakerState::Disabled => {}
        }
    }

    /// Move from `from` to `to` unless another call changed the state since
    /// it was observed. Disabled is never left.
    fn transition(&self, from: BreakerState, to: BreakerState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn disable(&self) {
        let previous = self.state.swap(BreakerState::Disabled.to_u8(), Ordering::AcqRel);
        if BreakerState::from_u8(previous) != BreakerState::Disabled {
            self.diagnostics.collaborators_disabled.inc();
        }
    }
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breaker")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("timeout_nanos", &self.timeout_nanos)
            .field("max_timeouts", &self.max_timeouts)
            .field("state", &self.state())
            .field("num_timeouts", &self.num_timeouts())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
