//! Robust collaborator wrappers
//!
//! Every probe and sink registered with the engine is wrapped in one of the
//! types below. Each wrapper owns a [`Breaker`] configured with the timeout of
//! its collaborator kind; a collaborator that fails or panics is disabled for
//! the lifetime of the engine, one that is repeatedly slow is disabled after
//! the configured number of timeouts.

mod breaker;

use std::sync::Arc;
use std::time::Duration;

use crate::data::HierarchicalDataRoot;
use crate::diagnostics::Diagnostics;
use crate::probe::{EnvironmentCollector, EnvironmentProbe, Mementos, ScalarProbe, ScalarResults};
use crate::sink::DataSink;
use crate::timer::Timer;

pub use breaker::{Breaker, BreakerState, CallOutcome, CollaboratorKind};

/// Breaker settings of one collaborator kind
#[derive(Clone)]
pub struct BreakerSettings {
    pub timeout: Duration,
    pub max_timeouts: u32,
    pub timer: Arc<dyn Timer>,
    pub diagnostics: Arc<Diagnostics>,
}

impl BreakerSettings {
    fn breaker(&self, kind: CollaboratorKind, name: &str, timeout: Option<Duration>) -> Breaker {
        Breaker::new(
            kind,
            name,
            timeout.unwrap_or(self.timeout),
            self.max_timeouts,
            self.timer.clone(),
            self.diagnostics.clone(),
        )
    }
}

// =============================================================================
// Scalar Probe
// =============================================================================

pub struct RobustScalarProbe {
    inner: Box<dyn ScalarProbe>,
    breaker: Breaker,
}

impl RobustScalarProbe {
    pub fn new(inner: Box<dyn ScalarProbe>, settings: &BreakerSettings) -> Self {
        let breaker =
            settings.breaker(CollaboratorKind::ScalarProbe, inner.name(), inner.timeout());
        Self { inner, breaker }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn prepare(&self, mementos: &mut Mementos) -> CallOutcome {
        self.breaker.call_untimed(|| self.inner.prepare(mementos))
    }

    /// Values contributed by a call that fails are discarded
    pub fn contribute(
        &self,
        results: &mut ScalarResults,
        timestamp_millis: i64,
        mementos: &Mementos,
    ) -> CallOutcome {
        let mut own = ScalarResults::new();
        let outcome = self
            .breaker
            .call(|| self.inner.contribute(&mut own, timestamp_millis, mementos));
        if outcome == CallOutcome::Completed {
            results.extend(own);
        }
        outcome
    }

    pub fn shutdown(&self) -> CallOutcome {
        self.breaker.call_untimed(|| self.inner.shutdown())
    }
}

impl std::fmt::Debug for RobustScalarProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustScalarProbe")
            .field("breaker", &self.breaker)
            .finish()
    }
}

// =============================================================================
// Environment Probe
// =============================================================================

pub struct RobustEnvironmentProbe {
    inner: Box<dyn EnvironmentProbe>,
    breaker: Breaker,
}

impl RobustEnvironmentProbe {
    pub fn new(inner: Box<dyn EnvironmentProbe>, settings: &BreakerSettings) -> Self {
        let breaker = settings.breaker(
            CollaboratorKind::EnvironmentProbe,
            inner.name(),
            inner.timeout(),
        );
        Self { inner, breaker }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn contribute(&self, collector: &mut EnvironmentCollector) -> CallOutcome {
        let mut own = EnvironmentCollector::new();
        let outcome = self.breaker.call(|| self.inner.contribute(&mut own));
        if outcome == CallOutcome::Completed {
            collector.extend(own);
        }
        outcome
    }

    pub fn shutdown(&self) -> CallOutcome {
        self.breaker.call_untimed(|| self.inner.shutdown())
    }
}

impl std::fmt::Debug for RobustEnvironmentProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustEnvironmentProbe")
            .field("breaker", &self.breaker)
            .finish()
    }
}

// =============================================================================
// Data Sink
// =============================================================================

pub struct RobustDataSink {
    inner: Arc<dyn DataSink>,
    breaker: Breaker,
}

impl RobustDataSink {
    pub fn new(inner: Arc<dyn DataSink>, settings: &BreakerSettings) -> Self {
        let breaker = settings.breaker(CollaboratorKind::DataSink, inner.name(), None);
        Self { inner, breaker }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn on_started(&self, identifier: &str) -> CallOutcome {
        self.breaker.call(|| self.inner.on_started(identifier))
    }

    pub fn on_finished(&self, root: &HierarchicalDataRoot) -> CallOutcome {
        self.breaker.call(|| self.inner.on_finished(root))
    }

    pub fn shutdown(&self) -> CallOutcome {
        self.breaker.call_untimed(|| self.inner.shutdown())
    }
}

impl std::fmt::Debug for RobustDataSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustDataSink")
            .field("breaker", &self.breaker)
            .finish()
    }
}
