//! Engine Facade
//!
//! The entry point for application code. An [`Engine`] resolves the calling
//! thread's measurement hierarchy, keeps the registries of wrapped probes and
//! sinks, owns the timed scalar sampler and controls shutdown.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use perftree::{Engine, EngineConfig};
//! use perftree::sink::LoggingDataSink;
//!
//! let engine = Engine::builder()
//!     .config(EngineConfig::default())
//!     .data_sink(Arc::new(LoggingDataSink::info_level()))
//!     .build()
//!     .unwrap();
//!
//! let users = engine.measure("load-users", |m| {
//!     m.add_parameter("tenant", "acme");
//!     vec!["alice", "bob"]
//! });
//! assert_eq!(users.len(), 2);
//! engine.shutdown();
//! ```

mod dispatcher;
pub mod global;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::config::{is_globally_disabled, EngineConfig};
use crate::data::{CorrelationId, EnvironmentData, HierarchicalDataRoot, ScalarDataPoint};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::Result;
use crate::measure::context;
use crate::measure::hierarchy::{HierarchyListener, MeasurementHierarchy, SharedHierarchy, Started};
use crate::measure::{CollectingMeasurement, FinishGuard, SimpleMeasurement};
use crate::probe::{
    EnvironmentCollector, EnvironmentProbe, Mementos, ScalarProbe, ScalarResults,
};
use crate::robust::{
    BreakerSettings, BreakerState, CollaboratorKind, RobustDataSink, RobustEnvironmentProbe,
    RobustScalarProbe,
};
use crate::sampler::{SamplerHandle, TimedScalarSampler};
use crate::sink::DataSink;
use crate::timer::{SystemTimer, Timer};

use dispatcher::Dispatcher;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Breaker state of one registered collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollaboratorStatus {
    pub kind: CollaboratorKind,
    pub name: String,
    pub state: BreakerState,
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    id: u64,
    config: EngineConfig,
    timer: Arc<dyn Timer>,
    diagnostics: Arc<Diagnostics>,
    probe_settings: BreakerSettings,
    sink_settings: BreakerSettings,

    scalar_probes: ArcSwap<Vec<Arc<RobustScalarProbe>>>,
    environment_probes: ArcSwap<Vec<Arc<RobustEnvironmentProbe>>>,
    dispatcher: Arc<Dispatcher>,

    sampler: Arc<TimedScalarSampler>,
    sampler_handle: Mutex<Option<SamplerHandle>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Build an engine with `config`, no collaborators, and a running sampler
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn is_inactive(&self) -> bool {
        is_globally_disabled() || self.is_shut_down()
    }

    fn report(&self, message: &str) {
        self.diagnostics.protocol_errors.inc();
        error!(engine = self.id, "{}", message);
    }

    // =========================================================================
    // Hierarchy Resolution
    // =========================================================================

    /// The calling thread's hierarchy, created on demand. A hierarchy that
    /// holds too many unfinished measurements is killed and replaced.
    fn hierarchy_for_start(&self) -> Rc<SharedHierarchy> {
        if let Some(existing) = context::current(self.id) {
            let (saturated, open) = {
                let state = existing.state();
                (state.is_saturated(), state.open_count())
            };
            if !saturated {
                return existing;
            }

            self.diagnostics.leak_guard_trips.inc();
            error!(
                engine = self.id,
                open,
                max = self.config.max_open_measurements,
                "too many unfinished measurements on this thread - \
                 assuming a leak and discarding them"
            );
            existing.kill();
        }

        let listener: Arc<dyn HierarchyListener + Send + Sync> = self.dispatcher.clone();
        let hierarchy = SharedHierarchy::new(
            self.id,
            listener,
            MeasurementHierarchy::new(
                self.timer.clone(),
                self.diagnostics.clone(),
                self.config.max_open_measurements,
            ),
        );
        context::install(hierarchy.clone());
        hierarchy
    }

    // =========================================================================
    // Measurements
    // =========================================================================

    /// Start a serial measurement
    pub fn start(&self, identifier: &str) -> SimpleMeasurement {
        self.start_measurement(identifier, true)
    }

    /// Start a parallel measurement. It must be started inside a running
    /// serial measurement; at top level it is rejected and returned detached.
    pub fn start_parallel(&self, identifier: &str) -> SimpleMeasurement {
        self.start_measurement(identifier, false)
    }

    pub fn start_measurement(&self, identifier: &str, is_serial: bool) -> SimpleMeasurement {
        if self.is_inactive() {
            return SimpleMeasurement::detached(identifier, is_serial);
        }

        let hierarchy = self.hierarchy_for_start();
        let started = hierarchy.state().start_simple(identifier, is_serial);
        match started {
            Started::Attached {
                measurement,
                is_root,
            } => {
                if is_root {
                    hierarchy.notify_started(identifier);
                }
                SimpleMeasurement::attached(measurement, hierarchy)
            }
            Started::Rejected => {
                hierarchy.release_if_empty();
                SimpleMeasurement::detached(identifier, is_serial)
            }
        }
    }

    /// Start a serial collecting measurement
    pub fn start_collecting(&self, identifier: &str) -> CollectingMeasurement {
        self.start_collecting_measurement(identifier, true)
    }

    /// Start a collecting measurement. At top level its data is discarded.
    pub fn start_collecting_measurement(
        &self,
        identifier: &str,
        is_serial: bool,
    ) -> CollectingMeasurement {
        if self.is_inactive() {
            return CollectingMeasurement::disabled(identifier, is_serial);
        }

        let hierarchy = self.hierarchy_for_start();
        let started = hierarchy.state().start_collecting(identifier, is_serial);
        match started {
            Started::Attached { measurement, .. } => {
                CollectingMeasurement::attached(measurement, hierarchy)
            }
            Started::Rejected => {
                hierarchy.release_if_empty();
                CollectingMeasurement::disabled(identifier, is_serial)
            }
        }
    }

    /// Run `body` inside a serial measurement. The measurement is finished on
    /// every exit path; the body's result, including an `Err`, is returned
    /// unchanged and a panic keeps unwinding.
    pub fn measure<R>(&self, identifier: &str, body: impl FnOnce(&SimpleMeasurement) -> R) -> R {
        let measurement = self.start(identifier);
        let _guard = FinishGuard(&measurement);
        body(&measurement)
    }

    /// Whether the calling thread runs a measurement tree of this engine
    pub fn has_running_measurement(&self) -> bool {
        match context::current(self.id) {
            Some(hierarchy) => {
                let running = hierarchy.state().has_running_measurement();
                running
            }
            None => false,
        }
    }

    // =========================================================================
    // Flows
    // =========================================================================

    /// Mark the running tree as the origin of an asynchronous continuation
    pub fn start_flow(&self, flow: CorrelationId) {
        if self.is_inactive() {
            return;
        }
        match context::current(self.id) {
            Some(hierarchy) => hierarchy.state().start_flow(flow),
            None => self.report(
                "flow handling only while a measurement is running - ignoring 'start_flow'",
            ),
        }
    }

    /// Mark the running tree as a continuation of `flow`
    pub fn join_flow(&self, flow: CorrelationId) {
        if self.is_inactive() {
            return;
        }
        match context::current(self.id) {
            Some(hierarchy) => hierarchy.state().join_flow(flow),
            None => self.report(
                "flow handling only while a measurement is running - ignoring 'join_flow'",
            ),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a probe for on-demand scalar measurements
    pub fn add_scalar_probe(&self, probe: Box<dyn ScalarProbe>) {
        let probe = Arc::new(RobustScalarProbe::new(probe, &self.probe_settings));
        info!(probe = %probe.name(), "Registered scalar probe");
        self.scalar_probes.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(probe.clone());
            next
        });
    }

    /// Register a probe sampled periodically by the background sampler
    pub fn add_timed_scalar_probe(&self, probe: Box<dyn ScalarProbe>) {
        let probe = Arc::new(RobustScalarProbe::new(probe, &self.probe_settings));
        info!(probe = %probe.name(), "Registered timed scalar probe");
        self.sampler.add_probe(probe);
    }

    pub fn add_environment_probe(&self, probe: Box<dyn EnvironmentProbe>) {
        let probe = Arc::new(RobustEnvironmentProbe::new(probe, &self.probe_settings));
        info!(probe = %probe.name(), "Registered environment probe");
        self.environment_probes.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(probe.clone());
            next
        });
    }

    pub fn add_data_sink(&self, sink: Arc<dyn DataSink>) {
        let sink = Arc::new(RobustDataSink::new(sink, &self.sink_settings));
        info!(sink = %sink.name(), "Registered data sink");
        self.dispatcher.add_sink(sink);
    }

    /// Breaker states of all registered collaborators
    pub fn collaborators(&self) -> Vec<CollaboratorStatus> {
        let mut result = Vec::new();
        for probe in self.scalar_probes.load().iter().chain(self.sampler.probes().iter()) {
            result.push(CollaboratorStatus {
                kind: CollaboratorKind::ScalarProbe,
                name: probe.name().to_string(),
                state: probe.state(),
            });
        }
        for probe in self.environment_probes.load().iter() {
            result.push(CollaboratorStatus {
                kind: CollaboratorKind::EnvironmentProbe,
                name: probe.name().to_string(),
                state: probe.state(),
            });
        }
        for sink in self.dispatcher.sinks().iter() {
            result.push(CollaboratorStatus {
                kind: CollaboratorKind::DataSink,
                name: sink.name().to_string(),
                state: sink.state(),
            });
        }
        result
    }

    // =========================================================================
    // Scalars and Environment
    // =========================================================================

    /// Sample all on-demand probes, averaging over the configured delay
    pub fn get_scalar_measurements(&self) -> BTreeMap<String, ScalarDataPoint> {
        self.get_scalar_measurements_with_delay(self.config.averaging_delay())
    }

    /// Call `prepare` on all probes, block for `delay`, then collect. The
    /// calling thread sleeps for the full delay.
    pub fn get_scalar_measurements_with_delay(
        &self,
        delay: Duration,
    ) -> BTreeMap<String, ScalarDataPoint> {
        if is_globally_disabled() {
            return BTreeMap::new();
        }

        let probes = self.scalar_probes.load_full();
        let mut mementos = Mementos::new();
        for probe in probes.iter() {
            probe.prepare(&mut mementos);
        }

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let timestamp_millis = Utc::now().timestamp_millis();
        let mut results = ScalarResults::new();
        for probe in probes.iter() {
            probe.contribute(&mut results, timestamp_millis, &mementos);
        }
        results
    }

    /// History of all periodically sampled metrics, oldest first
    pub fn timed_scalar_measurements(&self) -> BTreeMap<String, Vec<ScalarDataPoint>> {
        self.sampler.measurements()
    }

    /// Run one sampling cycle on the calling thread
    pub fn run_sampling_cycle(&self) {
        self.sampler.run_cycle();
    }

    pub fn environment_measurements(&self) -> Vec<EnvironmentData> {
        if is_globally_disabled() {
            return Vec::new();
        }
        let mut collector = EnvironmentCollector::new();
        for probe in self.environment_probes.load().iter() {
            probe.contribute(&mut collector);
        }
        collector.into_data()
    }

    // =========================================================================
    // Dispatch and Lifecycle
    // =========================================================================

    /// Hand an externally built tree to all sinks as if it had been measured
    pub fn inject_synthetic_measurement(&self, root: HierarchicalDataRoot) {
        if self.is_inactive() {
            return;
        }
        self.dispatcher.on_started(root.root_node().identifier());
        self.dispatcher.on_finished(root);
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Stop the sampler and shut down every probe and sink. Later calls are
    /// no-ops; measurements started afterwards are inert.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(engine = self.id, "Shutting down instrumentation engine");

        if let Some(mut handle) = self.sampler_handle.lock().take() {
            handle.stop();
        }
        self.sampler.shutdown_probes();
        for probe in self.scalar_probes.load().iter() {
            probe.shutdown();
        }
        for probe in self.environment_probes.load().iter() {
            probe.shutdown();
        }
        for sink in self.dispatcher.sinks().iter() {
            sink.shutdown();
        }

        info!(engine = self.id, "Instrumentation engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("scalar_probes", &self.scalar_probes.load().len())
            .field("environment_probes", &self.environment_probes.load().len())
            .field("data_sinks", &self.dispatcher.sinks().len())
            .field("sampler", &self.sampler)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct EngineBuilder {
    config: EngineConfig,
    timer: Option<Arc<dyn Timer>>,
    scalar_probes: Vec<Box<dyn ScalarProbe>>,
    timed_scalar_probes: Vec<Box<dyn ScalarProbe>>,
    environment_probes: Vec<Box<dyn EnvironmentProbe>>,
    data_sinks: Vec<Arc<dyn DataSink>>,
    sampler_thread: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            timer: None,
            scalar_probes: Vec::new(),
            timed_scalar_probes: Vec::new(),
            environment_probes: Vec::new(),
            data_sinks: Vec::new(),
            sampler_thread: true,
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for measurement and collaborator timing
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn scalar_probe(mut self, probe: impl ScalarProbe + 'static) -> Self {
        self.scalar_probes.push(Box::new(probe));
        self
    }

    pub fn timed_scalar_probe(mut self, probe: impl ScalarProbe + 'static) -> Self {
        self.timed_scalar_probes.push(Box::new(probe));
        self
    }

    pub fn environment_probe(mut self, probe: impl EnvironmentProbe + 'static) -> Self {
        self.environment_probes.push(Box::new(probe));
        self
    }

    pub fn data_sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.data_sinks.push(sink);
        self
    }

    /// Do not start the background sampler; cycles then only run through
    /// [`Engine::run_sampling_cycle`]
    pub fn without_sampler_thread(mut self) -> Self {
        self.sampler_thread = false;
        self
    }

    pub fn build(self) -> Result<Arc<Engine>> {
        self.config.validate()?;

        let timer = self.timer.unwrap_or_else(|| Arc::new(SystemTimer::new()));
        let diagnostics = Arc::new(Diagnostics::new());
        let probe_settings = BreakerSettings {
            timeout: self.config.measurement_timeout(),
            max_timeouts: self.config.max_num_measurement_timeouts,
            timer: timer.clone(),
            diagnostics: diagnostics.clone(),
        };
        let sink_settings = BreakerSettings {
            timeout: self.config.data_sink_timeout(),
            max_timeouts: self.config.max_num_data_sink_timeouts,
            timer: timer.clone(),
            diagnostics: diagnostics.clone(),
        };

        let engine = Arc::new(Engine {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            sampler: Arc::new(TimedScalarSampler::new(self.config.max_history_per_metric)),
            config: self.config,
            timer,
            dispatcher: Arc::new(Dispatcher::new(diagnostics.clone())),
            diagnostics,
            probe_settings,
            sink_settings,
            scalar_probes: ArcSwap::from_pointee(Vec::new()),
            environment_probes: ArcSwap::from_pointee(Vec::new()),
            sampler_handle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        for probe in self.scalar_probes {
            engine.add_scalar_probe(probe);
        }
        for probe in self.timed_scalar_probes {
            engine.add_timed_scalar_probe(probe);
        }
        for probe in self.environment_probes {
            engine.add_environment_probe(probe);
        }
        for sink in self.data_sinks {
            engine.add_data_sink(sink);
        }

        if self.sampler_thread {
            let handle = engine.sampler.start(engine.config.sampling_period())?;
            *engine.sampler_handle.lock() = Some(handle);
        }

        info!(engine = engine.id, "Instrumentation engine started");
        Ok(engine)
    }
}
