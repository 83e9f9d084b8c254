//! perftree - In-Process Performance Instrumentation
//!
//! Application code marks the start and end of units of work; the engine
//! assembles them into a timing tree per thread, samples system metrics in the
//! background and hands finished trees to pluggable sinks. Misbehaving probes
//! and sinks are isolated and disabled instead of affecting the application.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  start / measure ──▶ thread-local MeasurementHierarchy             │
//! │                            │ root finished                         │
//! │                            ▼                                       │
//! │                       Dispatcher ──▶ RobustDataSink ──▶ DataSink   │
//! │                                                                    │
//! │  TimedScalarSampler (thread) ──▶ RobustScalarProbe ──▶ ScalarProbe │
//! │        │                                                           │
//! │        ▼                                                           │
//! │  RingBuffer per metric                                             │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Engine configuration and the global kill switch
//! - [`data`] - Immutable snapshot types delivered to sinks
//! - [`diagnostics`] - Counters of reported misuse and disabled collaborators
//! - [`dump`] - Periodic logging of scalar measurements
//! - [`engine`] - The engine facade and the optional global instance
//! - [`error`] - Error types
//! - [`measure`] - Measurement handles and the per-thread hierarchy
//! - [`probe`] - Scalar and environment probes
//! - [`robust`] - Fault-isolating wrappers around probes and sinks
//! - [`sampler`] - Periodic scalar sampling with bounded history
//! - [`sink`] - Consumers of finished trees
//! - [`timer`] - Injectable monotonic clock

pub mod config;
pub mod data;
pub mod diagnostics;
pub mod dump;
pub mod engine;
pub mod error;
pub mod measure;
pub mod probe;
pub mod robust;
pub mod sampler;
pub mod sink;
pub mod timer;

// Re-export commonly used types
pub use config::EngineConfig;
pub use data::{
    CorrelationId, EnvironmentData, HierarchicalData, HierarchicalDataRoot, RingBuffer,
    ScalarDataPoint,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use measure::{CollectingMeasurement, SimpleMeasurement};
pub use timer::{ManualTimer, SystemTimer, Timer};
