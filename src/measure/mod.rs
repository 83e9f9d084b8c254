//! Measurements
//!
//! Handles returned to application code ([`SimpleMeasurement`],
//! [`CollectingMeasurement`]) and the per-thread [`hierarchy`] that turns them
//! into finished trees.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  thread-local: engine id → SharedHierarchy                   │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ MeasurementHierarchy                                   │  │
//! │  │   stack: [root(serial), child(serial), ...]            │  │
//! │  │   open:  every unfinished measurement                  │  │
//! │  │   flows: started / joined correlation ids              │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        │ root finished                                       │
//! │        ▼                                                     │
//! │  HierarchicalDataRoot ──▶ HierarchyListener (dispatcher)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod active;
mod collecting;
pub(crate) mod context;
pub(crate) mod hierarchy;
mod simple;

pub use active::Detail;
pub use collecting::CollectingMeasurement;
pub use simple::SimpleMeasurement;

pub(crate) use simple::FinishGuard;
