//! Data sinks
//!
//! Consumers of finished measurement trees. Sinks are called synchronously on
//! the thread that finished the outermost measurement, through a robust
//! wrapper. A slow sink adds latency to that thread; a failing one is disabled.

mod logging;
mod memory;
mod prometheus;
mod running;

use crate::data::HierarchicalDataRoot;
use crate::error::Result;

pub use logging::LoggingDataSink;
pub use memory::InMemoryDataSink;
pub use self::prometheus::PrometheusDataSink;
pub use running::{RunningMeasurement, RunningMeasurementsSink};

/// Receives the lifecycle of measurement trees
pub trait DataSink: Send + Sync {
    /// Name used in logs and breaker reports
    fn name(&self) -> &str;

    /// The outermost measurement of a tree was started on the calling thread
    fn on_started(&self, _identifier: &str) -> Result<()> {
        Ok(())
    }

    /// A tree was finished (or killed by the leak guard)
    fn on_finished(&self, root: &HierarchicalDataRoot) -> Result<()>;

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
