//! Probes
//!
//! Pluggable sources of scalar metrics and environment facts. Probes are
//! always called through a robust wrapper, so a failing or slow probe is
//! disabled instead of disturbing the engine.
//!
//! # Scalar probe protocol
//!
//! ```text
//! prepare(mementos)  ──  delay  ──▶  contribute(results, timestamp, mementos)
//! ```
//!
//! `prepare` stores whatever the probe needs to compute a rate (a counter
//! snapshot) in the shared memento map under its own key; `contribute` reads
//! it back and writes one [`ScalarDataPoint`] per metric. Probes must tolerate
//! a missing memento and skip their rate metrics in that case.

mod diskstats;
mod env_var;
mod load;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::data::{EnvironmentData, ScalarDataPoint};
use crate::error::Result;

pub use diskstats::{parse_diskstats, DiskStatsProbe, DiskStatsSnapshot};
pub use env_var::EnvVarProbe;
pub use load::{parse_loadavg, SystemLoadProbe};

/// Per-cycle scratch space shared by all scalar probes
pub type Mementos = HashMap<String, Box<dyn Any + Send>>;

/// Sampled values of one cycle, by metric name
pub type ScalarResults = BTreeMap<String, ScalarDataPoint>;

/// A source of time-series values
pub trait ScalarProbe: Send + Sync {
    /// Name used in logs and breaker reports
    fn name(&self) -> &str;

    /// Capture the state a later `contribute` compares against
    fn prepare(&self, _mementos: &mut Mementos) -> Result<()> {
        Ok(())
    }

    /// Write current values into `results`
    fn contribute(
        &self,
        results: &mut ScalarResults,
        timestamp_millis: i64,
        mementos: &Mementos,
    ) -> Result<()>;

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Overrides the configured probe timeout
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// A source of discrete facts that do not change over time
pub trait EnvironmentProbe: Send + Sync {
    fn name(&self) -> &str;

    fn contribute(&self, collector: &mut EnvironmentCollector) -> Result<()>;

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Overrides the configured probe timeout
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Accumulates the facts of all environment probes
#[derive(Debug, Default)]
pub struct EnvironmentCollector {
    data: Vec<EnvironmentData>,
}

impl EnvironmentCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: AsRef<str>>(&mut self, name: &[S], value: impl Into<String>) {
        let name = name.iter().map(|s| s.as_ref().to_string()).collect();
        self.data.push(EnvironmentData::new(name, value));
    }

    /// Move all facts of `other` into this collector
    pub fn extend(&mut self, other: EnvironmentCollector) {
        self.data.extend(other.data);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<EnvironmentData> {
        self.data
    }
}
