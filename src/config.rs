//! Engine configuration
//!
//! [`EngineConfig`] carries the timeouts, thresholds and capacities the engine
//! core works with. It can be built in code or loaded from YAML:
//!
//! ```yaml
//! measurement_timeout_nanos: 50000000
//! max_num_measurement_timeouts: 3
//! sampling_period_seconds: 5
//! max_history_per_metric: 720
//! ```
//!
//! Missing keys fall back to [`EngineConfig::default`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Global Kill Switch
// =============================================================================

static GLOBALLY_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disable (or re-enable) all instrumentation work in this process.
///
/// While disabled, new measurements are inert, nothing is dispatched to sinks
/// and no probe is sampled.
pub fn set_globally_disabled(disabled: bool) {
    GLOBALLY_DISABLED.store(disabled, Ordering::SeqCst);
}

/// Check the process-wide kill switch
pub fn is_globally_disabled() -> bool {
    GLOBALLY_DISABLED.load(Ordering::SeqCst)
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration consumed by the engine core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// A probe call slower than this counts as a timeout
    pub measurement_timeout_nanos: u64,

    /// Consecutive probe timeouts before the probe is disabled
    pub max_num_measurement_timeouts: u32,

    /// A sink call slower than this counts as a timeout
    pub data_sink_timeout_nanos: u64,

    /// Consecutive sink timeouts before the sink is disabled
    pub max_num_data_sink_timeouts: u32,

    /// Period of the timed scalar sampler
    pub sampling_period_seconds: u64,

    /// Ring buffer capacity per sampled metric
    pub max_history_per_metric: usize,

    /// Default averaging window for on-demand scalar measurements
    pub averaging_delay_millis: u64,

    /// Maximum number of unfinished measurements per thread before the
    /// hierarchy is treated as leaked and discarded
    pub max_open_measurements: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            measurement_timeout_nanos: 100_000_000,
            max_num_measurement_timeouts: 3,
            data_sink_timeout_nanos: 100_000_000,
            max_num_data_sink_timeouts: 3,
            sampling_period_seconds: 10,
            max_history_per_metric: 1000,
            averaging_delay_millis: 1000,
            max_open_measurements: 100,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sampling_period_seconds == 0 {
            return Err(Error::Config(
                "sampling_period_seconds must be positive".to_string(),
            ));
        }
        if self.max_history_per_metric == 0 {
            return Err(Error::Config(
                "max_history_per_metric must be positive".to_string(),
            ));
        }
        if self.max_open_measurements == 0 {
            return Err(Error::Config(
                "max_open_measurements must be positive".to_string(),
            ));
        }
        if self.max_num_measurement_timeouts == 0 || self.max_num_data_sink_timeouts == 0 {
            return Err(Error::Config(
                "timeout thresholds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_measurement_timeout(mut self, timeout: Duration, max_timeouts: u32) -> Self {
        self.measurement_timeout_nanos = timeout.as_nanos() as u64;
        self.max_num_measurement_timeouts = max_timeouts;
        self
    }

    pub fn with_data_sink_timeout(mut self, timeout: Duration, max_timeouts: u32) -> Self {
        self.data_sink_timeout_nanos = timeout.as_nanos() as u64;
        self.max_num_data_sink_timeouts = max_timeouts;
        self
    }

    pub fn with_sampling_period(mut self, seconds: u64) -> Self {
        self.sampling_period_seconds = seconds;
        self
    }

    pub fn with_max_history_per_metric(mut self, capacity: usize) -> Self {
        self.max_history_per_metric = capacity;
        self
    }

    pub fn with_averaging_delay(mut self, millis: u64) -> Self {
        self.averaging_delay_millis = millis;
        self
    }

    pub fn with_max_open_measurements(mut self, max: usize) -> Self {
        self.max_open_measurements = max;
        self
    }

    pub fn measurement_timeout(&self) -> Duration {
        Duration::from_nanos(self.measurement_timeout_nanos)
    }

    pub fn data_sink_timeout(&self) -> Duration {
        Duration::from_nanos(self.data_sink_timeout_nanos)
    }

    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs(self.sampling_period_seconds)
    }

    pub fn averaging_delay(&self) -> Duration {
        Duration::from_millis(self.averaging_delay_millis)
    }
}
