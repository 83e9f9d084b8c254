//! Prometheus sink
//!
//! Counts finished trees per root identifier and records root durations in a
//! histogram. Metrics live in the sink's own registry so several engines (or
//! tests) do not collide in the default one.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::DataSink;
use crate::data::HierarchicalDataRoot;
use crate::error::Result;

/// Duration buckets in seconds
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub struct PrometheusDataSink {
    registry: Registry,
    finished: IntCounterVec,
    killed: IntCounterVec,
    duration: HistogramVec,
}

impl PrometheusDataSink {
    /// Create a sink whose metric names start with `namespace_`
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();

        let finished = IntCounterVec::new(
            Opts::new("measurements_finished_total", "Finished measurement trees")
                .namespace(namespace),
            &["identifier"],
        )?;
        let killed = IntCounterVec::new(
            Opts::new(
                "measurements_killed_total",
                "Measurement trees force-closed because measurements were left open",
            )
            .namespace(namespace),
            &["identifier"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "measurement_duration_seconds",
                "Duration of the outermost measurement of a tree",
            )
            .namespace(namespace)
            .buckets(DURATION_BUCKETS.to_vec()),
            &["identifier"],
        )?;

        registry.register(Box::new(finished.clone()))?;
        registry.register(Box::new(killed.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            finished,
            killed,
            duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn finished_count(&self, identifier: &str) -> u64 {
        self.finished.with_label_values(&[identifier]).get()
    }

    /// Render all metrics in the text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for PrometheusDataSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusDataSink").finish()
    }
}

impl DataSink for PrometheusDataSink {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn on_finished(&self, root: &HierarchicalDataRoot) -> Result<()> {
        let node = root.root_node();
        let labels = [node.identifier()];

        self.finished.with_label_values(&labels).inc();
        if root.is_killed() {
            self.killed.with_label_values(&labels).inc();
        }
        self.duration
            .with_label_values(&labels)
            .observe(node.duration_nanos() as f64 / 1e9);
        Ok(())
    }
}
