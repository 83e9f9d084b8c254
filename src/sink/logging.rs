//! Logging sink
//!
//! Writes every finished tree to the tracing system, one line per node:
//!
//! ```text
//! +request@1700000000000: 1200000 {"path": "/users"}
//!   +db-query@1700000000100: 800000 {}
//!   -cache-warmup@1700000000200: 300000 {}
//! ```
//!
//! `+` marks serial nodes, `-` parallel ones.

use tracing::{debug, info};

use super::DataSink;
use crate::data::{HierarchicalData, HierarchicalDataRoot};
use crate::error::Result;

/// Logs finished trees at info or debug level
#[derive(Debug, Clone, Default)]
pub struct LoggingDataSink {
    /// Whether to log at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingDataSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a sink that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }

    /// Render a tree as indented lines
    pub fn render(root: &HierarchicalDataRoot) -> Vec<String> {
        let mut lines = Vec::with_capacity(root.root_node().total_node_count());
        render_rec(root.root_node(), 0, &mut lines);
        lines
    }
}

fn render_rec(data: &HierarchicalData, level: usize, lines: &mut Vec<String>) {
    lines.push(format!(
        "{:indent$}{}{}@{}: {} {:?}",
        "",
        if data.is_serial() { "+" } else { "-" },
        data.identifier(),
        data.start_time_millis(),
        data.duration_nanos(),
        data.parameters(),
        indent = 2 * level
    ));
    for child in data.children() {
        render_rec(child, level + 1, lines);
    }
}

impl DataSink for LoggingDataSink {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_finished(&self, root: &HierarchicalDataRoot) -> Result<()> {
        let killed = root.is_killed();
        for line in Self::render(root) {
            if self.info_level {
                info!(root_id = %root.id(), killed, "{}", line);
            } else {
                debug!(root_id = %root.id(), killed, "{}", line);
            }
        }
        Ok(())
    }
}
