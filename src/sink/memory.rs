//! In-memory sink
//!
//! Collects trees for later inspection. Used by tests and by embedders that
//! poll for data instead of pushing it somewhere.

use parking_lot::RwLock;

use super::DataSink;
use crate::data::HierarchicalDataRoot;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct InMemoryDataSink {
    started: RwLock<Vec<String>>,
    roots: RwLock<Vec<HierarchicalDataRoot>>,
}

impl InMemoryDataSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected roots.
    pub fn roots(&self) -> Vec<HierarchicalDataRoot> {
        self.roots.read().clone()
    }

    /// Identifiers passed to `on_started`, in call order
    pub fn started(&self) -> Vec<String> {
        self.started.read().clone()
    }

    /// Get the count of collected roots.
    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }

    pub fn num_started(&self) -> usize {
        self.started.read().len()
    }

    pub fn clear(&self) {
        self.started.write().clear();
        self.roots.write().clear();
    }

    /// Roots whose top-level node has the given identifier
    pub fn roots_named(&self, identifier: &str) -> Vec<HierarchicalDataRoot> {
        self.roots
            .read()
            .iter()
            .filter(|r| r.root_node().identifier() == identifier)
            .cloned()
            .collect()
    }
}

impl DataSink for InMemoryDataSink {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn on_started(&self, identifier: &str) -> Result<()> {
        self.started.write().push(identifier.to_string());
        Ok(())
    }

    fn on_finished(&self, root: &HierarchicalDataRoot) -> Result<()> {
        self.roots.write().push(root.clone());
        Ok(())
    }
}
