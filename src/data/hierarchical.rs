//! Finished measurement trees
//!
//! These are the snapshots handed to data sinks once the outermost measurement
//! of a thread has finished. They are immutable and serialize losslessly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashSet;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifier Interning
// =============================================================================

/// Table size at which identifiers no longer referenced by any node are pruned
const PRUNE_THRESHOLD: usize = 4096;

static IDENTIFIERS: Lazy<DashSet<Arc<str>>> = Lazy::new(DashSet::new);
static NEXT_PRUNE: AtomicUsize = AtomicUsize::new(PRUNE_THRESHOLD);

/// Return the shared copy of `identifier`.
///
/// Trees repeat the same few identifiers many times, so nodes share one
/// allocation per distinct identifier. Entries only the table still holds
/// are dropped once the table grows past the next prune mark.
pub fn intern(identifier: &str) -> Arc<str> {
    if let Some(existing) = IDENTIFIERS.get(identifier) {
        return existing.key().clone();
    }
    let shared: Arc<str> = Arc::from(identifier);
    IDENTIFIERS.insert(shared.clone());

    if IDENTIFIERS.len() >= NEXT_PRUNE.load(Ordering::Relaxed) {
        prune_identifiers();
    }
    shared
}

fn prune_identifiers() {
    IDENTIFIERS.retain(|entry| Arc::strong_count(entry) > 1);
    let next = (IDENTIFIERS.len() * 2).max(PRUNE_THRESHOLD);
    NEXT_PRUNE.store(next, Ordering::Relaxed);
}

fn deserialize_interned<'de, D>(deserializer: D) -> std::result::Result<Arc<str>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(intern(&raw))
}

// =============================================================================
// Correlation Id
// =============================================================================

/// Opaque token marking an asynchronous continuation of a traced unit of work
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub namespace: String,
    pub value: String,
}

impl CorrelationId {
    pub fn new(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

// =============================================================================
// Hierarchical Data
// =============================================================================

/// One finished node of a measurement tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchicalData {
    is_serial: bool,
    start_time_millis: i64,
    duration_nanos: u64,
    #[serde(deserialize_with = "deserialize_interned")]
    identifier: Arc<str>,
    parameters: BTreeMap<String, String>,
    children: Vec<HierarchicalData>,
    was_killed: bool,
}

impl HierarchicalData {
    /// Create a node.
    ///
    /// `is_serial` marks a node whose duration is an additive part of its
    /// parent's; parallel nodes may overlap siblings and are not subtracted when
    /// computing the parent's self time.
    pub fn new(
        is_serial: bool,
        start_time_millis: i64,
        duration_nanos: u64,
        identifier: &str,
        parameters: BTreeMap<String, String>,
        mut children: Vec<HierarchicalData>,
        was_killed: bool,
    ) -> Self {
        children.shrink_to_fit();
        Self {
            is_serial,
            start_time_millis,
            duration_nanos,
            identifier: intern(identifier),
            parameters,
            children,
            was_killed,
        }
    }

    pub fn is_serial(&self) -> bool {
        self.is_serial
    }

    pub fn start_time_millis(&self) -> i64 {
        self.start_time_millis
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.start_time_millis).single()
    }

    pub fn duration_nanos(&self) -> u64 {
        self.duration_nanos
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Children in the order in which they finished
    pub fn children(&self) -> &[HierarchicalData] {
        &self.children
    }

    pub fn was_killed(&self) -> bool {
        self.was_killed
    }

    /// Own duration minus the durations of serial children, clamped at zero
    pub fn self_time_nanos(&self) -> u64 {
        let serial_children: u64 = self
            .children
            .iter()
            .filter(|c| c.is_serial)
            .map(|c| c.duration_nanos)
            .sum();
        self.duration_nanos.saturating_sub(serial_children)
    }

    /// Number of nodes in this subtree, including this one
    pub fn total_node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|c| c.total_node_count())
            .sum::<usize>()
    }

    /// Find nodes in this subtree by identifier
    pub fn find(&self, identifier: &str) -> Vec<&HierarchicalData> {
        fn find_recursive<'a>(
            node: &'a HierarchicalData,
            identifier: &str,
            results: &mut Vec<&'a HierarchicalData>,
        ) {
            if node.identifier() == identifier {
                results.push(node);
            }
            for child in &node.children {
                find_recursive(child, identifier, results);
            }
        }

        let mut results = Vec::new();
        find_recursive(self, identifier, &mut results);
        results
    }
}

impl std::fmt::Display for HierarchicalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?} : [", self.identifier, self.parameters)?;
        for (i, child) in self.children.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", child)?;
        }
        write!(f, "]")
    }
}

// =============================================================================
// Hierarchical Data Root
// =============================================================================

/// A complete tree as delivered to data sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchicalDataRoot {
    id: Uuid,
    root_node: HierarchicalData,
    started_flows: BTreeSet<CorrelationId>,
    joined_flows: BTreeSet<CorrelationId>,
    killed: bool,
}

impl HierarchicalDataRoot {
    pub fn new(
        root_node: HierarchicalData,
        started_flows: BTreeSet<CorrelationId>,
        joined_flows: BTreeSet<CorrelationId>,
        killed: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            root_node,
            started_flows,
            joined_flows,
            killed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root_node(&self) -> &HierarchicalData {
        &self.root_node
    }

    pub fn started_flows(&self) -> &BTreeSet<CorrelationId> {
        &self.started_flows
    }

    pub fn joined_flows(&self) -> &BTreeSet<CorrelationId> {
        &self.joined_flows
    }

    /// Whether the tree was force-closed by the leak guard
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
