//! In-progress measurement state
//!
//! An [`ActiveMeasurement`] is owned by the thread that started it and shared
//! (via `Rc<RefCell<_>>`) between the caller's handle and the hierarchy, so the
//! hierarchy can close it implicitly while the caller still holds the handle.
//!
//! Finished measurements become [`PendingNode`]s. A pending node keeps a shared
//! list of its children so that parallel measurements which finish after their
//! serial parent still land under it. Nodes are frozen into immutable
//! [`HierarchicalData`] only when the whole tree completes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::warn;

use crate::data::HierarchicalData;

pub(crate) type ChildList = Rc<RefCell<Vec<PendingNode>>>;
pub(crate) type MeasurementRef = Rc<RefCell<ActiveMeasurement>>;

pub(crate) fn new_child_list() -> ChildList {
    Rc::new(RefCell::new(Vec::new()))
}

// =============================================================================
// Detail Aggregation
// =============================================================================

/// Aggregated timing of one detail identifier inside a collecting measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Detail {
    pub total_nanos: u64,
    pub count: u32,
}

impl Detail {
    fn add(&mut self, nanos: u64) {
        self.total_nanos += nanos;
        self.count += 1;
    }
}

#[derive(Debug, Default)]
pub(crate) struct CollectingState {
    pub details: BTreeMap<String, Detail>,
    pub total_duration_nanos: u64,
    pub open_detail: Option<(String, u64)>,
}

impl CollectingState {
    pub fn add_detail(&mut self, identifier: &str, duration_nanos: u64) {
        self.total_duration_nanos += duration_nanos;
        self.details
            .entry(identifier.to_string())
            .or_default()
            .add(duration_nanos);
    }

    /// Close the open detail, if any, at `now_nanos`
    pub fn close_open_detail(&mut self, now_nanos: u64) -> bool {
        match self.open_detail.take() {
            Some((identifier, started)) => {
                self.add_detail(&identifier, now_nanos.saturating_sub(started));
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Simple,
    Collecting(CollectingState),
}

// =============================================================================
// Active Measurement
// =============================================================================

#[derive(Debug)]
pub(crate) struct ActiveMeasurement {
    pub identifier: String,
    pub is_serial: bool,
    pub start_time_millis: i64,
    pub start_time_nanos: u64,
    pub parameters: BTreeMap<String, String>,
    pub finished: bool,
    pub kind: Kind,
    /// List this measurement's node is appended to when it finishes
    pub parent_children: ChildList,
    /// List that measurements started inside this one append to
    pub children: ChildList,
}

impl ActiveMeasurement {
    pub fn new(
        identifier: &str,
        is_serial: bool,
        kind: Kind,
        start_time_nanos: u64,
        parent_children: ChildList,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            is_serial,
            start_time_millis: chrono::Utc::now().timestamp_millis(),
            start_time_nanos,
            parameters: BTreeMap::new(),
            finished: false,
            kind,
            parent_children,
            children: new_child_list(),
        }
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.kind, Kind::Collecting(_))
    }

    /// Last write wins; duplicates are reported
    pub fn add_parameter(&mut self, key: &str, value: &str) {
        if self.finished {
            warn!(
                identifier = %self.identifier,
                key = %key,
                "parameter added to a finished measurement - ignoring"
            );
            return;
        }
        if self
            .parameters
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            warn!(identifier = %self.identifier, key = %key, "duplicate parameter");
        }
    }

    /// Mark finished and turn into a pending node. The node is not yet attached
    /// to the parent.
    pub fn finalize(&mut self, now_nanos: u64, was_killed: bool) -> PendingNode {
        self.finished = true;

        let duration_nanos = match &mut self.kind {
            Kind::Simple => now_nanos.saturating_sub(self.start_time_nanos),
            Kind::Collecting(state) => {
                if state.close_open_detail(now_nanos) {
                    warn!(
                        identifier = %self.identifier,
                        "unfinished detail - finishing implicitly"
                    );
                }
                for (identifier, detail) in &state.details {
                    let mut parameters = BTreeMap::new();
                    parameters.insert("count".to_string(), detail.count.to_string());
                    self.children.borrow_mut().push(PendingNode {
                        is_serial: true,
                        start_time_millis: self.start_time_millis,
                        duration_nanos: detail.total_nanos,
                        identifier: identifier.clone(),
                        parameters,
                        children: new_child_list(),
                        was_killed,
                    });
                }
                state.total_duration_nanos
            }
        };

        PendingNode {
            is_serial: self.is_serial,
            start_time_millis: self.start_time_millis,
            duration_nanos,
            identifier: self.identifier.clone(),
            parameters: std::mem::take(&mut self.parameters),
            children: self.children.clone(),
            was_killed,
        }
    }
}

// =============================================================================
// Pending Node
// =============================================================================

#[derive(Debug)]
pub(crate) struct PendingNode {
    is_serial: bool,
    start_time_millis: i64,
    duration_nanos: u64,
    identifier: String,
    parameters: BTreeMap<String, String>,
    children: ChildList,
    was_killed: bool,
}

impl PendingNode {
    /// Convert this node and everything appended below it into immutable data
    pub fn freeze(self) -> HierarchicalData {
        let pending = std::mem::take(&mut *self.children.borrow_mut());
        let children: Vec<HierarchicalData> = pending
            .into_iter()
            .map(PendingNode::freeze)
            .collect();

        HierarchicalData::new(
            self.is_serial,
            self.start_time_millis,
            self.duration_nanos,
            &self.identifier,
            self.parameters,
            children,
            self.was_killed,
        )
    }
}
