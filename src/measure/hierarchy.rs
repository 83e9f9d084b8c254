//! Measurement Hierarchy
//!
//! One hierarchy exists per thread and engine while that thread has running
//! measurements. It keeps the stack of serial measurements ("containers"),
//! tracks every unfinished measurement, collects flow ids and assembles the
//! finished tree when the outermost serial measurement completes.
//!
//! # Rules
//!
//! - Only serial simple measurements are containers. Parallel and collecting
//!   measurements attach to the container that was on top when they started.
//! - A child is appended to its parent when the child finishes, so children
//!   appear in completion order.
//! - Finishing a container that is not on top of the stack first closes every
//!   container above it, innermost first.
//! - Measurements still open when the root finishes are closed with it.
//! - A hierarchy holding more than `max_open_measurements` unfinished
//!   measurements is treated as leaked: everything is force-closed, flagged as
//!   killed, and the hierarchy is discarded.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error};

use super::active::{
    new_child_list, ActiveMeasurement, ChildList, CollectingState, Kind, MeasurementRef,
    PendingNode,
};
use super::context;
use crate::data::{CorrelationId, HierarchicalDataRoot};
use crate::diagnostics::Diagnostics;
use crate::timer::Timer;

/// Receives the lifecycle events of hierarchies
pub(crate) trait HierarchyListener {
    /// The outermost serial measurement of a hierarchy was started
    fn on_started(&self, identifier: &str);

    /// A hierarchy completed (or was killed) and produced a tree
    fn on_finished(&self, root: HierarchicalDataRoot);
}

/// Result of starting a measurement
pub(crate) enum Started {
    Attached {
        measurement: MeasurementRef,
        is_root: bool,
    },
    Rejected,
}

/// Result of finishing a measurement
#[derive(Default)]
pub(crate) struct Finished {
    /// The hierarchy has nothing left open and must be released
    pub complete: bool,
    /// Tree to hand to the sinks
    pub root: Option<HierarchicalDataRoot>,
}

// =============================================================================
// Measurement Hierarchy
// =============================================================================

pub(crate) struct MeasurementHierarchy {
    timer: Arc<dyn Timer>,
    diagnostics: Arc<Diagnostics>,
    max_open_measurements: usize,

    /// Parent list for measurements started with an empty stack
    sentinel_children: ChildList,
    /// Serial containers, outermost first
    stack: Vec<MeasurementRef>,
    /// Every unfinished measurement, in start order
    open: Vec<MeasurementRef>,

    root: Option<MeasurementRef>,
    root_node: Option<PendingNode>,

    started_flows: BTreeSet<CorrelationId>,
    joined_flows: BTreeSet<CorrelationId>,
}

impl MeasurementHierarchy {
    pub fn new(
        timer: Arc<dyn Timer>,
        diagnostics: Arc<Diagnostics>,
        max_open_measurements: usize,
    ) -> Self {
        Self {
            timer,
            diagnostics,
            max_open_measurements,
            sentinel_children: new_child_list(),
            stack: Vec::new(),
            open: Vec::new(),
            root: None,
            root_node: None,
            started_flows: BTreeSet::new(),
            joined_flows: BTreeSet::new(),
        }
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.timer
    }

    /// Whether a further start would exceed the leak guard
    pub fn is_saturated(&self) -> bool {
        self.open.len() >= self.max_open_measurements
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.root.is_none()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn report(&self, message: &str, identifier: &str) {
        self.diagnostics.protocol_errors.inc();
        error!(identifier = %identifier, "{}", message);
    }

    // =========================================================================
    // Start
    // =========================================================================

    pub fn start_simple(&mut self, identifier: &str, is_serial: bool) -> Started {
        if self.stack.is_empty() && !is_serial {
            self.report(
                "parallel measurement started without an enclosing serial measurement - rejecting",
                identifier,
            );
            return Started::Rejected;
        }
        self.start(identifier, is_serial, Kind::Simple)
    }

    pub fn start_collecting(&mut self, identifier: &str, is_serial: bool) -> Started {
        if self.stack.is_empty() {
            debug!(
                identifier = %identifier,
                "top-level collecting measurement, data will be discarded"
            );
        }
        self.start(
            identifier,
            is_serial,
            Kind::Collecting(CollectingState::default()),
        )
    }

    fn start(&mut self, identifier: &str, is_serial: bool, kind: Kind) -> Started {
        let parent_children = match self.stack.last() {
            Some(top) => top.borrow().children.clone(),
            None => self.sentinel_children.clone(),
        };

        let is_container = is_serial && matches!(kind, Kind::Simple);
        let measurement = Rc::new(RefCell::new(ActiveMeasurement::new(
            identifier,
            is_serial,
            kind,
            self.timer.current_nanos(),
            parent_children,
        )));

        let mut is_root = false;
        if is_container {
            if self.stack.is_empty() {
                self.root = Some(measurement.clone());
                is_root = true;
            }
            self.stack.push(measurement.clone());
        }
        self.open.push(measurement.clone());

        Started::Attached {
            measurement,
            is_root,
        }
    }

    // =========================================================================
    // Finish
    // =========================================================================

    pub fn finish(&mut self, measurement: &MeasurementRef) -> Finished {
        if measurement.borrow().finished {
            let identifier = measurement.borrow().identifier.clone();
            self.report("measurement finished more than once - ignoring", &identifier);
            return Finished::default();
        }

        if let Some(pos) = self.stack.iter().position(|m| Rc::ptr_eq(m, measurement)) {
            // implicitly close abandoned containers, innermost first
            while self.stack.len() > pos + 1 {
                if let Some(abandoned) = self.stack.pop() {
                    debug!(
                        identifier = %abandoned.borrow().identifier,
                        "implicitly finishing unfinished child measurement"
                    );
                    self.close(&abandoned, false);
                }
            }
            self.stack.pop();
        }

        self.close(measurement, false);

        if self.stack.is_empty() {
            self.complete(false)
        } else {
            Finished::default()
        }
    }

    /// Finalize one measurement and append its node to its parent
    fn close(&mut self, measurement: &MeasurementRef, was_killed: bool) {
        let now = self.timer.current_nanos();
        let node = measurement.borrow_mut().finalize(now, was_killed);
        self.open.retain(|m| !Rc::ptr_eq(m, measurement));

        let is_root = self
            .root
            .as_ref()
            .map(|r| Rc::ptr_eq(r, measurement))
            .unwrap_or(false);

        if is_root {
            self.root_node = Some(node);
        } else {
            let parent = measurement.borrow().parent_children.clone();
            if Rc::ptr_eq(&parent, &self.sentinel_children) {
                debug!(
                    identifier = %measurement.borrow().identifier,
                    "discarding data of top-level collecting measurement"
                );
            } else {
                parent.borrow_mut().push(node);
            }
        }
    }

    /// Called with an empty stack: emit the tree if the root has finished, and
    /// report whether the hierarchy can be released.
    fn complete(&mut self, killed: bool) -> Finished {
        let root_node = match self.root_node.take() {
            Some(node) => node,
            None => {
                return Finished {
                    complete: self.open.is_empty(),
                    root: None,
                };
            }
        };

        // stragglers (parallel / collecting) are closed with the root
        for straggler in std::mem::take(&mut self.open) {
            debug!(
                identifier = %straggler.borrow().identifier,
                "implicitly finishing measurement with its root"
            );
            self.close(&straggler, killed);
        }
        self.root = None;

        let root = HierarchicalDataRoot::new(
            root_node.freeze(),
            std::mem::take(&mut self.started_flows),
            std::mem::take(&mut self.joined_flows),
            killed,
        );

        Finished {
            complete: true,
            root: Some(root),
        }
    }

    /// Force-close everything. Used by the leak guard.
    pub fn kill(&mut self) -> Option<HierarchicalDataRoot> {
        let non_containers: Vec<MeasurementRef> = self
            .open
            .iter()
            .filter(|m| !self.stack.iter().any(|s| Rc::ptr_eq(s, m)))
            .cloned()
            .collect();
        for m in non_containers {
            self.close(&m, true);
        }
        while let Some(container) = self.stack.pop() {
            self.close(&container, true);
        }
        self.complete(true).root
    }

    // =========================================================================
    // Flows
    // =========================================================================

    pub fn start_flow(&mut self, flow: CorrelationId) {
        if self.root.is_none() {
            self.report(
                "flow handling only while a measurement is running",
                &flow.to_string(),
            );
            return;
        }
        self.started_flows.insert(flow);
    }

    pub fn join_flow(&mut self, flow: CorrelationId) {
        if self.root.is_none() {
            self.report(
                "flow handling only while a measurement is running",
                &flow.to_string(),
            );
            return;
        }
        self.joined_flows.insert(flow);
    }

    pub fn has_running_measurement(&self) -> bool {
        self.root.is_some()
    }
}

// =============================================================================
// Shared Hierarchy
// =============================================================================

/// A hierarchy bound to its thread, together with what it needs to dispatch
/// and unregister itself. Borrows of the inner state are never held while
/// calling out to listeners, so sinks may start new measurements.
pub(crate) struct SharedHierarchy {
    pub engine_id: u64,
    listener: Arc<dyn HierarchyListener + Send + Sync>,
    state: RefCell<MeasurementHierarchy>,
}

impl SharedHierarchy {
    pub fn new(
        engine_id: u64,
        listener: Arc<dyn HierarchyListener + Send + Sync>,
        hierarchy: MeasurementHierarchy,
    ) -> Rc<Self> {
        Rc::new(Self {
            engine_id,
            listener,
            state: RefCell::new(hierarchy),
        })
    }

    pub fn state(&self) -> std::cell::RefMut<'_, MeasurementHierarchy> {
        self.state.borrow_mut()
    }

    pub fn timer(&self) -> Arc<dyn Timer> {
        self.state.borrow().timer().clone()
    }

    pub fn report(&self, message: &str, identifier: &str) {
        self.state.borrow().report(message, identifier);
    }

    pub fn notify_started(&self, identifier: &str) {
        self.listener.on_started(identifier);
    }

    pub fn finish(self: &Rc<Self>, measurement: &MeasurementRef) {
        let outcome = self.state.borrow_mut().finish(measurement);
        self.apply(outcome);
    }

    /// Force-close and unregister this hierarchy
    pub fn kill(self: &Rc<Self>) {
        let root = self.state.borrow_mut().kill();
        self.apply(Finished {
            complete: true,
            root,
        });
    }

    pub fn release_if_empty(self: &Rc<Self>) {
        if self.state.borrow().is_empty() {
            context::release(self);
        }
    }

    fn apply(self: &Rc<Self>, outcome: Finished) {
        if outcome.complete {
            context::release(self);
        }
        if let Some(root) = outcome.root {
            self.listener.on_finished(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;

    fn hierarchy(timer: Arc<ManualTimer>, max_open: usize) -> MeasurementHierarchy {
        MeasurementHierarchy::new(timer, Arc::new(Diagnostics::new()), max_open)
    }

    fn attached(started: Started) -> MeasurementRef {
        match started {
            Started::Attached { measurement, .. } => measurement,
            Started::Rejected => panic!("measurement was rejected"),
        }
    }

    #[test]
    fn test_serial_durations() {
        let timer = Arc::new(ManualTimer::new());
        let mut h = hierarchy(timer.clone(), 100);

        let a = attached(h.start_simple("a", true));
        timer.advance(100);
        let b = attached(h.start_simple("b", true));
        assert!(h.finish(&b).root.is_none());
        let b2 = attached(h.start_simple("b", true));
        timer.advance(100);
        h.finish(&b2);
        timer.advance(100);
        let outcome = h.finish(&a);

        assert!(outcome.complete);
        let root = outcome.root.unwrap();
        let node = root.root_node();
        assert_eq!(node.duration_nanos(), 300);
        assert_eq!(node.children()[0].duration_nanos(), 0);
        assert_eq!(node.children()[1].duration_nanos(), 100);
        assert_eq!(node.self_time_nanos(), 200);
    }

    #[test]
    fn test_parallel_root_rejected() {
        let timer = Arc::new(ManualTimer::new());
        let mut h = hierarchy(timer, 100);
        assert!(matches!(h.start_simple("p", false), Started::Rejected));
        assert!(h.is_empty());
    }

    #[test]
    fn test_first_serial_is_root() {
        let timer = Arc::new(ManualTimer::new());
        let mut h = hierarchy(timer, 100);
        match h.start_simple("a", true) {
            Started::Attached { is_root, .. } => assert!(is_root),
            Started::Rejected => panic!("rejected"),
        }
        match h.start_simple("b", true) {
            Started::Attached { is_root, .. } => assert!(!is_root),
            Started::Rejected => panic!("rejected"),
        }
    }

    #[test]
    fn test_double_finish_is_reported() {
        let timer = Arc::new(ManualTimer::new());
        let diagnostics = Arc::new(Diagnostics::new());
        let mut h = MeasurementHierarchy::new(timer, diagnostics.clone(), 100);

        let a = attached(h.start_simple("a", true));
        let b = attached(h.start_simple("b", false));
        h.finish(&b);
        let outcome = h.finish(&b);

        assert!(outcome.root.is_none());
        assert!(!outcome.complete);
        assert_eq!(diagnostics.protocol_errors.get(), 1);
        assert!(h.finish(&a).root.is_some());
    }

    #[test]
    fn test_kill_marks_everything() {
        let timer = Arc::new(ManualTimer::new());
        let mut h = hierarchy(timer, 3);

        attached(h.start_simple("a", true));
        attached(h.start_simple("b", true));
        attached(h.start_collecting("c", true));
        assert!(h.is_saturated());

        let root = h.kill().unwrap();
        assert!(root.is_killed());
        let a = root.root_node();
        assert!(a.was_killed());
        assert_eq!(a.children().len(), 1);
        assert_eq!(a.children()[0].identifier(), "b");
        assert_eq!(a.children()[0].children()[0].identifier(), "c");
        assert_eq!(h.open_count(), 0);
    }

    #[test]
    fn test_flows_require_root() {
        let timer = Arc::new(ManualTimer::new());
        let diagnostics = Arc::new(Diagnostics::new());
        let mut h = MeasurementHierarchy::new(timer, diagnostics.clone(), 100);

        attached(h.start_collecting("top", true));
        h.start_flow(CorrelationId::new("a", "1"));
        assert_eq!(diagnostics.protocol_errors.get(), 1);
    }
}
