//! Handle for a plain (serial or parallel) measurement

use std::cell::RefCell;
use std::rc::Rc;

use super::active::{new_child_list, ActiveMeasurement, Kind, MeasurementRef};
use super::hierarchy::SharedHierarchy;

/// A running unit of work
///
/// Returned by [`Engine::start`](crate::Engine::start). The handle is bound to
/// the thread that created it. Call [`finish`](Self::finish) when the work is
/// done; finishing twice, or finishing a measurement that was already closed
/// implicitly, is reported and ignored.
pub struct SimpleMeasurement {
    measurement: MeasurementRef,
    hierarchy: Option<Rc<SharedHierarchy>>,
}

impl SimpleMeasurement {
    pub(crate) fn attached(measurement: MeasurementRef, hierarchy: Rc<SharedHierarchy>) -> Self {
        Self {
            measurement,
            hierarchy: Some(hierarchy),
        }
    }

    /// A measurement that is not part of any tree. Parameters are accepted,
    /// finishing it has no effect.
    pub(crate) fn detached(identifier: &str, is_serial: bool) -> Self {
        let measurement =
            ActiveMeasurement::new(identifier, is_serial, Kind::Simple, 0, new_child_list());
        Self {
            measurement: Rc::new(RefCell::new(measurement)),
            hierarchy: None,
        }
    }

    pub fn identifier(&self) -> String {
        self.measurement.borrow().identifier.clone()
    }

    pub fn is_serial(&self) -> bool {
        self.measurement.borrow().is_serial
    }

    pub fn is_finished(&self) -> bool {
        self.measurement.borrow().finished
    }

    /// Whether this measurement takes part in a tree
    pub fn is_detached(&self) -> bool {
        self.hierarchy.is_none()
    }

    pub fn start_time_millis(&self) -> i64 {
        self.measurement.borrow().start_time_millis
    }

    /// Attach metadata. An existing key is overwritten and reported.
    pub fn add_parameter(&self, key: &str, value: &str) {
        self.measurement.borrow_mut().add_parameter(key, value);
    }

    pub fn finish(&self) {
        match &self.hierarchy {
            Some(hierarchy) => hierarchy.finish(&self.measurement),
            None => self.measurement.borrow_mut().finished = true,
        }
    }
}

impl std::fmt::Debug for SimpleMeasurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.measurement.borrow();
        f.debug_struct("SimpleMeasurement")
            .field("identifier", &m.identifier)
            .field("is_serial", &m.is_serial)
            .field("finished", &m.finished)
            .field("parameters", &m.parameters)
            .finish()
    }
}

/// Finishes a measurement when dropped, including during unwinding
pub(crate) struct FinishGuard<'a>(pub &'a SimpleMeasurement);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            self.0.finish();
        }
    }
}
