//! Collecting measurements
//!
//! A collecting measurement aggregates many small, same-kind intervals
//! ("details") by count and total duration instead of creating a child per
//! occurrence. Iterating a database cursor is the typical case: the time spent
//! in each `next()` matters in total, not individually.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use super::active::{
    new_child_list, ActiveMeasurement, CollectingState, Detail, Kind, MeasurementRef,
};
use super::hierarchy::SharedHierarchy;
use crate::timer::{SystemTimer, Timer};

/// Handle for a running collecting measurement
pub struct CollectingMeasurement {
    measurement: MeasurementRef,
    hierarchy: Option<Rc<SharedHierarchy>>,
    timer: Arc<dyn Timer>,
}

impl CollectingMeasurement {
    pub(crate) fn attached(measurement: MeasurementRef, hierarchy: Rc<SharedHierarchy>) -> Self {
        let timer = hierarchy.timer();
        Self {
            measurement,
            hierarchy: Some(hierarchy),
            timer,
        }
    }

    /// Inert measurement used while instrumentation is disabled
    pub(crate) fn disabled(identifier: &str, is_serial: bool) -> Self {
        let mut measurement = ActiveMeasurement::new(
            identifier,
            is_serial,
            Kind::Collecting(CollectingState::default()),
            0,
            new_child_list(),
        );
        measurement.finished = true;
        Self {
            measurement: Rc::new(RefCell::new(measurement)),
            hierarchy: None,
            timer: Arc::new(SystemTimer::new()),
        }
    }

    fn is_disabled(&self) -> bool {
        self.hierarchy.is_none()
    }

    fn report(&self, message: &str) {
        if let Some(hierarchy) = &self.hierarchy {
            hierarchy.report(message, &self.measurement.borrow().identifier);
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

    pub fn start_time_millis(&self) -> i64 {
        self.measurement.borrow().start_time_millis
    }

    pub fn add_parameter(&self, key: &str, value: &str) {
        if self.is_disabled() {
            return;
        }
        self.measurement.borrow_mut().add_parameter(key, value);
    }

    /// Sum of all detail durations so far
    pub fn total_duration_nanos(&self) -> u64 {
        match &self.measurement.borrow().kind {
            Kind::Collecting(state) => state.total_duration_nanos,
            Kind::Simple => 0,
        }
    }

    /// Aggregated details so far, by identifier
    pub fn details(&self) -> BTreeMap<String, Detail> {
        match &self.measurement.borrow().kind {
            Kind::Collecting(state) => state.details.clone(),
            Kind::Simple => BTreeMap::new(),
        }
    }

    /// Open a detail interval. Only one detail may be open at a time.
    pub fn start_detail(&self, identifier: &str) {
        if self.is_disabled() {
            return;
        }
        let now = self.timer.current_nanos();

        let message = {
            let mut m = self.measurement.borrow_mut();
            let finished = m.finished;
            let message = match &mut m.kind {
                _ if finished => Some("detail started on a finished measurement - ignoring"),
                Kind::Collecting(state) if state.open_detail.is_some() => {
                    Some(
                        "a detail measurement is already running - \
                         ignoring call to 'start_detail'",
                    )
                }
                Kind::Collecting(state) => {
                    state.open_detail = Some((identifier.to_string(), now));
                    None
                }
                Kind::Simple => None,
            };
            message
        };
        if let Some(message) = message {
            self.report(message);
        }
    }

    /// Close the open detail interval and fold its duration in
    pub fn finish_detail(&self) {
        if self.is_disabled() {
            return;
        }
        let now = self.timer.current_nanos();

        let closed = {
            let mut m = self.measurement.borrow_mut();
            let finished = m.finished;
            let closed = match &mut m.kind {
                Kind::Collecting(state) if !finished => state.close_open_detail(now),
                _ => false,
            };
            closed
        };
        if !closed {
            self.report("no current detail measurement - ignoring call to 'finish_detail'");
        }
    }

    /// Run `body` as a detail. The detail is closed on every exit path,
    /// including a panic in `body`; the body's result is returned unchanged.
    pub fn detail<R>(&self, identifier: &str, body: impl FnOnce(&Self) -> R) -> R {
        struct DetailGuard<'a>(&'a CollectingMeasurement);

        impl Drop for DetailGuard<'_> {
            fn drop(&mut self) {
                self.0.finish_detail();
            }
        }

        self.start_detail(identifier);
        let _guard = DetailGuard(self);
        body(self)
    }

    /// Fold an externally timed interval into a detail
    pub fn add_detail_measurement(&self, identifier: &str, duration_nanos: u64) {
        if self.is_disabled() {
            return;
        }
        let mut m = self.measurement.borrow_mut();
        if m.finished {
            drop(m);
            self.report("detail added to a finished measurement - ignoring");
            return;
        }
        if let Kind::Collecting(state) = &mut m.kind {
            state.add_detail(identifier, duration_nanos);
        }
    }

    /// Finish the measurement, implicitly closing an open detail
    pub fn finish(&self) {
        if let Some(hierarchy) = &self.hierarchy {
            hierarchy.finish(&self.measurement);
        }
    }
}

impl std::fmt::Debug for CollectingMeasurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.measurement.borrow();
        f.debug_struct("CollectingMeasurement")
            .field("identifier", &m.identifier)
            .field("finished", &m.finished)
            .field("total_duration_nanos", &self.total_duration_nanos())
            .finish()
    }
}
