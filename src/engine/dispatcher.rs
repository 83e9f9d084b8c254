//! Fan-out of hierarchy events to the registered sinks

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::is_globally_disabled;
use crate::data::HierarchicalDataRoot;
use crate::diagnostics::Diagnostics;
use crate::measure::hierarchy::HierarchyListener;
use crate::robust::RobustDataSink;

pub(crate) struct Dispatcher {
    sinks: ArcSwap<Vec<Arc<RobustDataSink>>>,
    diagnostics: Arc<Diagnostics>,
}

impl Dispatcher {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            sinks: ArcSwap::from_pointee(Vec::new()),
            diagnostics,
        }
    }

    pub fn add_sink(&self, sink: Arc<RobustDataSink>) {
        self.sinks.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(sink.clone());
            next
        });
    }

    pub fn sinks(&self) -> Arc<Vec<Arc<RobustDataSink>>> {
        self.sinks.load_full()
    }
}

impl HierarchyListener for Dispatcher {
    fn on_started(&self, identifier: &str) {
        if is_globally_disabled() {
            return;
        }
        for sink in self.sinks.load().iter() {
            sink.on_started(identifier);
        }
    }

    fn on_finished(&self, root: HierarchicalDataRoot) {
        if is_globally_disabled() {
            return;
        }
        self.diagnostics.roots_dispatched.inc();
        for sink in self.sinks.load().iter() {
            sink.on_finished(&root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::HierarchicalData;
    use crate::robust::BreakerSettings;
    use crate::sink::InMemoryDataSink;
    use crate::timer::SystemTimer;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    #[test]
    fn test_fans_out_to_all_sinks() {
        let diagnostics = Arc::new(Diagnostics::new());
        let settings = BreakerSettings {
            timeout: Duration::from_secs(1),
            max_timeouts: 3,
            timer: Arc::new(SystemTimer::new()),
            diagnostics: diagnostics.clone(),
        };
        let dispatcher = Dispatcher::new(diagnostics.clone());
        let first = Arc::new(InMemoryDataSink::new());
        let second = Arc::new(InMemoryDataSink::new());
        dispatcher.add_sink(Arc::new(RobustDataSink::new(first.clone(), &settings)));
        dispatcher.add_sink(Arc::new(RobustDataSink::new(second.clone(), &settings)));

        let node = HierarchicalData::new(true, 0, 1, "a", BTreeMap::new(), vec![], false);
        dispatcher.on_started("a");
        dispatcher.on_finished(HierarchicalDataRoot::new(
            node,
            BTreeSet::new(),
            BTreeSet::new(),
            false,
        ));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second.started(), vec!["a".to_string()]);
        assert_eq!(diagnostics.roots_dispatched.get(), 1);
    }
}
