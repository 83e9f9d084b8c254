//! Tracks which outermost measurement each thread is running
//!
//! Entries are keyed by `ThreadId`; pool threads often share a name.

use std::thread::{self, ThreadId};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use super::DataSink;
use crate::data::HierarchicalDataRoot;
use crate::error::Result;

/// Entries beyond this are assumed to be leaked and dropped
const MAX_NUM_THREADS: usize = 100_000;

/// What a thread has been doing since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningMeasurement {
    /// Thread name, or the `ThreadId` for unnamed threads
    pub thread: String,
    pub identifier: String,
    pub start_time_millis: i64,
}

#[derive(Debug, Default)]
pub struct RunningMeasurementsSink {
    running: DashMap<ThreadId, RunningMeasurement>,
}

impl RunningMeasurementsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot ordered by thread name
    pub fn running(&self) -> Vec<RunningMeasurement> {
        let mut result: Vec<_> = self.running.iter().map(|e| e.value().clone()).collect();
        result.sort_by(|a, b| {
            a.thread
                .cmp(&b.thread)
                .then(a.start_time_millis.cmp(&b.start_time_millis))
        });
        result
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

fn thread_label(current: &thread::Thread) -> String {
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

impl DataSink for RunningMeasurementsSink {
    fn name(&self) -> &str {
        "running-measurements"
    }

    fn on_started(&self, identifier: &str) -> Result<()> {
        if self.running.len() > MAX_NUM_THREADS {
            warn!(
                max = MAX_NUM_THREADS,
                "too many running measurements tracked - assuming a leak and discarding them"
            );
            self.running.clear();
        }
        let current = thread::current();
        self.running.insert(
            current.id(),
            RunningMeasurement {
                thread: thread_label(&current),
                identifier: identifier.to_string(),
                start_time_millis: Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    fn on_finished(&self, _root: &HierarchicalDataRoot) -> Result<()> {
        self.running.remove(&thread::current().id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::HierarchicalData;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn root() -> HierarchicalDataRoot {
        let node = HierarchicalData::new(true, 0, 10, "x", BTreeMap::new(), vec![], false);
        HierarchicalDataRoot::new(node, BTreeSet::new(), BTreeSet::new(), false)
    }

    #[test]
    fn test_tracks_per_thread() {
        let sink = Arc::new(RunningMeasurementsSink::new());

        let handle = {
            let sink = sink.clone();
            thread::Builder::new()
                .name("worker-1".to_string())
                .spawn(move || sink.on_started("job").unwrap())
                .unwrap()
        };
        handle.join().unwrap();

        sink.on_started("request").unwrap();
        assert_eq!(sink.len(), 2);

        let running = sink.running();
        let worker = running.iter().find(|r| r.thread == "worker-1").unwrap();
        assert_eq!(worker.identifier, "job");

        sink.on_finished(&root()).unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_threads_sharing_a_name_tracked_separately() {
        use std::sync::Barrier;

        let sink = Arc::new(RunningMeasurementsSink::new());
        let started = Arc::new(Barrier::new(3));
        let done = Arc::new(Barrier::new(3));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let sink = sink.clone();
                let started = started.clone();
                let done = done.clone();
                thread::Builder::new()
                    .name("tokio-runtime-worker".to_string())
                    .spawn(move || {
                        sink.on_started(&format!("request-{}", i)).unwrap();
                        started.wait();
                        done.wait();
                        sink.on_finished(&root()).unwrap();
                    })
                    .unwrap()
            })
            .collect();

        started.wait();
        let running = sink.running();
        assert_eq!(running.len(), 2);
        assert!(running.iter().all(|r| r.thread == "tokio-runtime-worker"));
        let mut identifiers: Vec<_> = running.iter().map(|r| r.identifier.as_str()).collect();
        identifiers.sort();
        assert_eq!(identifiers, vec!["request-0", "request-1"]);

        done.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(sink.is_empty());
    }
}
