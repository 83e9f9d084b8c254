//! perftree Integration Tests
//!
//! Exercises the engine through its public API:
//! - Tree assembly for serial, parallel and collecting measurements
//! - Timing with an injected clock
//! - Protocol misuse and the leak guard
//! - Fault isolation of probes and sinks

use std::sync::Arc;
use std::time::Duration;

use perftree::sink::{DataSink, InMemoryDataSink};
use perftree::{Engine, HierarchicalData, HierarchicalDataRoot, ManualTimer};

const MS: u64 = 1_000_000;

fn engine_with_timer() -> (Arc<Engine>, Arc<InMemoryDataSink>, Arc<ManualTimer>) {
    let sink = Arc::new(InMemoryDataSink::new());
    let timer = Arc::new(ManualTimer::new());
    let engine = Engine::builder()
        .timer(timer.clone())
        .data_sink(sink.clone())
        .without_sampler_thread()
        .build()
        .unwrap();
    (engine, sink, timer)
}

fn engine_with_sink() -> (Arc<Engine>, Arc<InMemoryDataSink>) {
    let (engine, sink, _timer) = engine_with_timer();
    (engine, sink)
}

fn child_ids(node: &HierarchicalData) -> Vec<&str> {
    node.children().iter().map(|c| c.identifier()).collect()
}

fn only_root(sink: &InMemoryDataSink) -> HierarchicalDataRoot {
    let roots = sink.roots();
    assert_eq!(roots.len(), 1, "expected exactly one root, got {:?}", roots);
    roots.into_iter().next().unwrap()
}

// =============================================================================
// Tree Assembly
// =============================================================================

mod tree_tests {
    use super::*;

    #[test]
    fn test_simple_measurement() {
        let (engine, sink) = engine_with_sink();

        let m = engine.start("a");
        m.add_parameter("tenant", "acme");
        assert!(engine.has_running_measurement());
        m.finish();

        let root = only_root(&sink);
        assert_eq!(root.root_node().identifier(), "a");
        assert!(root.root_node().is_serial());
        assert_eq!(root.root_node().parameters().get("tenant").unwrap(), "acme");
        assert!(root.root_node().children().is_empty());
        assert!(!root.is_killed());
        assert!(!engine.has_running_measurement());
    }

    #[test]
    fn test_nested_measurements() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start("a");
        engine.start("b").finish();
        engine.start("c").finish();
        a.finish();
        engine.start("d").finish();

        let roots = sink.roots();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].root_node().identifier(), "a");
        assert_eq!(child_ids(roots[0].root_node()), vec!["b", "c"]);
        assert_eq!(roots[1].root_node().identifier(), "d");
        assert!(roots[1].root_node().children().is_empty());
        assert_eq!(sink.started(), vec!["a".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_collecting_measurement() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start("a");
        let b = engine.start_collecting("b");
        b.start_detail("c1");
        engine.start("d").finish();
        b.finish_detail();
        b.detail("c3", |_| ());
        b.detail("c3", |_| ());
        b.add_detail_measurement("c2", 123);
        b.finish();
        a.finish();

        let root = only_root(&sink);
        let a = root.root_node();
        assert_eq!(child_ids(a), vec!["d", "b"]);

        let b = &a.children()[1];
        assert_eq!(child_ids(b), vec!["c1", "c2", "c3"]);
        assert_eq!(b.children()[1].duration_nanos(), 123);
        assert_eq!(b.children()[1].parameters().get("count").unwrap(), "1");
        assert_eq!(b.children()[2].parameters().get("count").unwrap(), "2");
        assert_eq!(engine.diagnostics().protocol_errors, 0);
    }

    #[test]
    fn test_detail_closed_when_body_fails() {
        let (engine, sink, timer) = engine_with_timer();

        let a = engine.start("a");
        let b = engine.start_collecting("b");
        let result: Result<(), String> = b.detail("query", |_| {
            timer.advance(7 * MS);
            Err("connection reset".to_string())
        });
        assert_eq!(result, Err("connection reset".to_string()));

        // no detail is left open
        b.start_detail("next");
        b.finish_detail();
        b.finish();
        a.finish();

        assert_eq!(engine.diagnostics().protocol_errors, 0);
        let root = only_root(&sink);
        let b = &root.root_node().children()[0];
        assert_eq!(child_ids(b), vec!["next", "query"]);
        assert_eq!(b.children()[1].duration_nanos(), 7 * MS);
        assert_eq!(b.children()[1].parameters().get("count").unwrap(), "1");
    }

    #[test]
    fn test_detail_closed_when_body_panics() {
        let (engine, sink, timer) = engine_with_timer();

        let a = engine.start("a");
        let b = engine.start_collecting("b");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            b.detail("parse", |_| {
                timer.advance(3 * MS);
                panic!("malformed row");
            })
        }));
        assert!(result.is_err());

        let details = b.details();
        assert_eq!(details.get("parse").unwrap().count, 1);
        assert_eq!(details.get("parse").unwrap().total_nanos, 3 * MS);
        assert_eq!(b.total_duration_nanos(), 3 * MS);

        b.detail("parse", |_| timer.advance(MS));
        b.finish();
        a.finish();

        assert_eq!(engine.diagnostics().protocol_errors, 0);
        let root = only_root(&sink);
        let parse = &root.root_node().children()[0].children()[0];
        assert_eq!(parse.duration_nanos(), 4 * MS);
        assert_eq!(parse.parameters().get("count").unwrap(), "2");
    }

    #[test]
    fn test_overlapping_details_reported() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start("a");
        let b = engine.start_collecting("b");
        b.start_detail("x");
        b.start_detail("y");
        b.finish_detail();
        b.finish_detail();
        b.finish();
        a.finish();

        // the second start and the second finish are misuse
        assert_eq!(engine.diagnostics().protocol_errors, 2);
        let root = only_root(&sink);
        let b = &root.root_node().children()[0];
        assert_eq!(child_ids(b), vec!["x"]);
    }

    #[test]
    fn test_parallel_children_in_completion_order() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start("a");
        let c1 = engine.start_parallel("c1");
        let b = engine.start("b");
        let c2 = engine.start_parallel("c2");
        let c3 = engine.start_parallel("c3");
        engine.start("d").finish();
        c3.finish();
        c1.finish();
        b.finish();
        c2.finish();
        a.finish();

        let root = only_root(&sink);
        let a = root.root_node();
        assert_eq!(child_ids(a), vec!["c1", "b"]);
        assert!(!a.children()[0].is_serial());

        let b = &a.children()[1];
        assert_eq!(child_ids(b), vec!["d", "c3", "c2"]);
        assert_eq!(engine.diagnostics().protocol_errors, 0);
    }

    #[test]
    fn test_unfinished_collecting_closed_with_root() {
        let (engine, sink) = engine_with_sink();

        let m = engine.start("m");
        let a = engine.start_collecting("a");
        a.add_detail_measurement("x", 10);
        m.finish();

        let root = only_root(&sink);
        assert_eq!(child_ids(root.root_node()), vec!["a"]);
        assert!(a.is_finished());

        // finishing after the root is a reported no-op
        a.finish();
        assert_eq!(sink.len(), 1);
        assert!(!engine.has_running_measurement());
    }

    #[test]
    fn test_implicit_cascade_of_unfinished_children() {
        let (engine, sink) = engine_with_sink();

        let m = engine.start("m");
        let a = engine.start("a");
        let b = engine.start("b");
        m.finish();

        assert!(a.is_finished());
        assert!(b.is_finished());

        let root = only_root(&sink);
        let m = root.root_node();
        assert_eq!(child_ids(m), vec!["a"]);
        assert_eq!(child_ids(&m.children()[0]), vec!["b"]);
        assert!(!engine.has_running_measurement());
    }

    #[test]
    fn test_double_finish_reported() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start("a");
        a.finish();
        a.finish();

        assert_eq!(sink.len(), 1);
        assert_eq!(engine.diagnostics().protocol_errors, 1);
    }

    #[test]
    fn test_measure_finishes_on_panic() {
        let (engine, sink) = engine_with_sink();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.measure("outer", |_| {
                engine.measure("inner", |_| panic!("workload failure"));
            })
        }));

        assert!(result.is_err());
        let root = only_root(&sink);
        assert_eq!(root.root_node().identifier(), "outer");
        assert_eq!(child_ids(root.root_node()), vec!["inner"]);
        assert!(!engine.has_running_measurement());
    }

    #[test]
    fn test_measure_returns_value() {
        let (engine, sink) = engine_with_sink();

        let sum = engine.measure("sum", |m| {
            m.add_parameter("n", "3");
            (1..=3).sum::<u32>()
        });

        assert_eq!(sum, 6);
        assert_eq!(only_root(&sink).root_node().parameters().get("n").unwrap(), "3");
    }

    #[test]
    fn test_threads_build_separate_trees() {
        let (engine, sink) = engine_with_sink();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    engine.measure(&format!("worker-{}", i), |_| {
                        engine.start("step").finish();
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let roots = sink.roots();
        assert_eq!(roots.len(), 4);
        for root in roots {
            assert!(root.root_node().identifier().starts_with("worker-"));
            assert_eq!(child_ids(root.root_node()), vec!["step"]);
        }
    }
}

// =============================================================================
// Timing
// =============================================================================

mod timer_tests {
    use super::*;

    #[test]
    fn test_serial_timer_recording() {
        let (engine, sink, timer) = engine_with_timer();

        let m = engine.start("m");
        timer.advance(100 * MS);
        let a = engine.start("a");
        timer.advance(200 * MS);
        a.finish();
        engine.start("b").finish();
        timer.advance(100 * MS);
        m.finish();

        let root = only_root(&sink);
        let m = root.root_node();
        assert_eq!(m.duration_nanos(), 400 * MS);
        assert_eq!(m.children()[0].duration_nanos(), 200 * MS);
        assert_eq!(m.children()[1].duration_nanos(), 0);
        assert_eq!(m.self_time_nanos(), 200 * MS);
    }

    #[test]
    fn test_parallel_timer_recording() {
        let (engine, sink, timer) = engine_with_timer();

        let m = engine.start("m");
        timer.advance(100 * MS);
        let a1 = engine.start_parallel("a1");
        timer.advance(100 * MS);
        let a2 = engine.start_parallel("a2");
        timer.advance(100 * MS);
        a1.finish();
        timer.advance(100 * MS);
        a2.finish();
        timer.advance(100 * MS);
        m.finish();

        let root = only_root(&sink);
        let m = root.root_node();
        assert_eq!(m.duration_nanos(), 500 * MS);
        assert_eq!(child_ids(m), vec!["a1", "a2"]);
        assert_eq!(m.children()[0].duration_nanos(), 200 * MS);
        assert_eq!(m.children()[1].duration_nanos(), 200 * MS);
        // parallel children do not reduce the parent's self time
        assert_eq!(m.self_time_nanos(), 500 * MS);
    }

    #[test]
    fn test_collecting_timer_recording() {
        let (engine, sink, timer) = engine_with_timer();

        let m = engine.start("m");
        timer.advance(100 * MS);
        let a1 = engine.start_collecting("a1");
        let a2 = engine.start_collecting("a2");

        for _ in 0..2 {
            a1.start_detail("x");
            timer.advance(100 * MS);
            a2.start_detail("x");
            timer.advance(100 * MS);
            a1.finish_detail();
            a2.finish_detail();
        }

        a1.start_detail("y");
        timer.advance(100 * MS);
        a2.start_detail("y");
        timer.advance(100 * MS);
        a1.finish_detail();
        a2.finish_detail();
        a1.add_detail_measurement("y", 123 * MS);

        assert_eq!(a1.total_duration_nanos(), 723 * MS);
        assert_eq!(a1.details().get("x").unwrap().count, 2);

        a1.finish();
        a2.finish();
        m.finish();

        let root = only_root(&sink);
        let m = root.root_node();
        assert_eq!(child_ids(m), vec!["a1", "a2"]);

        let a1 = &m.children()[0];
        assert_eq!(a1.duration_nanos(), 723 * MS);
        assert_eq!(child_ids(a1), vec!["x", "y"]);
        assert_eq!(a1.children()[0].duration_nanos(), 400 * MS);
        assert_eq!(a1.children()[1].duration_nanos(), 323 * MS);
        assert_eq!(a1.children()[1].parameters().get("count").unwrap(), "2");

        let a2 = &m.children()[1];
        assert_eq!(a2.duration_nanos(), 300 * MS);
        assert_eq!(a2.children()[0].duration_nanos(), 200 * MS);
        assert_eq!(a2.children()[1].duration_nanos(), 100 * MS);
    }
}

// =============================================================================
// Top-Level Collecting Measurements
// =============================================================================

mod top_level_collecting_tests {
    use super::*;

    #[test]
    fn test_top_level_collecting_discarded() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start_collecting("a");
        a.detail("x", |_| ());
        a.finish();

        assert!(sink.is_empty());
        assert_eq!(sink.num_started(), 0);
        assert!(!engine.has_running_measurement());
    }

    #[test]
    fn test_nested_top_level_collecting_discarded() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start_collecting("a");
        let b = engine.start_collecting("b");
        a.finish();
        b.finish();

        assert!(sink.is_empty());
        assert!(!engine.has_running_measurement());

        // the thread starts fresh afterwards
        engine.start("c").finish();
        assert_eq!(only_root(&sink).root_node().identifier(), "c");
    }

    #[test]
    fn test_top_level_collecting_and_simple_root() {
        let (engine, sink) = engine_with_sink();

        let a = engine.start_collecting("a");
        engine.start("m").finish();
        a.finish();

        let root = only_root(&sink);
        assert_eq!(root.root_node().identifier(), "m");
        assert!(root.root_node().children().is_empty());
        assert!(!engine.has_running_measurement());
    }
}

// =============================================================================
// Leak Guard and Flows
// =============================================================================

mod guard_tests {
    use super::*;
    use perftree::CorrelationId;

    #[test]
    fn test_memory_leak_guard() {
        let (engine, sink) = engine_with_sink();

        for _ in 0..10_000 {
            let _leaked = engine.start("a");
        }

        assert_eq!(sink.num_started(), 100);
        assert_eq!(sink.len(), 99);
        for root in sink.roots() {
            assert!(root.is_killed());
            assert_eq!(root.root_node().total_node_count(), 100);
        }
        assert_eq!(engine.diagnostics().leak_guard_trips, 99);
        assert!(engine.has_running_measurement());
    }

    #[test]
    fn test_flows_deduplicated() {
        let (engine, sink) = engine_with_sink();
        let first = CorrelationId::new("http", "1");
        let second = CorrelationId::new("http", "2");

        engine.start_flow(first.clone());
        engine.join_flow(first.clone());

        let m = engine.start("m");
        engine.start_flow(first.clone());
        engine.start_flow(first.clone());
        engine.start_flow(second.clone());
        engine.join_flow(second.clone());
        engine.join_flow(first.clone());
        m.finish();

        assert_eq!(engine.diagnostics().protocol_errors, 2);
        let root = only_root(&sink);
        assert_eq!(root.started_flows().len(), 2);
        assert_eq!(root.joined_flows().len(), 2);
        assert!(root.started_flows().contains(&first));
        assert!(root.joined_flows().contains(&second));
    }

    #[test]
    fn test_top_level_parallel_rejected() {
        let (engine, sink) = engine_with_sink();

        let p = engine.start_parallel("p");
        assert!(p.is_detached());
        p.finish();
        engine.start("m").finish();

        assert_eq!(engine.diagnostics().protocol_errors, 1);
        assert_eq!(only_root(&sink).root_node().identifier(), "m");
    }
}

// =============================================================================
// Sinks and Probes
// =============================================================================

mod collaborator_tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    use once_cell::sync::OnceCell;
    use perftree::config::EngineConfig;
    use perftree::probe::{
        EnvVarProbe, EnvironmentCollector, EnvironmentProbe, Mementos, ScalarProbe, ScalarResults,
    };
    use perftree::robust::{BreakerState, CollaboratorKind};
    use perftree::{Error, Result, ScalarDataPoint};

    struct PanickingSink;

    impl DataSink for PanickingSink {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_finished(&self, _root: &HierarchicalDataRoot) -> Result<()> {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_failing_sink_isolated() {
        let sink = Arc::new(InMemoryDataSink::new());
        let engine = Engine::builder()
            .timer(Arc::new(ManualTimer::new()))
            .data_sink(Arc::new(PanickingSink))
            .data_sink(sink.clone())
            .without_sampler_thread()
            .build()
            .unwrap();

        engine.start("a").finish();
        engine.start("b").finish();

        assert_eq!(sink.len(), 2);
        let panicking = engine
            .collaborators()
            .into_iter()
            .find(|c| c.name == "panicking")
            .unwrap();
        assert_eq!(panicking.state, BreakerState::Disabled);
        assert_eq!(engine.diagnostics().collaborators_disabled, 1);
    }

    /// Starts a measurement of its own from inside the callback
    struct ReentrantSink {
        engine: OnceCell<Weak<Engine>>,
        calls: AtomicUsize,
    }

    impl DataSink for ReentrantSink {
        fn name(&self) -> &str {
            "reentrant"
        }

        fn on_finished(&self, root: &HierarchicalDataRoot) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if root.root_node().identifier() == "outer" {
                if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                    engine.start("from-sink").finish();
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_sink_may_start_measurements() {
        let sink = Arc::new(ReentrantSink {
            engine: OnceCell::new(),
            calls: AtomicUsize::new(0),
        });
        let engine = Engine::builder()
            .data_sink(sink.clone())
            .without_sampler_thread()
            .build()
            .unwrap();
        sink.engine.set(Arc::downgrade(&engine)).unwrap();

        engine.start("outer").finish();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.diagnostics().roots_dispatched, 2);
        assert!(!engine.has_running_measurement());
    }

    /// Takes 200ms of injected time per call
    struct SlowProbe {
        timer: Arc<ManualTimer>,
    }

    impl ScalarProbe for SlowProbe {
        fn name(&self) -> &str {
            "slow"
        }

        fn contribute(&self, results: &mut ScalarResults, ts: i64, _: &Mementos) -> Result<()> {
            self.timer.advance(200 * MS);
            results.insert("slow".to_string(), ScalarDataPoint::new(ts, "slow", 1, 0));
            Ok(())
        }
    }

    struct ErrorProbe;

    impl ScalarProbe for ErrorProbe {
        fn name(&self) -> &str {
            "error"
        }

        fn contribute(&self, results: &mut ScalarResults, ts: i64, _: &Mementos) -> Result<()> {
            results.insert("partial".to_string(), ScalarDataPoint::new(ts, "partial", 1, 0));
            Err(Error::probe("error", "device vanished"))
        }
    }

    struct ConstantProbe;

    impl ScalarProbe for ConstantProbe {
        fn name(&self) -> &str {
            "constant"
        }

        fn contribute(&self, results: &mut ScalarResults, ts: i64, _: &Mementos) -> Result<()> {
            results.insert("answer".to_string(), ScalarDataPoint::new(ts, "answer", 42, 0));
            Ok(())
        }
    }

    fn probe_state(engine: &Engine, name: &str) -> BreakerState {
        engine
            .collaborators()
            .into_iter()
            .find(|c| c.kind == CollaboratorKind::ScalarProbe && c.name == name)
            .unwrap()
            .state
    }

    #[test]
    fn test_slow_probe_disabled_after_repeated_timeouts() {
        let timer = Arc::new(ManualTimer::new());
        let engine = Engine::builder()
            .config(EngineConfig::default().with_measurement_timeout(Duration::from_millis(100), 3))
            .timer(timer.clone())
            .scalar_probe(SlowProbe {
                timer: timer.clone(),
            })
            .scalar_probe(ConstantProbe)
            .without_sampler_thread()
            .build()
            .unwrap();

        let mut slow_results = 0;
        for _ in 0..10 {
            let results = engine.get_scalar_measurements_with_delay(Duration::ZERO);
            assert_eq!(results.get("answer").unwrap().value, 42);
            if results.contains_key("slow") {
                slow_results += 1;
            }
        }

        // timed out, re-enabled, timed out, disabled
        assert_eq!(slow_results, 4);
        assert_eq!(probe_state(&engine, "slow"), BreakerState::Disabled);
        assert_eq!(probe_state(&engine, "constant"), BreakerState::Enabled);
    }

    #[test]
    fn test_failing_probe_contributes_nothing() {
        let engine = Engine::builder()
            .timer(Arc::new(ManualTimer::new()))
            .scalar_probe(ErrorProbe)
            .scalar_probe(ConstantProbe)
            .without_sampler_thread()
            .build()
            .unwrap();

        let results = engine.get_scalar_measurements_with_delay(Duration::ZERO);
        assert!(!results.contains_key("partial"));
        assert!(results.contains_key("answer"));
        assert_eq!(probe_state(&engine, "error"), BreakerState::Disabled);
    }

    #[test]
    fn test_timed_scalars_collected_per_cycle() {
        let engine = Engine::builder()
            .config(EngineConfig::default().with_max_history_per_metric(2))
            .timer(Arc::new(ManualTimer::new()))
            .timed_scalar_probe(ConstantProbe)
            .without_sampler_thread()
            .build()
            .unwrap();

        for _ in 0..3 {
            engine.run_sampling_cycle();
        }

        let history = engine.timed_scalar_measurements();
        let answers = history.get("answer").unwrap();
        assert_eq!(answers.len(), 2);
        assert!(answers.iter().all(|p| p.value == 42));
    }

    struct StaticEnvironment;

    impl EnvironmentProbe for StaticEnvironment {
        fn name(&self) -> &str {
            "static"
        }

        fn contribute(&self, collector: &mut EnvironmentCollector) -> Result<()> {
            collector.add(&["os", "name"], "linux");
            Ok(())
        }
    }

    #[test]
    fn test_environment_measurements() {
        let engine = Engine::builder()
            .environment_probe(StaticEnvironment)
            .environment_probe(EnvVarProbe::new())
            .without_sampler_thread()
            .build()
            .unwrap();

        let data = engine.environment_measurements();
        assert!(data
            .iter()
            .any(|d| d.name == ["os", "name"] && d.value == "linux"));
    }

    #[test]
    fn test_synthetic_measurement_dispatched() {
        let (engine, sink) = engine_with_sink();

        let child = HierarchicalData::new(true, 1_000, 5, "child", BTreeMap::new(), vec![], false);
        let node = HierarchicalData::new(
            true,
            1_000,
            20,
            "synthetic",
            BTreeMap::new(),
            vec![child],
            false,
        );
        let root = HierarchicalDataRoot::new(node, Default::default(), Default::default(), false);
        engine.inject_synthetic_measurement(root.clone());

        assert_eq!(sink.started(), vec!["synthetic".to_string()]);
        assert_eq!(only_root(&sink), root);
    }

    #[test]
    fn test_finished_tree_json_round_trip() {
        let (engine, sink) = engine_with_sink();

        engine.measure("a", |m| {
            m.add_parameter("k", "v");
            engine.start("b").finish();
        });

        let root = only_root(&sink);
        let json = root.to_json().unwrap();
        let parsed = HierarchicalDataRoot::from_json(&json).unwrap();
        assert_eq!(parsed, root);
    }
}
