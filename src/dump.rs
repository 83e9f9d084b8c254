//! Periodic dump of on-demand scalar measurements to the log
//!
//! The dumper holds only a weak reference to its engine and ends on its own
//! once the engine is dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{info, warn};

use crate::data::ScalarDataPoint;
use crate::engine::Engine;
use crate::error::Result;

/// Dump schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpSchedule {
    pub initial_delay: Duration,
    pub frequency: Duration,
    /// Passed to [`Engine::get_scalar_measurements_with_delay`]
    pub averaging_delay: Duration,
}

impl Default for DumpSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(0),
            frequency: Duration::from_secs(60),
            averaging_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
pub struct CyclicScalarDumper {
    shutdown_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl CyclicScalarDumper {
    pub fn start(engine: &Arc<Engine>, schedule: DumpSchedule) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let engine = Arc::downgrade(engine);

        let join = thread::Builder::new()
            .name("perftree-dumper".to_string())
            .spawn(move || run(engine, schedule, shutdown_rx))?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }

    /// Stop the dumper thread. A dump in progress completes first.
    pub fn stop(&mut self) {
        self.shutdown_tx.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Scalar dumper thread panicked");
            }
        }
    }
}

impl Drop for CyclicScalarDumper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(engine: Weak<Engine>, schedule: DumpSchedule, shutdown_rx: Receiver<()>) {
    channel::select! {
        recv(channel::after(schedule.initial_delay)) -> _ => {},
        recv(shutdown_rx) -> _ => return,
    }

    let ticker = channel::tick(schedule.frequency);
    loop {
        let Some(engine) = engine.upgrade() else {
            info!("Engine dropped, scalar dumper exiting");
            return;
        };
        let measurements = engine.get_scalar_measurements_with_delay(schedule.averaging_delay);
        drop(engine);

        for line in format_lines(&measurements) {
            info!("{}", line);
        }

        channel::select! {
            recv(ticker) -> _ => {},
            recv(shutdown_rx) -> _ => return,
        }
    }
}

/// One `Scalar Measurement: <name> = <value>` line per metric
pub fn format_lines(measurements: &BTreeMap<String, ScalarDataPoint>) -> Vec<String> {
    measurements
        .iter()
        .map(|(name, point)| format!("Scalar Measurement: {} = {}", name, point.formatted_value()))
        .collect()
}
