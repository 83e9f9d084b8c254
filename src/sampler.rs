//! Timed Scalar Sampler
//!
//! Samples all timed scalar probes on one dedicated thread at a fixed period
//! and keeps a bounded history per metric.
//!
//! # Cycle
//!
//! ```text
//! tick ─▶ contribute(all probes, mementos of previous cycle)
//!      ─▶ fold values into per-metric ring buffers
//!      ─▶ prepare(all probes) for the next cycle
//! ```
//!
//! Rates are therefore averaged over one sampling period. The probe list is
//! replaced as a whole on registration; a running cycle keeps iterating the
//! list it loaded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::is_globally_disabled;
use crate::data::{RingBuffer, ScalarDataPoint};
use crate::error::Result;
use crate::probe::{Mementos, ScalarResults};
use crate::robust::RobustScalarProbe;

pub struct TimedScalarSampler {
    probes: ArcSwap<Vec<Arc<RobustScalarProbe>>>,
    history: RwLock<BTreeMap<String, RingBuffer<ScalarDataPoint>>>,
    max_history_per_metric: usize,
    /// State handed from one cycle's `prepare` to the next cycle's `contribute`
    mementos: Mutex<Mementos>,
    cycles: AtomicU64,
}

impl TimedScalarSampler {
    pub fn new(max_history_per_metric: usize) -> Self {
        Self {
            probes: ArcSwap::from_pointee(Vec::new()),
            history: RwLock::new(BTreeMap::new()),
            max_history_per_metric,
            mementos: Mutex::new(Mementos::new()),
            cycles: AtomicU64::new(0),
        }
    }

    /// Register a probe. Takes effect with the next cycle.
    pub fn add_probe(&self, probe: Arc<RobustScalarProbe>) {
        self.probes.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(probe.clone());
            next
        });
    }

    pub fn probes(&self) -> Arc<Vec<Arc<RobustScalarProbe>>> {
        self.probes.load_full()
    }

    /// Number of completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Run one sampling cycle on the calling thread
    pub fn run_cycle(&self) {
        if is_globally_disabled() {
            return;
        }

        let probes = self.probes.load_full();
        let timestamp_millis = Utc::now().timestamp_millis();
        let mut results = ScalarResults::new();

        {
            let mut mementos = self.mementos.lock();
            for probe in probes.iter() {
                probe.contribute(&mut results, timestamp_millis, &mementos);
            }
            mementos.clear();
            for probe in probes.iter() {
                probe.prepare(&mut mementos);
            }
        }

        if !results.is_empty() {
            let mut history = self.history.write();
            for (name, point) in results {
                history
                    .entry(name)
                    .or_insert_with(|| RingBuffer::new(self.max_history_per_metric))
                    .put(point);
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(cycle, probes = probes.len(), "sampling cycle complete");
    }

    /// Chronological history of every metric seen so far
    pub fn measurements(&self) -> BTreeMap<String, Vec<ScalarDataPoint>> {
        self.history
            .read()
            .iter()
            .map(|(name, buffer)| (name.clone(), buffer.snapshot()))
            .collect()
    }

    /// Shut down every registered probe
    pub fn shutdown_probes(&self) {
        for probe in self.probes.load().iter() {
            probe.shutdown();
        }
    }

    /// Start sampling every `period` on a dedicated thread. The first cycle
    /// runs immediately.
    pub fn start(self: &Arc<Self>, period: Duration) -> Result<SamplerHandle> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let sampler = self.clone();

        let join = thread::Builder::new()
            .name("perftree-sampler".to_string())
            .spawn(move || {
                info!(period_ms = period.as_millis() as u64, "Timed scalar sampler started");
                let ticker = channel::tick(period);
                sampler.run_cycle();
                loop {
                    channel::select! {
                        recv(ticker) -> _ => sampler.run_cycle(),
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                info!("Timed scalar sampler stopped");
            })?;

        Ok(SamplerHandle {
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

impl std::fmt::Debug for TimedScalarSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedScalarSampler")
            .field("probes", &self.probes.load().len())
            .field("metrics", &self.history.read().len())
            .field("max_history_per_metric", &self.max_history_per_metric)
            .field("cycles", &self.cycles())
            .finish()
    }
}

/// Stops the sampler thread when [`stop`](Self::stop)ped or dropped
#[derive(Debug)]
pub struct SamplerHandle {
    shutdown_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Signal the thread and wait for the running cycle to end
    pub fn stop(&mut self) {
        // disconnecting the channel wakes the select
        self.shutdown_tx.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Timed scalar sampler thread panicked");
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
