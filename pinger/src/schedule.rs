use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Args;
use log::{debug, info, trace};
use ping_crab::helpers::report::ErrorReporter;
use ping_crab::loop_with_stop;
use queue_models::probe_record::{ProbeRecord, ProbeTarget};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::probe::{self, PingCommand, Prober};
use crate::registry::TargetRegistry;

mod worker;

#[derive(Args, Clone, Debug)]
#[group(id = "schedule")]
pub struct Params {
    /// How often to probe every known target, in seconds
    #[arg(
        long,
        env = "PROBE_INTERVAL_SECS",
        default_value = "5",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    probe_interval_secs: u64,

    /// Upper bound for probes in flight at the same time
    #[arg(
        long,
        env = "PROBE_WORKERS",
        default_value = "8",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    probe_workers: u16,

    #[clap(flatten)]
    probe: probe::Params,
}

impl Params {
    pub fn to_prober(&self) -> PingCommand {
        self.probe.to_prober()
    }
}

pub async fn run(
    registry: Arc<TargetRegistry>,
    prober: Arc<dyn Prober>,
    record_tx: mpsc::Sender<ProbeRecord>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
    params: Params,
) -> Result<()> {
    let scheduler = Scheduler::new(
        registry,
        prober,
        params.probe_workers as usize,
        record_tx,
        errors,
        stop_rx.clone(),
    );
    scheduler
        .run(stop_rx, Duration::from_secs(params.probe_interval_secs))
        .await
}

/// Probes every target of the current registry snapshot once per tick, with a fixed-size
/// pool of workers per tick.
///
/// A tick only ends once all of its workers are done, so a slow round delays the next one
/// instead of overlapping with it. That keeps the number of probes in flight at or below
/// the worker count at all times.
pub struct Scheduler {
    registry: Arc<TargetRegistry>,
    prober: Arc<dyn Prober>,
    worker_count: usize,
    record_tx: mpsc::Sender<ProbeRecord>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TargetRegistry>,
        prober: Arc<dyn Prober>,
        worker_count: usize,
        record_tx: mpsc::Sender<ProbeRecord>,
        errors: ErrorReporter,
        stop_rx: CancellationToken,
    ) -> Self {
        Self {
            registry,
            prober,
            worker_count,
            record_tx,
            errors,
            stop_rx,
        }
    }

    async fn run(mut self, stop_rx: CancellationToken, period: Duration) -> Result<()> {
        info!(
            "Probe scheduler up & running with {} workers every {:?}.",
            self.worker_count, period
        );
        let mut trigger = interval_at(Instant::now() + period, period);
        trigger.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop_with_stop!(
            "probe scheduler", stop_rx,
            trigger.tick() => tick(it) on self as simple
        )
    }

    async fn tick(&mut self, _tick: Instant) -> Result<()> {
        let targets = self.registry.snapshot().await;
        if targets.is_empty() {
            trace!("No probe targets known, skipping round.");
            return Ok(());
        }
        let started = Instant::now();
        let target_count = targets.len();
        self.probe_all(targets).await;
        debug!(
            "Probing round for {} targets took {:?}.",
            target_count,
            started.elapsed()
        );
        Ok(())
    }

    /// Probes each of the targets exactly once and returns when all workers are done or the
    /// stop token was cancelled.
    pub async fn probe_all(&self, targets: Arc<Vec<ProbeTarget>>) {
        // Sized to fit the whole round, so the feeder never waits on the workers
        let (relay_tx, relay_rx) = mpsc::channel(targets.len().max(1));
        let relay_rx = Arc::new(tokio::sync::Mutex::new(relay_rx));

        let mut tasks = JoinSet::new();
        tasks.spawn(worker::feed(targets, relay_tx, self.stop_rx.clone()));
        for id in 0..self.worker_count {
            let worker = worker::Worker {
                id,
                prober: self.prober.clone(),
                relay_rx: relay_rx.clone(),
                record_tx: self.record_tx.clone(),
                errors: self.errors.clone(),
            };
            tasks.spawn(worker.run(self.stop_rx.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                self.errors
                    .report(anyhow!(e).context("probe worker crashed"))
                    .await;
            }
        }
    }
}
