use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use log::{info, trace};
use ping_crab::helpers::report::ErrorReporter;
use ping_crab::loop_with_stop;
use queue_models::probe_record::ProbeRecord;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::store::RecordStore;

#[derive(Args, Clone, Debug)]
#[group(id = "batch")]
pub struct Params {
    /// Flush as soon as this many records are buffered
    #[arg(
        long,
        env = "BATCH_MAX_SIZE",
        default_value = "50",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    batch_max_size: u32,

    /// Flush whatever is buffered at least this often, in seconds
    #[arg(
        long,
        env = "BATCH_FLUSH_INTERVAL_SECS",
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    batch_flush_interval_secs: u64,
}

impl Params {
    pub fn max_size(&self) -> usize {
        self.batch_max_size as usize
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.batch_flush_interval_secs)
    }
}

/// Buffers incoming records and writes them to the store in batches of at most
/// `max_size` records.
///
/// The same lock guards appends and flushes and is held during the store call, so a slow
/// store stalls [BatchAggregator::add] callers. Failed batches are dropped, not retried.
pub struct BatchAggregator<S> {
    buffer: Mutex<Vec<ProbeRecord>>,
    max_size: usize,
    store: S,
}

impl<S: RecordStore> BatchAggregator<S> {
    pub fn new(store: S, max_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            store,
        }
    }

    /// Appends the record and flushes right away if that filled the buffer.
    pub async fn add(&self, record: ProbeRecord) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        buffer.push(record);
        if buffer.len() >= self.max_size {
            self.flush_locked(&mut buffer).await
        } else {
            Ok(())
        }
    }

    /// Writes everything buffered, if anything.
    pub async fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn flush_locked(&self, buffer: &mut Vec<ProbeRecord>) -> Result<()> {
        if buffer.is_empty() {
            trace!("Nothing buffered, skipping flush.");
            return Ok(());
        }
        let count = buffer.len();
        let res = self
            .store
            .upsert(&buffer[..])
            .await
            .with_context(|| format!("while flushing {} records (dropped)", count));
        buffer.clear();
        if res.is_ok() {
            info!("Flushed {} records.", count);
        }
        res
    }
}

/// Flushes the aggregator every `period` until stopped, reporting failed flushes.
pub async fn run_flush_timer<S: RecordStore>(
    aggregator: Arc<BatchAggregator<S>>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
    period: Duration,
) -> Result<()> {
    info!("Flushing batches at least every {:?}.", period);
    FlushTimer { aggregator, errors }.run(stop_rx, period).await
}

struct FlushTimer<S> {
    aggregator: Arc<BatchAggregator<S>>,
    errors: ErrorReporter,
}

impl<S: RecordStore> FlushTimer<S> {
    async fn run(mut self, stop_rx: CancellationToken, period: Duration) -> Result<()> {
        let mut trigger = interval_at(Instant::now() + period, period);
        trigger.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop_with_stop!(
            "flush timer", stop_rx,
            trigger.tick() => flush(it) on self as simple
        )
    }

    async fn flush(&mut self, _tick: Instant) -> Result<()> {
        if let Err(e) = self.aggregator.flush().await {
            self.errors.report(e).await;
        }
        Ok(())
    }
}
