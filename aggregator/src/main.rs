use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use db_model::persist;
use futures::executor;
use futures::future::join_all;
use log::{error, info};
use ping_crab::helpers::stop::{self, flatten};
use ping_crab::helpers::{bootstrap, logging, report};
use tokio::try_join;

use crate::batch::BatchAggregator;
use crate::store::DieselStore;

/// Serves stored records over HTTP.
mod api;
/// Buffers records & writes them to the store in batches.
mod batch;
/// Handles reception of probe records from RabbitMQ.
mod rabbit;
mod store;

#[cfg(test)]
mod test_utils;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[clap(flatten)]
    database: persist::Params,

    #[clap(flatten)]
    batch: batch::Params,

    #[clap(flatten)]
    rabbit: rabbit::Params,

    #[clap(flatten)]
    api: api::Params,
}

fn main() -> Result<()> {
    bootstrap::run("aggregator", Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

fn do_run(cli: Cli) -> Result<()> {
    persist::initialize(&cli.database)?;

    let sig_handler = stop::new();
    let stop_rx = sig_handler.subscribe_stop();
    tokio::spawn(async move {
        if let Err(e) = sig_handler.wait_for_signal().await {
            error!("Signal handler failed: {:?}", e);
        }
    });

    let (ingest_errors, ingest_drain) = report::channel("record ingestion", stop_rx.clone());
    let (flush_errors, flush_drain) = report::channel("batch flush", stop_rx.clone());
    let drain_handles =
        [ingest_drain, flush_drain].map(|drain| tokio::spawn(report::drain(drain)));

    let aggregator = Arc::new(BatchAggregator::new(DieselStore, cli.batch.max_size()));

    let flush_handle = tokio::spawn(batch::run_flush_timer(
        aggregator.clone(),
        flush_errors,
        stop_rx.clone(),
        cli.batch.flush_interval(),
    ));
    let rabbit_handle = tokio::spawn(rabbit::run(
        aggregator.clone(),
        ingest_errors,
        stop_rx.clone(),
        cli.rabbit,
    ));
    let api_handle = tokio::spawn(api::run(Arc::new(DieselStore), stop_rx.clone(), cli.api));

    let result: Result<()> = executor::block_on(async {
        try_join!(
            flatten(flush_handle),
            flatten(rabbit_handle),
            flatten(api_handle)
        )?;
        Ok(())
    });
    // A failed stage takes the others down with it
    stop_rx.cancel();
    executor::block_on(join_all(drain_handles));

    let remaining = executor::block_on(aggregator.buffered());
    info!("Attempting a final flush of {} buffered records.", remaining);
    if let Err(e) = executor::block_on(aggregator.flush()) {
        error!("Final flush failed, buffered records are lost: {:?}", e);
    }
    result
}
