use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures::executor;
use futures::future::join_all;
use log::error;
use ping_crab::helpers::stop::{self, flatten};
use ping_crab::helpers::{bootstrap, logging, report};
use tokio::sync::mpsc;
use tokio::try_join;

use crate::registry::TargetRegistry;

/// Finds the addresses worth probing.
mod discover;
/// Measures the round-trip time to a single address.
mod probe;
/// Publishes probe records, decoupled from the transport.
mod publish;
/// Handles connection setup & sending of messages to RabbitMQ.
mod rabbit;
/// Keeps the current set of probe targets up to date.
mod registry;
/// Fans each probing round out to a fixed pool of workers.
mod schedule;

#[cfg(test)]
mod test_utils;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[clap(flatten)]
    registry: registry::Params,

    #[clap(flatten)]
    schedule: schedule::Params,

    #[clap(flatten)]
    rabbit: rabbit::Params,
}

fn main() -> Result<()> {
    bootstrap::run("pinger", Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

fn do_run(cli: Cli) -> Result<()> {
    let sig_handler = stop::new();
    let stop_rx = sig_handler.subscribe_stop();
    tokio::spawn(async move {
        if let Err(e) = sig_handler.wait_for_signal().await {
            error!("Signal handler failed: {:?}", e);
        }
    });

    let (registry_errors, registry_drain) = report::channel("target registry", stop_rx.clone());
    let (schedule_errors, schedule_drain) = report::channel("probe scheduler", stop_rx.clone());
    let (publish_errors, publish_drain) = report::channel("result publisher", stop_rx.clone());
    let drain_handles = [registry_drain, schedule_drain, publish_drain]
        .map(|drain| tokio::spawn(report::drain(drain)));

    let registry = Arc::new(TargetRegistry::default());
    // Hand-off point between the probe workers and the publisher
    let (record_tx, record_rx) = mpsc::channel(1);

    let registry_handle = tokio::spawn(registry::run(
        registry.clone(),
        cli.registry.to_source(),
        registry_errors,
        stop_rx.clone(),
        cli.registry,
    ));
    let prober = Arc::new(cli.schedule.to_prober());
    let schedule_handle = tokio::spawn(schedule::run(
        registry,
        prober,
        record_tx,
        schedule_errors,
        stop_rx.clone(),
        cli.schedule,
    ));
    let rabbit_handle = tokio::spawn(rabbit::run(
        record_rx,
        publish_errors,
        stop_rx.clone(),
        cli.rabbit,
    ));

    let result: Result<()> = executor::block_on(async {
        try_join!(
            flatten(registry_handle),
            flatten(schedule_handle),
            flatten(rabbit_handle)
        )?;
        Ok(())
    });
    // A failed stage takes the others down with it
    stop_rx.cancel();
    executor::block_on(join_all(drain_handles));
    result
}
