use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use ping_crab::helpers::rabbit::{ConfigureRabbit, RabbitHandle};
use ping_crab::helpers::report::ErrorReporter;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchAggregator;
use crate::store::RecordStore;

mod receive;

#[derive(Args, Clone, Debug)]
#[group(id = "rabbit")]
pub struct Params {
    /// URI for AMQP (RabbitMQ) server to connect to.
    /// Environment variable: AMQP_URI
    /// If a password is required, it is recommended to specify the URL over the environment or
    /// a config file, to avoid exposure in shell history and process list.
    #[arg(long, env = "AMQP_URI")]
    amqp_uri: String,

    /// Name of the queue to set up & listen to.
    #[arg(long, env = "IN_QUEUE_NAME", default_value = "ping-crab.probe-record.aggregate")]
    in_queue_name: String,

    /// Name of the exchange to bind the queue to.
    #[arg(long, env = "IN_EXCHANGE_NAME", default_value = "ping-crab.probe-record")]
    in_exchange_name: String,
}

pub async fn run<S: RecordStore>(
    aggregator: Arc<BatchAggregator<S>>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
    params: Params,
) -> Result<()> {
    let handle = prepare(&params).await?;
    receive::run(&handle, params.in_queue_name, aggregator, errors, stop_rx).await
}

async fn prepare(params: &Params) -> Result<RabbitHandle> {
    let handle = RabbitHandle::connect(params.amqp_uri.as_str(), "aggregator").await?;

    let queue_name = params.in_queue_name.as_str();
    let in_exchange_name = params.in_exchange_name.as_str();
    let configure = ConfigureRabbit::new(&handle);

    // Declared here as well, so it doesn't matter which side starts first
    configure
        .declare_exchange(in_exchange_name, "fanout").await?
        .declare_queue(queue_name).await?
        .bind_queue_to(queue_name, in_exchange_name).await?;

    Ok(handle)
}
