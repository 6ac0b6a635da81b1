use anyhow::Result;
use clap::Args;
use queue_models::probe_record::ProbeRecord;
use ping_crab::helpers::report::ErrorReporter;
use tokio::sync::mpsc;
use tokio::try_join;
use tokio_util::sync::CancellationToken;

use crate::publish;

/// Logs what the broker thinks of our messages.
mod confirm;
/// Handles configuration and connection setup.
mod prepare;
mod send;

#[derive(Args, Clone, Debug)]
#[group(id = "rabbit")]
pub struct Params {
    /// URI for AMQP (RabbitMQ) server to connect to.
    /// Environment variable: AMQP_URI
    /// If a password is required, it is recommended to specify the URL over the environment or
    /// a config file, to avoid exposure in shell history and process list.
    #[arg(long, env = "AMQP_URI")]
    amqp_uri: String,

    /// Name of the exchange to publish probe records to.
    #[arg(long, env = "OUT_EXCHANGE_NAME", default_value = "ping-crab.probe-record")]
    out_exchange_name: String,

    /// Whether to pretty print JSON in RabbitMQ messages.
    #[arg(long, env = "PRETTY_PRINT")]
    pretty_print: bool,
}

pub async fn run(
    record_rx: mpsc::Receiver<ProbeRecord>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
    params: Params,
) -> Result<()> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handle = prepare::prepare(&params, confirm::ConfirmCallback::new(event_tx)).await?;

    let publisher = send::RabbitPublisher::new(&handle, params.out_exchange_name, params.pretty_print);
    let sender = publish::run(publisher, record_rx, errors, stop_rx.clone());
    let listener = confirm::listen(event_rx, stop_rx);
    try_join!(sender, listener)?;
    Ok(())
}
