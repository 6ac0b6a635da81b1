use amqprs::channel::BasicPublishArguments;
use amqprs::BasicProperties;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ping_crab::helpers::rabbit::RabbitHandle;
use queue_models::probe_record::ProbeRecord;
use queue_models::RoutedMessage;

use crate::publish::RecordPublisher;

/// Publishes records as JSON to an exchange. The broker's verdict arrives later through
/// the channel's confirm callback, so a successful return only means "handed to the broker".
pub struct RabbitPublisher<'han> {
    handle: &'han RabbitHandle,
    exchange_name: String,
    pretty_print: bool,
}

impl<'han> RabbitPublisher<'han> {
    pub fn new(handle: &'han RabbitHandle, exchange_name: String, pretty_print: bool) -> Self {
        Self {
            handle,
            exchange_name,
            pretty_print,
        }
    }

    fn to_bin(&self, record: &ProbeRecord) -> Result<Vec<u8>> {
        if self.pretty_print {
            serde_json::to_vec_pretty(record)
        } else {
            serde_json::to_vec(record)
        }
        .with_context(|| format!("during serialisation of {:?}", record))
    }
}

/// Mandatory, so the broker returns messages no queue is bound for instead of silently
/// confirming and dropping them.
fn publish_args(exchange_name: &str, record: &ProbeRecord) -> BasicPublishArguments {
    let mut args = BasicPublishArguments::new(exchange_name, record.routing_key());
    args.mandatory = true;
    args
}

#[async_trait]
impl RecordPublisher for RabbitPublisher<'_> {
    async fn publish(&self, record: &ProbeRecord) -> Result<()> {
        let args = publish_args(&self.exchange_name, record);
        let bin = self.to_bin(record)?;
        self.handle
            .chan()
            .basic_publish(BasicProperties::default(), bin, args)
            .await
            .context("during publish")?;
        Ok(())
    }
}
