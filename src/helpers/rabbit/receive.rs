use amqprs::channel::{BasicConsumeArguments, BasicRejectArguments, ConsumerMessage};
use amqprs::Deliver;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{log_enabled, trace, warn, Level};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::loop_with_stop;

use super::RabbitHandle;

/// Consumes `queue_name` on the handle's channel until stopped or until the broker closes
/// the consumer. Messages are decoded as JSON into the handler's model. Acks are up to the
/// [MessageHandler]; undecodable or incomplete messages are rejected without requeue.
pub async fn run<HandlerType>(
    handle: &RabbitHandle,
    queue_name: String,
    msg_handler: HandlerType,
    stop_rx: CancellationToken,
) -> Result<()>
where
    HandlerType: MessageHandler,
{
    JsonReceiver {
        handle,
        queue_name,
        msg_handler,
    }
    .run(stop_rx)
    .await
    .context("while listening for RabbitMQ messages")
}

pub struct JsonReceiver<'han, HandlerType> {
    pub handle: &'han RabbitHandle,
    pub queue_name: String,
    pub msg_handler: HandlerType,
}

/// Receives decoded messages. Gets the [Deliver] so it can ack on the same channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Model: for<'any_de> Deserialize<'any_de> + Send;

    async fn handle_msg(&self, model: Self::Model, deliver: Deliver) -> Result<()>;

    fn consumer_tag() -> String;
}

impl<HandlerType: MessageHandler> JsonReceiver<'_, HandlerType> {
    pub async fn run(mut self, stop_rx: CancellationToken) -> Result<()> {
        let mut rabbit_rx = self.start_consumer().await?;
        let task_name = format!("receiver for {}", self.queue_name);

        loop_with_stop!(
            recv task_name, stop_rx,
            rabbit_rx => handle_msg(it) on self
        )
    }

    async fn start_consumer(&self) -> Result<mpsc::UnboundedReceiver<ConsumerMessage>> {
        let consume_args =
            BasicConsumeArguments::new(&self.queue_name, &HandlerType::consumer_tag());
        let (_, rabbit_rx) = self
            .handle
            .chan()
            .basic_consume_rx(consume_args)
            .await
            .context("while starting consumer")?;
        Ok(rabbit_rx)
    }

    async fn handle_msg(&mut self, msg: ConsumerMessage) -> Result<()> {
        match (msg.content, msg.deliver) {
            (Some(content), Some(deliver)) => self.parse_and_pass(content, deliver).await,
            (_, deliver) => {
                warn!("Received incomplete message from RabbitMQ, dropping it");
                match deliver {
                    Some(deliver) => self.reject_msg(deliver.delivery_tag()).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn parse_and_pass(&mut self, content: Vec<u8>, deliver: Deliver) -> Result<()> {
        let content_slice = content.as_slice();
        if log_enabled!(Level::Trace) {
            trace!("Got from RabbitMQ: {:?}", try_parse_utf8(content_slice));
        }
        match serde_json::from_slice(content_slice) {
            Ok(model) => self
                .msg_handler
                .handle_msg(model, deliver)
                .await
                .context("while handling message"),
            Err(e) => {
                warn!(
                    "Unable to parse RabbitMQ message: {:?} - {:?} (rejecting)",
                    e,
                    try_parse_utf8(content_slice)
                );
                self.reject_msg(deliver.delivery_tag()).await
            }
        }
    }

    async fn reject_msg(&self, delivery_tag: u64) -> Result<()> {
        self.handle
            .chan()
            .basic_reject(BasicRejectArguments::new(
                delivery_tag,
                /* requeue = */ false,
            ))
            .await
            .context("during immediate reject")?;
        Ok(())
    }
}

fn try_parse_utf8(content: &[u8]) -> &str {
    std::str::from_utf8(content).unwrap_or("<< not UTF-8 >>")
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion};

    use super::*;

    #[test]
    fn shows_json_payload() {
        assert_that!(try_parse_utf8(br#"{"address":"10.0.0.1"}"#))
            .is_equal_to(r#"{"address":"10.0.0.1"}"#);
    }

    #[test]
    fn masks_binary_payload() {
        assert_that!(try_parse_utf8(&[0xff, 0xfe, 0x00])).is_equal_to("<< not UTF-8 >>");
    }
}
