use amqprs::callbacks::ChannelCallback;
use amqprs::channel::Channel;
use amqprs::error::Error as AmqpError;
use amqprs::{Ack, BasicProperties, Cancel, CloseChannel, Nack, Return};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, trace, warn};
use ping_crab::loop_with_stop;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// What the broker told us about a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Confirmed { delivery_tag: u64 },
    Rejected { delivery_tag: u64 },
    Returned { description: String },
}

/// Forwards publisher confirms of a channel to the delivery listener. Never blocks the
/// channel's event loop.
pub struct ConfirmCallback {
    event_tx: UnboundedSender<DeliveryEvent>,
}

impl ConfirmCallback {
    pub fn new(event_tx: UnboundedSender<DeliveryEvent>) -> Self {
        Self { event_tx }
    }

    fn forward(&self, event: DeliveryEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("Delivery listener is gone, dropping event.");
        }
    }
}

#[async_trait]
impl ChannelCallback for ConfirmCallback {
    async fn close(&mut self, _channel: &Channel, close: CloseChannel) -> Result<(), AmqpError> {
        warn!("Broker closed the publishing channel: {:?}", close);
        Ok(())
    }

    async fn cancel(&mut self, _channel: &Channel, cancel: Cancel) -> Result<(), AmqpError> {
        warn!("Broker cancelled a consumer on the publishing channel: {:?}", cancel);
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, active: bool) -> Result<bool, AmqpError> {
        debug!("Broker requested flow active={}", active);
        Ok(active)
    }

    async fn publish_ack(&mut self, _channel: &Channel, ack: Ack) {
        self.forward(DeliveryEvent::Confirmed {
            delivery_tag: ack.delivery_tag(),
        });
    }

    async fn publish_nack(&mut self, _channel: &Channel, nack: Nack) {
        self.forward(DeliveryEvent::Rejected {
            delivery_tag: nack.delivery_tag(),
        });
    }

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        ret: Return,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        self.forward(DeliveryEvent::Returned {
            description: format!(
                "{:?} - {}",
                ret,
                String::from_utf8_lossy(&content)
            ),
        });
    }
}

/// Logs failed deliveries until stopped. There is no retry, the next probing round
/// produces a fresh record anyways.
pub async fn listen(
    event_rx: UnboundedReceiver<DeliveryEvent>,
    stop_rx: CancellationToken,
) -> Result<()> {
    DeliveryListener::default().run(event_rx, stop_rx).await
}

#[derive(Default)]
struct DeliveryListener {
    confirmed: u64,
    failed: u64,
}

impl DeliveryListener {
    async fn run(
        mut self,
        mut event_rx: UnboundedReceiver<DeliveryEvent>,
        stop_rx: CancellationToken,
    ) -> Result<()> {
        let outcome = self.consume(&mut event_rx, stop_rx).await;
        debug!(
            "Delivery listener done: {} confirmed, {} failed.",
            self.confirmed, self.failed
        );
        outcome
    }

    async fn consume(
        &mut self,
        event_rx: &mut UnboundedReceiver<DeliveryEvent>,
        stop_rx: CancellationToken,
    ) -> Result<()> {
        loop_with_stop!(
            recv "delivery listener", stop_rx,
            event_rx => on_event(it) on self
        )
    }

    async fn on_event(&mut self, event: DeliveryEvent) -> Result<()> {
        match event {
            DeliveryEvent::Confirmed { delivery_tag } => {
                self.confirmed += 1;
                trace!("Broker confirmed message {}", delivery_tag);
            }
            DeliveryEvent::Rejected { delivery_tag } => {
                self.failed += 1;
                error!("Broker rejected message {}, it is lost.", delivery_tag);
            }
            DeliveryEvent::Returned { description } => {
                self.failed += 1;
                error!("Broker returned unroutable message: {}", description);
            }
        }
        Ok(())
    }
}
