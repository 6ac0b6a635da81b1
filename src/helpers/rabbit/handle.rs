use std::sync::Arc;

use amqprs::callbacks::ChannelCallback;
use amqprs::channel::{
    Channel, ConfirmSelectArguments, ExchangeDeclareArguments, QueueBindArguments,
    QueueDeclareArguments,
};
use amqprs::connection::{Connection, OpenConnectionArguments};
use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::debug;

pub struct RabbitHandle {
    connection: Arc<Connection>,
    channel: Channel,
}

impl RabbitHandle {
    pub async fn connect(amqp_uri: &str, conn_name: &str) -> Result<Self> {
        let mut connection_args = OpenConnectionArguments::try_from(amqp_uri)
            .with_context(|| format!("Invalid connection URI in {:?}", amqp_uri))?;
        connection_args.connection_name(&format!("{}@{}", conn_name, Local::now()));
        let connection = Connection::open(&connection_args)
            .await
            .with_context(|| format!("while opening RabbitMQ connection {:?}", amqp_uri))
            .context("Maybe double-check credentials?")?;
        let channel = Self::create_channel(&connection).await?;
        Ok(RabbitHandle {
            connection: Arc::new(connection),
            channel,
        })
    }

    async fn create_channel(conn: &Connection) -> Result<Channel> {
        let channel = conn
            .open_channel(None)
            .await
            .context("while opening RabbitMQ channel")?;
        debug!("Fresh RabbitMQ channel connected.");
        Ok(channel)
    }

    pub fn chan(&self) -> &Channel {
        &self.channel
    }

    /// Creates a new handle on the same connection but with a fresh channel.
    /// Channels should not be shared across tasks/threads as per upstream docs.
    pub async fn fork(&self) -> Result<RabbitHandle> {
        let channel = Self::create_channel(&self.connection).await?;
        Ok(RabbitHandle {
            connection: self.connection.clone(),
            channel,
        })
    }
}

pub struct ConfigureRabbit<'han> {
    handle: &'han RabbitHandle,
}

impl<'han> ConfigureRabbit<'han> {
    pub fn new(handle: &'han RabbitHandle) -> Self {
        ConfigureRabbit { handle }
    }

    fn chan(&self) -> &Channel {
        self.handle.chan()
    }

    pub async fn declare_queue(&self, name: &str) -> Result<&ConfigureRabbit<'han>> {
        let args = QueueDeclareArguments::new(name).durable(true).finish();
        self.chan()
            .queue_declare(args)
            .await
            .with_context(|| format!("while declaring queue {}", name))?
            .ok_or_else(|| anyhow!("queue_declare for {} returned no result w/o no_wait", name))?;
        Ok(self)
    }

    pub async fn declare_exchange(&self, name: &str, typ: &str) -> Result<&ConfigureRabbit<'han>> {
        let args = ExchangeDeclareArguments::new(name, typ)
            .durable(true)
            .finish();
        self.chan()
            .exchange_declare(args)
            .await
            .with_context(|| format!("while declaring exchange {}", name))?;
        Ok(self)
    }

    pub async fn bind_queue_to(
        &self,
        queue_name: &str,
        exchange_name: &str,
    ) -> Result<&ConfigureRabbit<'han>> {
        self.chan()
            .queue_bind(QueueBindArguments::new(queue_name, exchange_name, ""))
            .await
            .with_context(|| format!("while binding {}->{}", queue_name, exchange_name))?;
        Ok(self)
    }

    /// Puts the channel into confirm mode. The broker's acks/nacks/returns for everything
    /// published afterwards are delivered to `callback`.
    pub async fn enable_publisher_confirms<C>(&self, callback: C) -> Result<&ConfigureRabbit<'han>>
    where
        C: ChannelCallback + Send + 'static,
    {
        self.chan()
            .register_callback(callback)
            .await
            .context("while registering channel callback")?;
        self.chan()
            .confirm_select(ConfirmSelectArguments::default())
            .await
            .context("while enabling publisher confirms")?;
        Ok(self)
    }
}
