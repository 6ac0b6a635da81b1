use anyhow::Result;
use ping_crab::helpers::rabbit::{ConfigureRabbit, RabbitHandle};

use super::confirm::ConfirmCallback;
use super::Params;

pub async fn prepare(params: &Params, confirm_callback: ConfirmCallback) -> Result<RabbitHandle> {
    let handle = RabbitHandle::connect(params.amqp_uri.as_str(), "pinger").await?;

    let configure = ConfigureRabbit::new(&handle);
    configure
        .declare_exchange(&params.out_exchange_name, "fanout").await?
        .enable_publisher_confirms(confirm_callback).await?;

    Ok(handle)
}
