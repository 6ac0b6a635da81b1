use std::sync::Arc;

use amqprs::channel::BasicAckArguments;
use amqprs::Deliver;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use ping_crab::helpers::rabbit::receive::{self as helpers_receive, MessageHandler};
use ping_crab::helpers::rabbit::RabbitHandle;
use ping_crab::helpers::report::ErrorReporter;
use queue_models::probe_record::ProbeRecord;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchAggregator;
use crate::store::RecordStore;

pub async fn run<S: RecordStore>(
    handle: &RabbitHandle,
    queue_name: String,
    aggregator: Arc<BatchAggregator<S>>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
) -> Result<()> {
    let handler = RecordHandler {
        handle,
        ingest: Ingest { aggregator, errors },
    };
    helpers_receive::run(handle, queue_name, handler, stop_rx).await
}

/// Acks each record as soon as it is received, then hands it to the aggregator.
/// From here on, the record's fate is up to the aggregator.
struct RecordHandler<'han, S> {
    handle: &'han RabbitHandle,
    ingest: Ingest<S>,
}

#[async_trait]
impl<S: RecordStore> MessageHandler for RecordHandler<'_, S> {
    type Model = ProbeRecord;

    async fn handle_msg(&self, model: Self::Model, deliver: Deliver) -> Result<()> {
        self.handle
            .chan()
            .basic_ack(BasicAckArguments::new(deliver.delivery_tag(), false))
            .await
            .context("during ack")?;
        self.ingest.accept(model).await;
        Ok(())
    }

    fn consumer_tag() -> String {
        "aggregator".to_string()
    }
}

struct Ingest<S> {
    aggregator: Arc<BatchAggregator<S>>,
    errors: ErrorReporter,
}

impl<S: RecordStore> Ingest<S> {
    /// A failing flush is reported, the consumer keeps going regardless.
    async fn accept(&self, record: ProbeRecord) {
        trace!("Received {}", record);
        if let Err(e) = self.aggregator.add(record).await {
            self.errors.report(e).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion};
    use ping_crab::helpers::report;

    use crate::test_utils::{record, MemoryStore};

    use super::*;

    #[tokio::test]
    async fn accepted_records_reach_store_once_batch_is_full() {
        // given
        let store = Arc::new(MemoryStore::default());
        let aggregator = Arc::new(BatchAggregator::new(store.clone(), 2));
        let (errors, mut drain) = report::channel("test ingest", CancellationToken::new());
        let ingest = Ingest { aggregator, errors };

        // when
        ingest.accept(record("10.0.0.1", 5)).await;
        ingest.accept(record("10.0.0.2", 7)).await;

        // then
        assert_that!(store.batch_sizes()).is_equal_to(vec![2]);
        drop(ingest);
        assert_that!(drain.recv().await.is_none()).is_true();
    }

    #[tokio::test]
    async fn failed_flush_is_reported_not_propagated() {
        // given
        let store = Arc::new(MemoryStore::default());
        store.set_failing(true);
        let aggregator = Arc::new(BatchAggregator::new(store.clone(), 1));
        let (errors, mut drain) = report::channel("test ingest", CancellationToken::new());
        let ingest = Ingest {
            aggregator: aggregator.clone(),
            errors,
        };

        // when
        ingest.accept(record("10.0.0.1", 5)).await;

        // then
        let reported = drain.recv().await.map(|it| format!("{:#}", it));
        assert_that!(reported.unwrap().contains("database is down")).is_true();
        assert_that!(aggregator.buffered().await).is_equal_to(0);
    }
}
