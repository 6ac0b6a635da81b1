use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use ping_crab::helpers::report::ErrorReporter;
use ping_crab::loop_with_stop;
use queue_models::probe_record::ProbeRecord;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(&self, record: &ProbeRecord) -> Result<()>;
}

/// Publishes each record handed over by the probe workers, in order of arrival, until the
/// workers are gone or the stop token is cancelled. A record that cannot be published is
/// reported and dropped.
pub async fn run<P: RecordPublisher>(
    publisher: P,
    record_rx: mpsc::Receiver<ProbeRecord>,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
) -> Result<()> {
    info!("Result publisher is ready.");
    ResultPublisher { publisher, errors }
        .run(record_rx, stop_rx)
        .await
}

struct ResultPublisher<P> {
    publisher: P,
    errors: ErrorReporter,
}

impl<P: RecordPublisher> ResultPublisher<P> {
    async fn run(
        mut self,
        mut record_rx: mpsc::Receiver<ProbeRecord>,
        stop_rx: CancellationToken,
    ) -> Result<()> {
        loop_with_stop!(
            recv "result publisher", stop_rx,
            record_rx => forward(it) on self
        )
    }

    async fn forward(&mut self, record: ProbeRecord) -> Result<()> {
        debug!("Publishing {}", record);
        if let Err(e) = self.publisher.publish(&record).await {
            let e = e.context(format!("while publishing {}", record));
            self.errors.report(e).await;
        }
        Ok(())
    }
}
