use anyhow::Error;
use log::{debug, error, trace};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors a stage may have in flight before reporters have to wait for the drain loop.
const REPORT_BUFFER: usize = 16;

/// Handle through which a pipeline stage reports operational errors to its supervisor.
///
/// Every task that may produce errors owns a clone. The receiving side closes once the
/// last clone is dropped, i.e. exactly once and only after all producers have exited.
#[derive(Clone, Debug)]
pub struct ErrorReporter {
    stage: &'static str,
    tx: mpsc::Sender<Error>,
    stop_rx: CancellationToken,
}

/// Receiving half of a stage's error channel, see [drain].
pub struct ErrorDrain {
    stage: &'static str,
    rx: mpsc::Receiver<Error>,
}

pub fn channel(stage: &'static str, stop_rx: CancellationToken) -> (ErrorReporter, ErrorDrain) {
    let (tx, rx) = mpsc::channel(REPORT_BUFFER);
    (
        ErrorReporter { stage, tx, stop_rx },
        ErrorDrain { stage, rx },
    )
}

impl ErrorReporter {
    /// Hands the error to the supervisor, or gives up as soon as the stop token is
    /// cancelled. Never blocks past cancellation.
    pub async fn report(&self, err: Error) {
        select! {
            biased;
            _ = self.stop_rx.cancelled() => {
                trace!("Dropping error of {} due to shutdown: {:?}", self.stage, err);
            }
            permit = self.tx.reserve() => match permit {
                Ok(permit) => permit.send(err),
                // Nobody is draining anymore, at least don't lose it silently
                Err(_) => error!("{} (undrained): {:?}", self.stage, err),
            }
        }
    }
}

impl ErrorDrain {
    /// Next reported error, `None` once every reporter is gone.
    pub async fn recv(&mut self) -> Option<Error> {
        self.rx.recv().await
    }
}

/// Supervising loop: logs everything that is reported and returns once the channel
/// closed. Errors are purely diagnostic here; nothing is fed back into the pipeline.
pub async fn drain(mut errors: ErrorDrain) {
    while let Some(err) = errors.recv().await {
        error!("{}: {:?}", errors.stage, err);
    }
    debug!("Error channel of {} closed, all producers are done.", errors.stage);
}
