use std::sync::Arc;

use chrono::Utc;
use log::trace;
use ping_crab::helpers::report::ErrorReporter;
use queue_models::probe_record::{ProbeRecord, ProbeTarget};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::probe::Prober;

/// Puts the round's targets onto the relay, then closes it by dropping the sender.
pub async fn feed(
    targets: Arc<Vec<ProbeTarget>>,
    relay_tx: mpsc::Sender<ProbeTarget>,
    stop_rx: CancellationToken,
) {
    for target in targets.iter() {
        select! {
            biased;
            _ = stop_rx.cancelled() => return,
            sent = relay_tx.send(target.clone()) => {
                if sent.is_err() {
                    return; // all workers gone
                }
            }
        }
    }
}

/// Takes targets off the shared relay until it runs dry, so every target of a round is
/// probed by exactly one worker.
pub struct Worker {
    pub id: usize,
    pub prober: Arc<dyn Prober>,
    pub relay_rx: Arc<Mutex<mpsc::Receiver<ProbeTarget>>>,
    pub record_tx: mpsc::Sender<ProbeRecord>,
    pub errors: ErrorReporter,
}

impl Worker {
    pub async fn run(self, stop_rx: CancellationToken) {
        loop {
            let next = select! {
                biased;
                _ = stop_rx.cancelled() => break,
                next = self.next_target() => next,
            };
            let Some(target) = next else {
                break;
            };
            if !self.probe_one(target, &stop_rx).await {
                break;
            }
        }
        trace!("Probe worker {} done.", self.id);
    }

    async fn next_target(&self) -> Option<ProbeTarget> {
        self.relay_rx.lock().await.recv().await
    }

    /// Returns whether the worker should keep going.
    async fn probe_one(&self, target: ProbeTarget, stop_rx: &CancellationToken) -> bool {
        let observed_at = Utc::now();
        let probe_res = select! {
            biased;
            _ = stop_rx.cancelled() => return false,
            res = self.prober.probe(&target) => res,
        };

        match probe_res {
            Ok(latency) => {
                let record = ProbeRecord {
                    address: target,
                    latency,
                    observed_at,
                };
                trace!("Worker {} measured {}", self.id, record);
                select! {
                    biased;
                    _ = stop_rx.cancelled() => false,
                    sent = self.record_tx.send(record) => sent.is_ok(),
                }
            }
            Err(e) => {
                let e = e.context(format!("while probing {}", target));
                self.errors.report(e).await;
                true
            }
        }
    }
}
