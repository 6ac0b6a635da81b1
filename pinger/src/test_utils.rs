use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use queue_models::probe_record::{ProbeRecord, ProbeTarget};

use crate::discover::TargetSource;
use crate::probe::Prober;
use crate::publish::RecordPublisher;

const DEFAULT_LATENCY: Duration = Duration::from_millis(1);

pub fn targets(addresses: &[&str]) -> Vec<ProbeTarget> {
    addresses.iter().map(|it| it.to_string()).collect()
}

/// Answers each discovery with the next scripted result.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<ProbeTarget>>>>,
    hang_when_done: bool,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Vec<ProbeTarget>>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            hang_when_done: false,
        }
    }

    /// Once the script is exhausted, discovery never answers instead of failing.
    pub fn hanging_when_done(mut self) -> Self {
        self.hang_when_done = true;
        self
    }
}

#[async_trait]
impl TargetSource for ScriptedSource {
    async fn list_targets(&self) -> Result<Vec<ProbeTarget>> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None if self.hang_when_done => std::future::pending().await,
            None => Err(anyhow!("discovery script exhausted")),
        }
    }
}

#[derive(Default)]
pub struct FakeProber {
    latencies: HashMap<ProbeTarget, Duration>,
    failures: HashMap<ProbeTarget, String>,
    delay: Option<Duration>,
    hang: bool,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub probed: Mutex<Vec<ProbeTarget>>,
}

impl FakeProber {
    pub fn answering(mut self, target: &str, latency: Duration) -> Self {
        self.latencies.insert(target.to_string(), latency);
        self
    }

    pub fn failing(mut self, target: &str, msg: &str) -> Self {
        self.failures.insert(target.to_string(), msg.to_string());
        self
    }

    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    async fn answer(&self, target: &ProbeTarget) -> Result<Duration> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.failures.get(target) {
            bail!("{}", msg);
        }
        Ok(self
            .latencies
            .get(target)
            .copied()
            .unwrap_or(DEFAULT_LATENCY))
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<Duration> {
        self.probed.lock().unwrap().push(target.clone());
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let res = self.answer(target).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

/// Remembers everything published, failing for the given addresses.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<ProbeRecord>>,
    pub failing_for: Vec<ProbeTarget>,
}

#[async_trait]
impl RecordPublisher for RecordingPublisher {
    async fn publish(&self, record: &ProbeRecord) -> Result<()> {
        if self.failing_for.contains(&record.address) {
            bail!("broker unavailable");
        }
        self.published.lock().unwrap().push(record.clone());
        Ok(())
    }
}
