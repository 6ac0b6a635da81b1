use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use log::{debug, info};
use ping_crab::helpers::report::ErrorReporter;
use ping_crab::loop_with_stop;
use queue_models::probe_record::ProbeTarget;
use tokio::select;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::discover::{self, DockerCli, TargetSource};

#[derive(Args, Clone, Debug)]
#[group(id = "registry")]
pub struct Params {
    /// How often to re-discover the set of probe targets, in seconds
    #[arg(
        long,
        env = "DISCOVERY_INTERVAL_SECS",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    discovery_interval_secs: u64,

    #[clap(flatten)]
    discover: discover::Params,
}

impl Params {
    pub fn to_source(&self) -> DockerCli {
        self.discover.to_source()
    }
}

/// Shared, periodically replaced set of probe targets.
///
/// Readers get an immutable snapshot; a refresh swaps in a whole new set, so nobody ever
/// sees a half-updated one.
#[derive(Default)]
pub struct TargetRegistry {
    targets: RwLock<Arc<Vec<ProbeTarget>>>,
}

impl TargetRegistry {
    /// Replaces the set with whatever the source reports now. On failure, the previous set
    /// is kept as-is.
    pub async fn refresh(&self, source: &dyn TargetSource) -> Result<usize> {
        let fresh = source
            .list_targets()
            .await
            .context("while discovering probe targets")?;
        let count = fresh.len();
        *self.targets.write().await = Arc::new(fresh);
        Ok(count)
    }

    pub async fn snapshot(&self) -> Arc<Vec<ProbeTarget>> {
        self.targets.read().await.clone()
    }
}

/// Performs the initial discovery, failing if that doesn't work, and then refreshes the
/// registry periodically until stopped. Later failures are only reported.
///
/// A discovery still running on cancellation is abandoned, which kills the child process.
pub async fn run<S: TargetSource>(
    registry: Arc<TargetRegistry>,
    source: S,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
    params: Params,
) -> Result<()> {
    let initial = match refresh_until_stopped(&registry, &source, &stop_rx).await {
        Some(res) => res.context("initial target discovery failed")?,
        None => {
            info!("Stopped during initial discovery.");
            return Ok(());
        }
    };
    info!("Initial discovery found {} probe targets.", initial);

    let period = Duration::from_secs(params.discovery_interval_secs);
    RefreshLoop {
        registry,
        source,
        errors,
        stop_rx: stop_rx.clone(),
    }
    .run(stop_rx, period)
    .await
}

/// `None` if cancelled before the source answered.
async fn refresh_until_stopped(
    registry: &TargetRegistry,
    source: &dyn TargetSource,
    stop_rx: &CancellationToken,
) -> Option<Result<usize>> {
    select! {
        biased;
        _ = stop_rx.cancelled() => None,
        res = registry.refresh(source) => Some(res),
    }
}

struct RefreshLoop<S> {
    registry: Arc<TargetRegistry>,
    source: S,
    errors: ErrorReporter,
    stop_rx: CancellationToken,
}

impl<S: TargetSource> RefreshLoop<S> {
    async fn run(mut self, stop_rx: CancellationToken, period: Duration) -> Result<()> {
        let mut trigger = interval_at(Instant::now() + period, period);
        trigger.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop_with_stop!(
            "target refresh", stop_rx,
            trigger.tick() => refresh(it) on self as simple
        )
    }

    async fn refresh(&mut self, _tick: Instant) -> Result<()> {
        match refresh_until_stopped(&self.registry, &self.source, &self.stop_rx).await {
            Some(Ok(count)) => debug!("Refreshed probe targets, now {}.", count),
            Some(Err(e)) => self.errors.report(e).await,
            None => debug!("Target refresh abandoned due to stop."),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion, OptionAssertion, ResultAssertion};
    use ping_crab::helpers::report;

    use tokio::time::timeout;

    use crate::test_utils::{targets, ScriptedSource};

    use super::*;

    #[tokio::test]
    async fn refresh_replaces_the_set() {
        // given
        let registry = TargetRegistry::default();
        let source = ScriptedSource::new(vec![
            Ok(targets(&["10.0.0.1", "10.0.0.2"])),
            Ok(targets(&["10.0.0.3"])),
        ]);
        registry.refresh(&source).await.unwrap();

        // when
        let count = registry.refresh(&source).await;

        // then
        assert_that!(count.unwrap()).is_equal_to(1);
        assert_that!(*registry.snapshot().await).is_equal_to(targets(&["10.0.0.3"]));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_set() {
        // given
        let registry = TargetRegistry::default();
        let source = ScriptedSource::new(vec![
            Ok(targets(&["10.0.0.1"])),
            Err(anyhow!("docker daemon unreachable")),
        ]);
        registry.refresh(&source).await.unwrap();

        // when
        let result = registry.refresh(&source).await;

        // then
        assert_that!(result).is_err();
        assert_that!(*registry.snapshot().await).is_equal_to(targets(&["10.0.0.1"]));
    }

    #[tokio::test]
    async fn snapshot_is_unaffected_by_later_refresh() {
        // given
        let registry = TargetRegistry::default();
        let source = ScriptedSource::new(vec![
            Ok(targets(&["10.0.0.1"])),
            Ok(targets(&["10.0.0.2"])),
        ]);
        registry.refresh(&source).await.unwrap();
        let before = registry.snapshot().await;

        // when
        registry.refresh(&source).await.unwrap();

        // then
        assert_that!(*before).is_equal_to(targets(&["10.0.0.1"]));
    }

    #[tokio::test]
    async fn initial_discovery_failure_is_fatal() {
        // given
        let registry = Arc::new(TargetRegistry::default());
        let source = ScriptedSource::new(vec![Err(anyhow!("no docker"))]);
        let stop_rx = CancellationToken::new();
        let (errors, _drain) = report::channel("test registry", stop_rx.clone());

        // when
        let result = run(registry, source, errors, stop_rx, given_params()).await;

        // then
        assert_that!(result).is_err();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_failure_is_reported_and_loop_goes_on() {
        // given
        let registry = Arc::new(TargetRegistry::default());
        let source = ScriptedSource::new(vec![
            Ok(targets(&["10.0.0.1"])),
            Err(anyhow!("docker hiccup")),
            Ok(targets(&["10.0.0.2"])),
        ]);
        let stop_rx = CancellationToken::new();
        let (errors, mut drain) = report::channel("test registry", stop_rx.clone());
        let handle = tokio::spawn(run(
            registry.clone(),
            source,
            errors,
            stop_rx.clone(),
            given_params(),
        ));

        // when
        let reported = drain.recv().await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        // then
        assert_that!(reported.map(|it| format!("{:#}", it).contains("docker hiccup")))
            .has_value(true);
        assert_that!(*registry.snapshot().await).is_equal_to(targets(&["10.0.0.2"]));
        stop_rx.cancel();
        assert_that!(handle.await.unwrap()).is_ok();
        assert_that!(drain.recv().await.is_none()).is_true();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_while_discovery_hangs() {
        // given
        let registry = Arc::new(TargetRegistry::default());
        let source = ScriptedSource::new(vec![Ok(targets(&["10.0.0.1"]))]).hanging_when_done();
        let stop_rx = CancellationToken::new();
        let (errors, _drain) = report::channel("test registry", stop_rx.clone());
        let params = Params {
            discovery_interval_secs: 1,
            ..given_params()
        };
        let handle = tokio::spawn(run(registry.clone(), source, errors, stop_rx.clone(), params));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // when
        stop_rx.cancel();

        // then
        let res = timeout(Duration::from_secs(3), handle).await;
        assert_that!(res.is_ok()).is_true();
        assert_that!(res.unwrap().unwrap()).is_ok();
        assert_that!(*registry.snapshot().await).is_equal_to(targets(&["10.0.0.1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_while_initial_discovery_hangs() {
        // given
        let registry = Arc::new(TargetRegistry::default());
        let source = ScriptedSource::new(vec![]).hanging_when_done();
        let stop_rx = CancellationToken::new();
        let (errors, _drain) = report::channel("test registry", stop_rx.clone());
        let handle = tokio::spawn(run(registry, source, errors, stop_rx.clone(), given_params()));
        tokio::time::sleep(Duration::from_millis(500)).await;

        // when
        stop_rx.cancel();

        // then
        let res = timeout(Duration::from_secs(3), handle).await;
        assert_that!(res.is_ok()).is_true();
        assert_that!(res.unwrap().unwrap()).is_ok();
    }

    fn given_params() -> Params {
        Params {
            discovery_interval_secs: 60,
            discover: discover::Params {
                docker_bin: "/nonexistent/docker".into(),
            },
        }
    }
}
