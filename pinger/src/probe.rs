use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use lazy_static::lazy_static;
use log::trace;
use queue_models::probe_record::ProbeTarget;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// On top of ping's own reply deadline, to account for process startup.
const PROCESS_GRACE: Duration = Duration::from_secs(1);

lazy_static! {
    // iputils: "rtt min/avg/max/mdev = 0.045/0.045/0.045/0.000 ms"
    // busybox: "round-trip min/avg/max = 0.101/0.101/0.101 ms"
    static ref SUMMARY_REGEX: Regex = Regex::new(
        r"(?:rtt|round-trip) min/avg/max(?:/(?:mdev|stddev))? = [\d.]+/(?P<avg>[\d.]+)/"
    )
    .expect("Unable to compile ping summary regex");
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Mean round-trip time to the target. Any failure to get one is an error.
    async fn probe(&self, target: &ProbeTarget) -> Result<Duration>;
}

#[derive(Args, Clone, Debug)]
#[group(id = "probe")]
pub struct Params {
    /// FQ path to the ping binary
    #[arg(long, env = "PING_BIN", default_value = "/bin/ping")]
    ping_bin: PathBuf,

    /// How long to wait for an echo reply, in seconds
    #[arg(
        long,
        env = "PROBE_TIMEOUT_SECS",
        default_value = "2",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    probe_timeout_secs: u64,
}

impl Params {
    pub fn to_prober(&self) -> PingCommand {
        PingCommand {
            bin_path: self.ping_bin.clone(),
            reply_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no echo reply from {target} ({status})")]
    NoReply { target: ProbeTarget, status: ExitStatus },

    #[error("ping output for {target} has no usable summary: {output:?}")]
    UnparseableSummary { target: ProbeTarget, output: String },

    #[error("ping of {target} did not finish within {limit:?}")]
    TimedOut { target: ProbeTarget, limit: Duration },
}

/// Sends a single ICMP echo request through the system's ping binary, which already has the
/// privileges needed for raw sockets.
#[derive(Debug)]
pub struct PingCommand {
    bin_path: PathBuf,
    reply_timeout: Duration,
}

#[async_trait]
impl Prober for PingCommand {
    async fn probe(&self, target: &ProbeTarget) -> Result<Duration> {
        let mut cmd = Command::new(&self.bin_path);
        cmd.arg("-n")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(self.reply_timeout.as_secs().to_string())
            .arg(target)
            .stdin(Stdio::null())
            .env_clear()
            .env("LC_ALL", "C")
            .kill_on_drop(true);

        let limit = self.reply_timeout + PROCESS_GRACE;
        let output = match timeout(limit, cmd.output()).await {
            Ok(output) => output
                .with_context(|| format!("Failed to run ping at {:?}", self.bin_path))?,
            Err(_) => {
                return Err(ProbeError::TimedOut {
                    target: target.clone(),
                    limit,
                }
                .into())
            }
        };

        if !output.status.success() {
            return Err(ProbeError::NoReply {
                target: target.clone(),
                status: output.status,
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("ping {}: {}", target, stdout);
        parse_mean_rtt(&stdout).ok_or_else(|| {
            ProbeError::UnparseableSummary {
                target: target.clone(),
                output: stdout.to_string(),
            }
            .into()
        })
    }
}

fn parse_mean_rtt(output: &str) -> Option<Duration> {
    let caps = SUMMARY_REGEX.captures(output)?;
    let millis: f64 = caps.name("avg")?.as_str().parse().ok()?;
    // Microseconds is all the wire format keeps anyways
    Some(Duration::from_micros((millis * 1000.0).round() as u64))
}
