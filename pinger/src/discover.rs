use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use itertools::Itertools;
use log::{debug, trace, warn};
use queue_models::probe_record::ProbeTarget;
use tokio::process::Command;

/// Prints every IP the container has, one per attached network, space-separated.
const NETWORK_ADDRESSES_FORMAT: &str =
    "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}";

#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Current set of addresses to probe, without duplicates.
    async fn list_targets(&self) -> Result<Vec<ProbeTarget>>;
}

#[derive(Args, Clone, Debug)]
#[group(id = "discover")]
pub struct Params {
    /// FQ path to the docker CLI used to list running containers
    #[arg(long, env = "DOCKER_BIN", default_value = "/usr/bin/docker")]
    pub(crate) docker_bin: PathBuf,
}

impl Params {
    pub fn to_source(&self) -> DockerCli {
        DockerCli {
            bin_path: self.docker_bin.clone(),
        }
    }
}

/// Discovers the addresses of all running containers via the docker CLI.
#[derive(Debug)]
pub struct DockerCli {
    bin_path: PathBuf,
}

#[async_trait]
impl TargetSource for DockerCli {
    async fn list_targets(&self) -> Result<Vec<ProbeTarget>> {
        let ids = parse_container_ids(&self.call(&["ps", "--quiet", "--no-trunc"]).await?);
        if ids.is_empty() {
            debug!("No running containers.");
            return Ok(vec![]);
        }

        let mut args = vec!["inspect", "--format", NETWORK_ADDRESSES_FORMAT];
        args.extend(ids.iter().map(String::as_str));
        let addresses = parse_addresses(&self.call(&args).await?);
        debug!(
            "Discovered {} addresses on {} containers.",
            addresses.len(),
            ids.len()
        );
        Ok(addresses)
    }
}

impl DockerCli {
    async fn call(&self, args: &[&str]) -> Result<String> {
        trace!("Calling docker with arguments: {}", args.join(" "));
        let output = Command::new(&self.bin_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run docker at {:?}", self.bin_path))?;

        if !output.status.success() {
            bail!(
                "docker {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
        String::from_utf8(output.stdout).context("docker printed non-UTF-8 output")
    }
}

fn parse_container_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Containers without an address on some network print nothing for it, so empty
/// entries are simply skipped.
fn parse_addresses(output: &str) -> Vec<ProbeTarget> {
    output
        .split_whitespace()
        .filter(|candidate| match candidate.parse::<IpAddr>() {
            Ok(_) => true,
            Err(_) => {
                warn!("Ignoring invalid container address {:?}", candidate);
                false
            }
        })
        .unique()
        .map(str::to_string)
        .collect()
}
