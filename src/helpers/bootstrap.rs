use std::time::Duration;

use anyhow::{Context, Result};
use human_panic::setup_panic;
use log::{debug, info, warn};

use crate::helpers::logging;

/// How long spawned tasks get to wind down after the command returned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Common entry point of all binaries: loads `.env`, parses the CLI, sets up logging
/// and a multi-threaded Tokio runtime, then hands over to `fn_run` with the runtime entered.
pub fn run<CliType>(
    app_name: &'static str,
    fn_cli_parse: fn() -> CliType,
    fn_extract_logging: fn(&CliType) -> &logging::Params,
    fn_run: fn(CliType) -> Result<()>,
) -> Result<()> {
    setup_panic!();
    let env_result = dotenvy::dotenv();

    let cli = fn_cli_parse();
    let logger_handle = logging::configure_from(fn_extract_logging(&cli))?;

    // Only reported now since logging wasn't available before
    if let Err(env_err) = env_result {
        if env_err.not_found() {
            warn!("No `.env` file found (recursively). Relying on flags & environment only.")
        } else {
            return Err(env_err).context("Failed to load `.env` file");
        }
    }
    info!("{} v{} starting up", app_name, env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name(app_name)
        .build()
        .context("Failed to start Tokio runtime")?;
    let _guard = runtime.enter();

    let command_result = fn_run(cli);

    debug!(
        "Waiting up to {}s for remaining tasks to finish",
        SHUTDOWN_GRACE.as_secs()
    );
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    // Async write mode: the handle must live until here
    logger_handle.flush();

    command_result
}
