use crate::{
    cli::{actions::check, telemetry},
    config::DaemonConfig,
    daemon::Daemon,
};
use anyhow::Result;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub config: PathBuf,
}

/// Execute the run action.
/// # Errors
/// Returns an error if the configuration is invalid or radiusd cannot be started or stopped.
pub async fn execute(args: Args) -> Result<()> {
    debug!(config = %args.config.display(), "loading configuration");

    let mut config = DaemonConfig::load(&args.config)?;
    config.check()?;

    log_startup(&config);

    let result = Daemon::new(&config)?.run().await;

    telemetry::shutdown_tracer();

    result
}

fn log_startup(config: &DaemonConfig) {
    let entries = check::entries(config);
    info!(
        "{}\n\nStartup configuration:\n{}",
        banner(),
        check::render(&entries)
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
}

fn banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.chars().take(7).collect()
}

const BANNER: &str = r"
    .--.
   ( () )----.
    '--'      \
               )  R A D R O T O R {VERSION}
    .--.      /
   ( () )----'
    '--'";
