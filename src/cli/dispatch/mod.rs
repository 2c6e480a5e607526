use crate::cli::actions::{check, server, Action};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Map parsed arguments to an [`Action`]. No subcommand means `run`.
///
/// # Errors
/// Returns an error if the configuration path is missing or the subcommand is unknown.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .context("missing required argument: --config")?;

    match matches.subcommand_name() {
        None | Some("run") => Ok(Action::Run(server::Args { config })),
        Some("check") => Ok(Action::Check(check::Args { config })),
        Some(other) => bail!("unknown subcommand {other}"),
    }
}
