mod logging;

pub use logging::validator_log_level;

use crate::config::DEFAULT_CONFIG_FILE;
use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    value_parser, Arg, ColorChoice, Command,
};
use std::path::PathBuf;

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("radrotor")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the YAML configuration file")
                .env("RADROTOR_CONFIG")
                .default_value(DEFAULT_CONFIG_FILE)
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new("run").about("Run radiusd and rotate its certificate (default)"),
        )
        .subcommand(
            Command::new("check")
                .about("Validate the configuration and print the resolved values"),
        );

    logging::with_args(command)
}
