//! Command surface for the groupsync binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use groupsync_core::logging::LevelFilter;

#[derive(Parser)]
#[command(author, about, long_about = None, arg_required_else_help = true)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) command: Command,

    /// Log level
    #[arg(global = true, short = 'l', long, value_parser = parse_level)]
    pub(crate) log_level: Option<LevelFilter>,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the reconciler, the periodic offboarder, and the read API
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "groupsync_config.yaml")]
        config: PathBuf,
        /// Directory of declarative group files
        #[arg(short, long, default_value = "groups")]
        groups: PathBuf,
    },
    /// Parse and validate the configuration, then exit
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "groupsync_config.yaml")]
        config: PathBuf,
    },
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    value
        .parse::<LevelFilter>()
        .map_err(|_| format!("invalid log level: {value}"))
}
