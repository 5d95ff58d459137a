#![doc = include_str!("../README.md")]

pub mod cli;
pub mod commands;
pub mod continue_after;
pub mod error;
pub mod logging;
pub mod output;

use slimprobe_core::config::GeneralConfig;

use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::output::OutputWriter;

/// Dispatches a parsed command line.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let writer = OutputWriter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Profile(args) => {
            let config =
                commands::load_config(config_path, cli.log_level.as_deref(), Some(&args)).await?;
            logging::init_tracing(&config.general)?;
            commands::profile::execute(config, &writer).await
        }
        Commands::Config(args) => {
            let general = GeneralConfig {
                log_level: cli.log_level.unwrap_or_else(|| "warn".to_owned()),
                ..GeneralConfig::default()
            };
            logging::init_tracing(&general)?;
            commands::config::execute(args, config_path, &writer).await
        }
    }
}
