//! Tilescape command-line front-end.
//!
//! Drives the streaming engine headlessly: `run` executes a scripted
//! camera flight over synthetic sources and reports streaming telemetry,
//! `info` prints the resolved configuration. Useful for profiling
//! scheduler behavior and validating configuration without a GPU or a
//! window.

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tilescape", version, about = "Tiled LOD streaming engine tools")]
struct Cli {
    /// Path to the INI config file (default: the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "tilescape=debug".
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a headless streaming simulation and print telemetry.
    Run(commands::run::RunArgs),

    /// Print the resolved configuration.
    Info,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.clone())),
        )
        .init();

    let config = match config::ConfigFile::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load configuration: {error}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(&config, &args),
        Commands::Info => commands::info::execute(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}
