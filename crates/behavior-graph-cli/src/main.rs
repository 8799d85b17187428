//! Behavior Graph CLI
//!
//! Command-line trainer for multi-behavior contrastive graph recommendation.
//!
//! # Commands
//!
//! - `train`: train on a dataset directory and report the best evaluation
//! - `inspect-config`: print the resolved configuration as TOML
//!
//! Exit codes: 0 success, 1 failure, 2 numerical divergence, 3 configuration.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod error;

/// Behavior Graph CLI - multi-behavior recommendation training
#[derive(Parser)]
#[command(name = "behavior-graph")]
#[command(version)]
#[command(about = "Train multi-behavior contrastive graph recommenders")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and evaluate it on the held-out target interactions
    Train(commands::train::TrainArgs),
    /// Print the configuration after defaults and environment overrides
    InspectConfig(commands::inspect_config::InspectConfigArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Train(args) => commands::train::handle_train(args),
        Commands::InspectConfig(args) => commands::inspect_config::handle_inspect_config(args),
    };

    std::process::exit(exit_code);
}
