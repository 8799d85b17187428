use std::path::PathBuf;

use behavior_graph_core::{Behaviors, GraphResult};
use clap::Args;
use tracing::error;

use crate::commands::load_config;
use crate::error::{exit_code_for_graph_error, CliExitCode};

/// Arguments for the inspect-config command.
#[derive(Args, Debug)]
pub struct InspectConfigArgs {
    /// TOML configuration file (defaults when omitted)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma-separated behaviors, target last; fills per-behavior defaults
    #[arg(long)]
    pub behaviors: Option<String>,
}

fn render(args: &InspectConfigArgs) -> GraphResult<String> {
    let mut config = load_config(args.config.as_deref())?;
    match &args.behaviors {
        Some(list) => config = config.resolve(&Behaviors::parse(list)?)?,
        None => config.validate()?,
    }
    config.to_toml_string()
}

pub fn handle_inspect_config(args: InspectConfigArgs) -> i32 {
    match render(&args) {
        Ok(toml) => {
            print!("{}", toml);
            CliExitCode::Success as i32
        }
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            exit_code_for_graph_error(&e) as i32
        }
    }
}
