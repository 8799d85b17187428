//! Train command: load data, fit, print the best evaluation.
//!
//! # Usage
//!
//! ```bash
//! behavior-graph train --data-dir data/tmall --behaviors pv,fav,cart,buy \
//!     --config config/train.toml --metrics-out history.json -v
//! ```

use std::path::PathBuf;

use behavior_graph_core::{Behaviors, GraphError, InteractionData};
use behavior_graph_train::{select_device, TrainResult, Trainer};
use clap::Args;
use tracing::{error, info};

use crate::commands::load_config;
use crate::error::{exit_code_for_error, CliExitCode};

/// Arguments for the train command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory holding `<behavior>.txt` files and `test.txt`
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Comma-separated behaviors, target last (e.g. `pv,cart,buy`)
    #[arg(long)]
    pub behaviors: String,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override `training.epochs`
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Override `training.seed`
    #[arg(long)]
    pub seed: Option<u64>,

    /// Write the training history as JSON
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

fn run(args: TrainArgs) -> TrainResult<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }

    let behaviors = Behaviors::parse(&args.behaviors)?;
    let data = InteractionData::load_dir(&args.data_dir, &behaviors)?;
    let device = select_device(&config.training.device)?;
    info!(device = %config.training.device, "Device selected");

    let mut trainer = Trainer::new(&data, config, &device)?;
    let history = trainer.fit()?;

    match (history.best_epoch, &history.best_metrics) {
        (Some(epoch), Some(best)) => {
            println!("Best epoch {}", epoch);
            for (j, k) in best.ks.iter().enumerate() {
                println!(
                    "  @{:<3} recall={:.5} precision={:.5} hit={:.5} ndcg={:.5}",
                    k, best.recall[j], best.precision[j], best.hit_ratio[j], best.ndcg[j]
                );
            }
            println!("  auc={:.5}", best.auc);
        }
        _ => println!("No evaluation round ran"),
    }

    if let Some(path) = &args.metrics_out {
        let json = serde_json::to_string_pretty(history)
            .map_err(|e| GraphError::from(std::io::Error::from(e)))?;
        std::fs::write(path, json).map_err(GraphError::from)?;
        info!(path = %path.display(), "Training history written");
    }
    Ok(())
}

pub fn handle_train(args: TrainArgs) -> i32 {
    match run(args) {
        Ok(()) => CliExitCode::Success as i32,
        Err(e) => {
            error!(error = %e, "Training failed");
            exit_code_for_error(&e) as i32
        }
    }
}
