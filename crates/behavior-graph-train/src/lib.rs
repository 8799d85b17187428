//! Model, losses and training for multi-behavior contrastive graph recommendation.
//!
//! # Components
//!
//! - [`RelationalGraphEncoder`]: per-relation propagation with attention fusion
//! - [`loss`]: recommendation loss, intra-view and inter-behavior InfoNCE
//! - [`optim`]: gradient surgery across task losses, Adam, step decay
//! - [`Trainer`]: epoch loop, evaluation and early stopping
//! - [`Evaluator`]: ranking metrics over held-out target interactions
//!
//! # Example
//!
//! ```no_run
//! use behavior_graph_core::{Behaviors, InteractionData, RunConfig};
//! use behavior_graph_train::{select_device, Trainer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let behaviors = Behaviors::parse("pv,cart,buy")?;
//! let data = InteractionData::load_dir("data/tmall", &behaviors)?;
//! let config = RunConfig::from_file("config/train.toml")?;
//! let device = select_device(&config.training.device)?;
//! let mut trainer = Trainer::new(&data, config, &device)?;
//! let history = trainer.fit()?;
//! println!("best epoch: {:?}", history.best_epoch);
//! # Ok(())
//! # }
//! ```

pub mod encoder;
pub mod error;
pub mod evaluation;
pub mod loss;
pub mod optim;
pub mod params;
pub mod sparse_ops;
pub mod trainer;

pub use encoder::{DeviceViews, EncoderOutput, MainOutput, RelationalGraphEncoder};
pub use error::{TrainError, TrainResult};
pub use evaluation::{evaluate_user, Evaluator, RankingMetrics};
pub use loss::{BatchLosses, InterBehaviorLoss, IntraViewLoss, LossAssembly, LossValues, RecLoss};
pub use optim::{Adam, AdamConfig, GradientSurgery, ParamGradients, StepLr};
pub use params::{ModelDims, ModelParams};
pub use trainer::{
    select_device, EarlyStopping, EpochRecord, Progress, StepGradients, Trainer, TrainingHistory,
};
