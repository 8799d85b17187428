//! Training loop for the multi-behavior graph recommender.
//!
//! Per epoch:
//! 1. Shuffle the training users
//! 2. Sample fresh augmented views of the target behavior
//! 3. Per batch: forward, losses, gradient surgery over the task losses,
//!    regularizer gradient, Adam step
//! 4. Optional step decay of the learning rate
//! 5. Every `test_every` epochs: ranking evaluation and early stopping

use std::time::Instant;

use behavior_graph_core::{
    ExclusionMask, GraphAugmentor, InteractionData, InteractionMap, RunConfig, TrainingBatch,
    TrainingInstances, ViewSchedule, LABEL_QUANTILE,
};
use candle_core::Device;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::encoder::{DeviceViews, RelationalGraphEncoder};
use crate::error::{map_candle, TrainError, TrainResult};
use crate::evaluation::{Evaluator, RankingMetrics};
use crate::loss::{LossAssembly, LossValues};
use crate::optim::{discover_probe, Adam, AdamConfig, GradientSurgery, ParamGradients, StepLr, SurgeryStats};
use crate::params::{ModelDims, ModelParams};

const INIT_STREAM: u64 = 0;
const AUGMENT_STREAM: u64 = 1;
const DROPOUT_STREAM: u64 = 2;
const SHUFFLE_STREAM: u64 = 3;

fn rng_stream(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// `cpu`, `cuda` or `cuda:<ordinal>`.
pub fn select_device(name: &str) -> TrainResult<Device> {
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match name.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .trim_start_matches(':')
            .parse::<usize>()
            .map_err(|_| TrainError::config(format!("invalid device '{}'", name)))?,
        None => return Err(TrainError::config(format!("unknown device '{}'", name))),
    };
    Device::new_cuda(ordinal).map_err(map_candle)
}

/// Stops after `patience` evaluation rounds without improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    best: Option<f64>,
    stall: usize,
    patience: usize,
}

/// Outcome of one [`EarlyStopping::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Improved,
    Tied,
    Stalled,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            best: None,
            stall: 0,
            patience,
        }
    }

    /// Record a value. A tie resets the stall counter but is not a new best.
    pub fn update(&mut self, value: f64) -> Progress {
        match self.best {
            Some(best) if value < best => {
                self.stall += 1;
                Progress::Stalled
            }
            Some(best) if value == best => {
                self.stall = 0;
                Progress::Tied
            }
            _ => {
                self.best = Some(value);
                self.stall = 0;
                Progress::Improved
            }
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stall >= self.patience
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

/// Result of a single training epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean loss components over the epoch's batches.
    pub loss: LossValues,
    pub num_batches: usize,
    /// Learning rate used during the epoch.
    pub lr: f64,
    pub seconds: f64,
    /// Present on evaluation epochs.
    pub metrics: Option<RankingMetrics>,
}

/// Everything recorded across a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_metrics: Option<RankingMetrics>,
    pub early_stopped: bool,
    pub total_steps: usize,
    /// Name of the parameter left out of conflict resolution.
    pub probe_parameter: Option<String>,
}

/// One batch's gradients before the update.
#[derive(Debug, Clone)]
pub struct StepGradients {
    pub losses: LossValues,
    pub grads: ParamGradients,
    pub surgery: SurgeryStats,
}

pub struct Trainer {
    config: RunConfig,
    encoder: RelationalGraphEncoder,
    losses: LossAssembly,
    optimizer: Adam,
    scheduler: Option<StepLr>,
    surgery: GradientSurgery,
    evaluator: Evaluator,
    instances: TrainingInstances,
    augmentor: GraphAugmentor,
    train_target: InteractionMap,
    test: InteractionMap,
    /// `None` until discovered on the first batch.
    probe: Option<Option<usize>>,
    augment_rng: ChaCha8Rng,
    dropout_rng: ChaCha8Rng,
    shuffle_rng: ChaCha8Rng,
    history: TrainingHistory,
}

impl Trainer {
    /// Resolve `config` against the dataset's behaviors and build the model.
    pub fn new(data: &InteractionData, config: RunConfig, device: &Device) -> TrainResult<Self> {
        let behaviors = data.behaviors();
        let config = config.resolve(behaviors)?;
        let seed = config.training.seed;
        let n_relations = behaviors.len();

        let dims = ModelDims {
            n_users: data.n_users(),
            n_items: data.n_items(),
            n_relations,
            embed_dim: config.model.embed_dim,
            n_layers: config.model.n_layers(),
            att_dim: config.model.att_dim,
        };
        let params = ModelParams::init(dims, &mut rng_stream(seed, INIT_STREAM), device)?;
        info!(
            users = dims.n_users,
            items = dims.n_items,
            relations = n_relations,
            parameters = params.len(),
            weights = params.num_weights(),
            "Model initialized"
        );

        let adjacencies = data.static_adjacencies()?;
        let encoder = RelationalGraphEncoder::new(params, &adjacencies, behaviors, &config.model, device)?;

        let user_mask = ExclusionMask::from_similarity(&data.user_similarity(), config.loss.topk_user, false);
        let item_mask = ExclusionMask::from_similarity(&data.item_similarity(), config.loss.topk_item, true);
        let losses = LossAssembly::new(&config.loss, n_relations, data.n_items(), user_mask, item_mask);

        let optimizer = Adam::new(
            AdamConfig {
                lr: config.optim.lr,
                ..AdamConfig::default()
            },
            &encoder.params().vars(),
        )?;
        let scheduler = config
            .optim
            .lr_decay
            .then(|| StepLr::new(config.optim.lr, config.optim.decay_step, config.optim.gamma));
        let surgery = GradientSurgery::new(config.optim.relax_factor as f64, config.optim.beta as f64);

        let instances = TrainingInstances::build(data.train_maps(), data.n_items(), LABEL_QUANTILE)?;
        let evaluator = Evaluator::new(&config.training, behaviors.target())?;

        Ok(Self {
            encoder,
            losses,
            optimizer,
            scheduler,
            surgery,
            evaluator,
            instances,
            augmentor: data.augmentor(),
            train_target: data.train(behaviors.target()).clone(),
            test: data.test().clone(),
            probe: None,
            augment_rng: rng_stream(seed, AUGMENT_STREAM),
            dropout_rng: rng_stream(seed, DROPOUT_STREAM),
            shuffle_rng: rng_stream(seed, SHUFFLE_STREAM),
            history: TrainingHistory::default(),
            config,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn encoder(&self) -> &RelationalGraphEncoder {
        &self.encoder
    }

    pub fn instances(&self) -> &TrainingInstances {
        &self.instances
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Discovered probe parameter, once the first batch ran.
    pub fn probe(&self) -> Option<Option<usize>> {
        self.probe
    }

    /// Fresh augmented views, uploaded to the model's device.
    pub fn sample_views(&mut self) -> TrainResult<DeviceViews> {
        let schedule = ViewSchedule::generate(
            &self.augmentor,
            self.config.augment.kind,
            self.config.augment.ratio,
            self.config.model.n_layers(),
            &mut self.augment_rng,
        )?;
        DeviceViews::upload(&schedule, self.encoder.device())
    }

    /// Forward, losses and the combined gradient of one batch.
    pub fn compute_gradients(&mut self, batch: &TrainingBatch, views: &DeviceViews) -> TrainResult<StepGradients> {
        let out = self.encoder.forward(views, &mut self.dropout_rng)?;
        let losses = self.losses.compute(&out, batch)?;
        let params = self.encoder.params();

        let probe = match self.probe {
            Some(probe) => probe,
            None => {
                let probe = discover_probe(&losses.ssl, params)?;
                self.history.probe_parameter = probe.map(|idx| params.names()[idx].clone());
                self.probe = Some(probe);
                probe
            }
        };

        let (combined, surgery) = self.surgery.step(&losses.tasks(), params, probe)?;
        let regularizer = ParamGradients::from_backward(&losses.emb, params)?;
        Ok(StepGradients {
            losses: losses.values()?,
            grads: combined.add(&regularizer)?,
            surgery,
        })
    }

    pub fn train_step(&mut self, batch: &TrainingBatch, views: &DeviceViews) -> TrainResult<LossValues> {
        let step = self.compute_gradients(batch, views)?;
        self.optimizer.step(&step.grads)?;
        self.history.total_steps += 1;
        if step.surgery.conflicts > 0 {
            debug!(
                conflicts = step.surgery.conflicts,
                capped = step.surgery.capped,
                anchor_norm = step.surgery.anchor_norm,
                "Gradient conflicts resolved"
            );
        }
        Ok(step.losses)
    }

    /// One pass over every training user. A NaN mean loss aborts the run.
    pub fn train_epoch(&mut self, epoch: usize) -> TrainResult<(LossValues, usize)> {
        self.instances.shuffle(&mut self.shuffle_rng);
        let views = self.sample_views()?;

        let batch_size = self.config.training.batch_size;
        let n_batches = self.instances.num_batches(batch_size);
        let mut mean = LossValues::default();
        for b in 0..n_batches {
            let batch = self.instances.batch(b * batch_size, (b + 1) * batch_size);
            let values = self.train_step(&batch, &views)?;
            debug!(epoch, batch = b, loss = values.total, "Batch complete");
            mean.add_scaled(&values, n_batches);
        }

        if mean.is_nan() {
            return Err(TrainError::NumericalDivergence {
                epoch,
                loss: mean.total,
            });
        }
        Ok((mean, n_batches))
    }

    /// Rank the test users with the current parameters.
    pub fn evaluate(&self) -> TrainResult<RankingMetrics> {
        let embeddings = self.encoder.forward_main()?;
        self.evaluator.evaluate(&embeddings, &self.train_target, &self.test)
    }

    /// Train for the configured epochs or until early stopping.
    pub fn fit(&mut self) -> TrainResult<&TrainingHistory> {
        let training = self.config.training.clone();
        let mut stopper = EarlyStopping::new(training.patience);
        info!(
            epochs = training.epochs,
            users = self.instances.len(),
            batch_size = training.batch_size,
            "Starting training"
        );

        for epoch in 0..training.epochs {
            let start = Instant::now();
            let lr = self.optimizer.lr();
            let (loss, num_batches) = self.train_epoch(epoch)?;
            if let Some(scheduler) = self.scheduler.as_mut() {
                self.optimizer.set_lr(scheduler.step());
            }

            let mut record = EpochRecord {
                epoch,
                loss,
                num_batches,
                lr,
                seconds: 0.0,
                metrics: None,
            };

            if (epoch + 1) % training.test_every == 0 {
                let metrics = self.evaluate()?;
                // first epoch reaching the best recall is the one reported
                if stopper.update(metrics.primary_recall()) == Progress::Improved {
                    self.history.best_epoch = Some(epoch);
                    self.history.best_metrics = Some(metrics.clone());
                }
                info!(
                    epoch,
                    loss = loss.total,
                    recall = ?metrics.recall,
                    precision = ?metrics.precision,
                    hit = ?metrics.hit_ratio,
                    ndcg = ?metrics.ndcg,
                    "Evaluation"
                );
                record.metrics = Some(metrics);
            } else {
                info!(
                    epoch,
                    loss = loss.total,
                    rec = loss.rec,
                    emb = loss.emb,
                    ssl = loss.ssl,
                    ssl2 = loss.ssl2,
                    "Epoch complete"
                );
            }
            record.seconds = start.elapsed().as_secs_f64();
            self.history.epochs.push(record);

            if stopper.should_stop() {
                warn!(epoch, best = ?stopper.best(), "Early stopping triggered");
                self.history.early_stopped = true;
                break;
            }
        }

        if let (Some(epoch), Some(best)) = (self.history.best_epoch, &self.history.best_metrics) {
            info!(
                epoch,
                recall = ?best.recall,
                precision = ?best.precision,
                hit = ?best.hit_ratio,
                ndcg = ?best.ndcg,
                "Best evaluation"
            );
        }
        Ok(&self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_ties_reset_stall_only() {
        let mut stopper = EarlyStopping::new(2);
        assert_eq!(stopper.update(0.1), Progress::Improved);
        assert_eq!(stopper.update(0.05), Progress::Stalled);
        assert_eq!(stopper.update(0.1), Progress::Tied);
        assert!(!stopper.should_stop());
        assert_eq!(stopper.update(0.05), Progress::Stalled);
        assert!(!stopper.should_stop());
        assert_eq!(stopper.update(0.09), Progress::Stalled);
        assert!(stopper.should_stop());
        assert_eq!(stopper.update(0.2), Progress::Improved);
        assert!(!stopper.should_stop());
        assert_eq!(stopper.best(), Some(0.2));
    }

    #[test]
    fn test_select_device() {
        assert!(matches!(select_device("cpu"), Ok(Device::Cpu)));
        let err = select_device("tpu").unwrap_err();
        assert!(err.is_config());
        assert!(select_device("cuda:x").unwrap_err().is_config());
    }

    #[test]
    fn test_rng_streams_differ() {
        use rand::Rng;
        let a: u64 = rng_stream(7, AUGMENT_STREAM).gen();
        let b: u64 = rng_stream(7, SHUFFLE_STREAM).gen();
        let a2: u64 = rng_stream(7, AUGMENT_STREAM).gen();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }
}
