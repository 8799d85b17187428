//! Run configuration.
//!
//! One [`RunConfig`] describes a training run. It is loaded from TOML (every
//! section and field is optional), optionally patched from `MBGRAPH_*`
//! environment variables, then resolved against the behavior list so that the
//! per-relation vectors have exactly one entry per relation.
//!
//! # Example
//!
//! ```rust,ignore
//! let behaviors = Behaviors::parse("view,cart,buy")?;
//! let config = RunConfig::from_file("config/train.toml")?
//!     .with_env_overrides()
//!     .resolve(&behaviors)?;
//! ```

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::augment::AugmentKind;
use crate::error::{GraphError, GraphResult};
use crate::relation::Behaviors;

/// Which side of the (user, item) pairs a contrastive loss covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    #[serde(alias = "user")]
    UserSide,
    #[serde(alias = "item")]
    ItemSide,
    #[serde(alias = "both")]
    BothSide,
}

impl SslMode {
    pub fn includes_users(self) -> bool {
        matches!(self, SslMode::UserSide | SslMode::BothSide)
    }

    pub fn includes_items(self) -> bool {
        matches!(self, SslMode::ItemSide | SslMode::BothSide)
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Encoder shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Embedding dimension `d`.
    pub embed_dim: usize,
    /// Output width of every propagation layer. Each must equal `embed_dim`.
    pub layer_sizes: Vec<usize>,
    /// Hidden width of the relation attention projection.
    pub att_dim: usize,
    /// Dropout probability applied to fused embeddings while training.
    pub mess_dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embed_dim: 64,
            layer_sizes: vec![64, 64, 64],
            att_dim: 16,
            mess_dropout: 0.2,
        }
    }
}

impl ModelConfig {
    pub fn n_layers(&self) -> usize {
        self.layer_sizes.len()
    }

    pub fn validate(&self) -> GraphResult<()> {
        if self.embed_dim == 0 {
            return Err(GraphError::config("embed_dim must be positive"));
        }
        if self.layer_sizes.is_empty() {
            return Err(GraphError::config("layer_sizes must name at least one layer"));
        }
        if let Some((k, &w)) = self
            .layer_sizes
            .iter()
            .enumerate()
            .find(|(_, &w)| w != self.embed_dim)
        {
            return Err(GraphError::config(format!(
                "layer {} has width {} but every layer width must equal embed_dim ({})",
                k, w, self.embed_dim
            )));
        }
        if self.att_dim == 0 {
            return Err(GraphError::config("att_dim must be positive"));
        }
        if !(0.0..1.0).contains(&self.mess_dropout) {
            return Err(GraphError::config(format!(
                "mess_dropout must be in [0, 1), got {}",
                self.mess_dropout
            )));
        }
        Ok(())
    }
}

// ============================================================================
// AUGMENTATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub kind: AugmentKind,
    /// Fraction of nodes or edges removed per view, in `[0, 1)`.
    pub ratio: f64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            kind: AugmentKind::EdgeDropout,
            ratio: 0.5,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> GraphResult<()> {
        if !(0.0..1.0).contains(&self.ratio) {
            return Err(GraphError::config(format!(
                "augment ratio must be in [0, 1), got {}",
                self.ratio
            )));
        }
        Ok(())
    }
}

// ============================================================================
// LOSS
// ============================================================================

/// Loss weights.
///
/// `coefficient`, `wid` and `ssl_reg_inter` hold one entry per relation.
/// Left empty they resolve to `1/R`, `0.1` and `1.0` respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub coefficient: Vec<f32>,
    pub wid: Vec<f32>,
    /// Embedding L2 regularization strength.
    pub decay: f32,
    pub ssl_temp: f32,
    pub ssl_reg: f32,
    pub ssl_mode: SslMode,
    pub ssl_reg_inter: Vec<f32>,
    pub inter_mode: SslMode,
    /// Auxiliary behaviors contrasted against the target. Empty means all.
    pub aux_behaviors: Vec<usize>,
    /// Similar users excluded from each user's inter-behavior negatives.
    pub topk_user: usize,
    /// Similar items excluded from each item's inter-behavior negatives.
    pub topk_item: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            coefficient: Vec::new(),
            wid: Vec::new(),
            decay: 10.0,
            ssl_temp: 0.5,
            ssl_reg: 1.0,
            ssl_mode: SslMode::BothSide,
            ssl_reg_inter: Vec::new(),
            inter_mode: SslMode::BothSide,
            aux_behaviors: Vec::new(),
            topk_user: 10,
            topk_item: 10,
        }
    }
}

fn resolve_per_relation(
    what: &str,
    values: &mut Vec<f32>,
    default: f32,
    behaviors: &Behaviors,
) -> GraphResult<()> {
    if values.is_empty() {
        *values = vec![default; behaviors.len()];
    }
    behaviors.expect_len(what, values.len())?;
    if let Some(v) = values.iter().find(|v| !v.is_finite()) {
        return Err(GraphError::config(format!("{} contains non-finite value {}", what, v)));
    }
    Ok(())
}

impl LossConfig {
    fn resolve(&mut self, behaviors: &Behaviors) -> GraphResult<()> {
        let n = behaviors.len();
        resolve_per_relation("coefficient", &mut self.coefficient, 1.0 / n as f32, behaviors)?;
        resolve_per_relation("wid", &mut self.wid, 0.1, behaviors)?;
        resolve_per_relation("ssl_reg_inter", &mut self.ssl_reg_inter, 1.0, behaviors)?;
        if self.aux_behaviors.is_empty() {
            self.aux_behaviors = behaviors.auxiliary().collect();
        }
        for &a in &self.aux_behaviors {
            if a >= behaviors.target() {
                return Err(GraphError::config(format!(
                    "aux behavior index {} is not an auxiliary behavior (target is {})",
                    a,
                    behaviors.target()
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> GraphResult<()> {
        if self.ssl_temp.is_nan() || self.ssl_temp <= 0.0 {
            return Err(GraphError::config(format!(
                "ssl_temp must be positive, got {}",
                self.ssl_temp
            )));
        }
        if self.decay < 0.0 || self.ssl_reg < 0.0 {
            return Err(GraphError::config("decay and ssl_reg must be non-negative"));
        }
        Ok(())
    }
}

// ============================================================================
// OPTIMIZER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub lr: f64,
    /// Enable step learning-rate decay.
    pub lr_decay: bool,
    /// Epochs between decays.
    pub decay_step: usize,
    /// Multiplicative decay factor.
    pub gamma: f64,
    /// Cap on an auxiliary task's gradient norm, relative to the anchor's EMA norm.
    pub relax_factor: f32,
    /// EMA weight for the anchor gradient norm.
    pub beta: f32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            lr_decay: false,
            decay_step: 20,
            gamma: 0.8,
            relax_factor: 0.1,
            beta: 0.9,
        }
    }
}

impl OptimConfig {
    pub fn validate(&self) -> GraphResult<()> {
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(GraphError::config(format!("lr must be positive, got {}", self.lr)));
        }
        if self.lr_decay && self.decay_step == 0 {
            return Err(GraphError::config("decay_step must be positive when lr_decay is on"));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(GraphError::config(format!("beta must be in [0, 1], got {}", self.beta)));
        }
        if self.relax_factor.is_nan() || self.relax_factor <= 0.0 {
            return Err(GraphError::config("relax_factor must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// TRAINING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Evaluate every N epochs.
    pub test_every: usize,
    /// Evaluation rounds without improvement before stopping.
    pub patience: usize,
    pub seed: u64,
    /// Ranking cutoffs. The first one drives early stopping.
    pub ks: Vec<usize>,
    /// Users scored per evaluation batch.
    pub eval_batch_size: usize,
    /// Evaluation worker threads (0 = rayon default).
    pub eval_threads: usize,
    /// `cpu` or `cuda:<ordinal>`.
    pub device: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            epochs: 200,
            test_every: 5,
            patience: 10,
            seed: 2020,
            ks: vec![10, 20],
            eval_batch_size: 1024,
            eval_threads: 0,
            device: "cpu".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> GraphResult<()> {
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return Err(GraphError::config("batch sizes must be positive"));
        }
        if self.test_every == 0 {
            return Err(GraphError::config("test_every must be positive"));
        }
        if self.patience == 0 {
            return Err(GraphError::config("patience must be positive"));
        }
        if self.ks.is_empty() || self.ks.contains(&0) {
            return Err(GraphError::config("ks must be a non-empty list of positive cutoffs"));
        }
        if self.device != "cpu" && !self.device.starts_with("cuda") {
            return Err(GraphError::config(format!("unknown device '{}'", self.device)));
        }
        Ok(())
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Complete configuration of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub augment: AugmentConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optim: OptimConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl RunConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> GraphResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GraphError::config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            GraphError::config(format!("Failed to parse TOML in '{}': {}", path.display(), e))
        })
    }

    pub fn from_toml_str(toml: &str) -> GraphResult<Self> {
        toml::from_str(toml).map_err(|e| GraphError::config(format!("Failed to parse TOML: {}", e)))
    }

    pub fn to_toml_string(&self) -> GraphResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GraphError::config(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Apply environment overrides. Prefix: `MBGRAPH_`.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `MBGRAPH_EPOCHS` | `training.epochs` |
    /// | `MBGRAPH_BATCH_SIZE` | `training.batch_size` |
    /// | `MBGRAPH_SEED` | `training.seed` |
    /// | `MBGRAPH_DEVICE` | `training.device` |
    /// | `MBGRAPH_EVAL_THREADS` | `training.eval_threads` |
    /// | `MBGRAPH_LR` | `optim.lr` |
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("MBGRAPH_EPOCHS") {
            self.training.epochs = n;
        }
        if let Some(n) = env_parse::<usize>("MBGRAPH_BATCH_SIZE") {
            self.training.batch_size = n;
        }
        if let Some(n) = env_parse::<u64>("MBGRAPH_SEED") {
            self.training.seed = n;
        }
        if let Ok(val) = env::var("MBGRAPH_DEVICE") {
            self.training.device = val;
        }
        if let Some(n) = env_parse::<usize>("MBGRAPH_EVAL_THREADS") {
            self.training.eval_threads = n;
        }
        if let Some(lr) = env_parse::<f64>("MBGRAPH_LR") {
            self.optim.lr = lr;
        }
        self
    }

    /// Check every section, prefixing errors with the section name.
    pub fn validate(&self) -> GraphResult<()> {
        fn section(name: &str, r: GraphResult<()>) -> GraphResult<()> {
            r.map_err(|e| match e {
                GraphError::ConfigError { message } => {
                    GraphError::config(format!("[{}] {}", name, message))
                }
                other => other,
            })
        }
        section("model", self.model.validate())?;
        section("augment", self.augment.validate())?;
        section("loss", self.loss.validate())?;
        section("optim", self.optim.validate())?;
        section("training", self.training.validate())?;
        Ok(())
    }

    /// Fill per-relation defaults for `behaviors`, then validate.
    pub fn resolve(mut self, behaviors: &Behaviors) -> GraphResult<Self> {
        self.loss.resolve(behaviors)?;
        self.validate()?;
        Ok(self)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn behaviors() -> Behaviors {
        Behaviors::parse("view,cart,buy").unwrap()
    }

    #[test]
    fn test_defaults_resolve() {
        let config = RunConfig::default().resolve(&behaviors()).unwrap();
        assert_eq!(config.loss.coefficient.len(), 3);
        assert!((config.loss.coefficient[0] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(config.loss.wid, vec![0.1; 3]);
        assert_eq!(config.loss.ssl_reg_inter, vec![1.0; 3]);
        assert_eq!(config.loss.aux_behaviors, vec![0, 1]);
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            [model]
            embed_dim = 8
            layer_sizes = [8]

            [augment]
            kind = "random_walk"
            ratio = 0.1

            [loss]
            coefficient = [0.2, 0.3, 0.5]
            ssl_mode = "user"
        "#;
        let config = RunConfig::from_toml_str(toml).unwrap().resolve(&behaviors()).unwrap();
        assert_eq!(config.model.embed_dim, 8);
        assert_eq!(config.model.att_dim, 16);
        assert_eq!(config.augment.kind, AugmentKind::RandomWalk);
        assert_eq!(config.loss.ssl_mode, SslMode::UserSide);
        assert_eq!(config.training.ks, vec![10, 20]);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let shipped = include_str!("../../../config/train.toml");
        let config = RunConfig::from_toml_str(shipped).unwrap();
        assert_eq!(config, RunConfig::default());
        assert!(config.resolve(&behaviors()).is_ok());
    }

    #[test]
    fn test_coefficient_length_mismatch() {
        let toml = "[loss]\ncoefficient = [0.5, 0.5]\n";
        let err = RunConfig::from_toml_str(toml)
            .unwrap()
            .resolve(&behaviors())
            .unwrap_err();
        assert!(matches!(err, GraphError::RelationMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_layer_width_must_match_embedding() {
        let mut config = RunConfig::default();
        config.model.layer_sizes = vec![64, 32];
        let err = config.resolve(&behaviors()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("[model]"));
    }

    #[test]
    fn test_ratio_out_of_range() {
        let mut config = RunConfig::default();
        config.augment.ratio = 1.0;
        assert!(config.resolve(&behaviors()).is_err());
    }

    #[test]
    fn test_zero_patience_rejected() {
        let mut config = RunConfig::default();
        config.training.patience = 0;
        let err = config.resolve(&behaviors()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("patience"));
    }

    #[test]
    fn test_aux_behavior_cannot_be_target() {
        let mut config = RunConfig::default();
        config.loss.aux_behaviors = vec![2];
        assert!(config.resolve(&behaviors()).is_err());
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let original = RunConfig::default().resolve(&behaviors()).unwrap();
        std::fs::write(&path, original.to_toml_string().unwrap()).unwrap();
        let loaded = RunConfig::from_file(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RunConfig::from_file("/nonexistent/run.toml").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_env_override_seed() {
        std::env::set_var("MBGRAPH_SEED", "77");
        let config = RunConfig::default().with_env_overrides();
        std::env::remove_var("MBGRAPH_SEED");
        assert_eq!(config.training.seed, 77);
    }
}
