//! Loss terms of one training batch.
//!
//! - [`RecLoss`]: weighted recommendation loss and embedding regularizer
//! - [`IntraViewLoss`]: InfoNCE between the two augmented views
//! - [`InterBehaviorLoss`]: InfoNCE aligning auxiliary behaviors to the target
//!
//! [`LossAssembly`] runs all three against an [`EncoderOutput`] and keeps the
//! per-auxiliary-behavior terms apart, because the optimizer treats each of
//! them as its own task.

pub mod inter;
pub mod intra;
pub mod rec;

use behavior_graph_core::{ExclusionMask, LossConfig, TrainingBatch};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::encoder::EncoderOutput;
use crate::error::{map_candle, TrainResult};
use crate::sparse_ops::scalar;

pub use inter::InterBehaviorLoss;
pub use intra::IntraViewLoss;
pub use rec::RecLoss;

/// Summed InfoNCE over rows: `-Σ_p log softmax(anchors · candidatesᵀ / τ)[p, positive_p]`.
///
/// `keep` multiplies the scaled logits: a 0 entry pins that candidate's logit
/// to 0, so it still contributes `exp(0)` to the normalizer.
pub(crate) fn info_nce_sum(
    anchors: &Tensor,
    candidates: &Tensor,
    positives: &Tensor,
    keep: Option<&Tensor>,
    temperature: f32,
) -> TrainResult<Tensor> {
    let rows = anchors.dim(0).map_err(map_candle)?;
    let mut logits = anchors
        .matmul(&candidates.t().map_err(map_candle)?)
        .map_err(map_candle)?
        .affine(1.0 / temperature as f64, 0.0)
        .map_err(map_candle)?;
    if let Some(keep) = keep {
        logits = (&logits * keep).map_err(map_candle)?;
    }
    // cross_entropy averages over rows
    candle_nn::loss::cross_entropy(&logits, positives)
        .map_err(map_candle)?
        .affine(rows as f64, 0.0)
        .map_err(map_candle)
}

/// Graph-attached losses of one batch.
#[derive(Debug, Clone)]
pub struct BatchLosses {
    pub rec: Tensor,
    pub emb: Tensor,
    pub ssl: Tensor,
    /// One entry per configured auxiliary behavior.
    pub ssl2: Vec<Tensor>,
}

impl BatchLosses {
    /// Task losses in optimizer order: recommendation, intra-view, then each
    /// inter-behavior term.
    pub fn tasks(&self) -> Vec<&Tensor> {
        let mut tasks = vec![&self.rec, &self.ssl];
        tasks.extend(self.ssl2.iter());
        tasks
    }

    pub fn values(&self) -> TrainResult<LossValues> {
        let rec = scalar(&self.rec)? as f64;
        let emb = scalar(&self.emb)? as f64;
        let ssl = scalar(&self.ssl)? as f64;
        let mut ssl2 = 0.0;
        for t in &self.ssl2 {
            ssl2 += scalar(t)? as f64;
        }
        Ok(LossValues {
            total: rec + emb + ssl + ssl2,
            rec,
            emb,
            ssl,
            ssl2,
        })
    }
}

/// Host-side loss values for logging and history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossValues {
    pub total: f64,
    pub rec: f64,
    pub emb: f64,
    pub ssl: f64,
    pub ssl2: f64,
}

impl LossValues {
    /// Accumulate `other / n` (running epoch mean).
    pub fn add_scaled(&mut self, other: &LossValues, n: usize) {
        let w = 1.0 / n.max(1) as f64;
        self.total += other.total * w;
        self.rec += other.rec * w;
        self.emb += other.emb * w;
        self.ssl += other.ssl * w;
        self.ssl2 += other.ssl2 * w;
    }

    pub fn is_nan(&self) -> bool {
        self.total.is_nan()
    }
}

/// All loss terms, configured once per run.
#[derive(Debug, Clone)]
pub struct LossAssembly {
    rec: RecLoss,
    intra: IntraViewLoss,
    inter: InterBehaviorLoss,
    target: usize,
}

impl LossAssembly {
    /// `config` must be resolved; masks come from the unified similarities.
    pub fn new(
        config: &LossConfig,
        n_relations: usize,
        n_items: usize,
        user_mask: ExclusionMask,
        item_mask: ExclusionMask,
    ) -> Self {
        Self {
            rec: RecLoss::new(config, n_items),
            intra: IntraViewLoss::new(config),
            inter: InterBehaviorLoss::new(config, user_mask, item_mask),
            target: n_relations - 1,
        }
    }

    pub fn compute(&self, out: &EncoderOutput, batch: &TrainingBatch) -> TrainResult<BatchLosses> {
        let (rec, emb) = self.rec.compute(batch, &out.user, &out.item, &out.relations)?;
        let (pair_users, pair_items) = batch.target_pairs();
        let ssl = self.intra.compute(
            &pair_users,
            &pair_items,
            &out.user_view1,
            &out.user_view2,
            &out.item_view1,
            &out.item_view2,
            self.target,
        )?;
        let ssl2 = self
            .inter
            .compute_all(&pair_users, &pair_items, &out.user, &out.item, self.target)?;
        Ok(BatchLosses { rec, emb, ssl, ssl2 })
    }
}
