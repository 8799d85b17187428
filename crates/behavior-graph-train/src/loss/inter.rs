//! Inter-behavior contrastive loss.
//!
//! A node's target-behavior embedding is pulled toward its own embedding
//! under an auxiliary behavior and pushed from every other node's auxiliary
//! embedding. Nodes its exclusion-mask row marks as too similar have their
//! logit forced to 0, so they stay in the normalizer at `exp(0)`.

use behavior_graph_core::{ExclusionMask, LossConfig, SslMode};
use candle_core::{DType, Tensor};

use crate::error::{map_candle, TrainResult};
use crate::loss::info_nce_sum;
use crate::sparse_ops::{index_tensor, l2_normalize, relation_slice};

#[derive(Debug, Clone)]
pub struct InterBehaviorLoss {
    temperature: f32,
    weights: Vec<f32>,
    mode: SslMode,
    aux_behaviors: Vec<usize>,
    user_mask: ExclusionMask,
    item_mask: ExclusionMask,
}

impl InterBehaviorLoss {
    /// `config` must be resolved. The item mask has one column per item
    /// plus the padding column.
    pub fn new(config: &LossConfig, user_mask: ExclusionMask, item_mask: ExclusionMask) -> Self {
        Self {
            temperature: config.ssl_temp,
            weights: config.ssl_reg_inter.clone(),
            mode: config.inter_mode,
            aux_behaviors: config.aux_behaviors.clone(),
            user_mask,
            item_mask,
        }
    }

    pub fn aux_behaviors(&self) -> &[usize] {
        &self.aux_behaviors
    }

    /// One loss per configured auxiliary behavior, in configuration order.
    pub fn compute_all(
        &self,
        users: &[u32],
        items: &[u32],
        user: &Tensor,
        item: &Tensor,
        target: usize,
    ) -> TrainResult<Vec<Tensor>> {
        self.aux_behaviors
            .iter()
            .map(|&aux| self.compute(users, items, user, item, aux, target))
            .collect()
    }

    /// Loss for one auxiliary behavior, scaled by its `ssl_reg_inter` weight.
    pub fn compute(
        &self,
        users: &[u32],
        items: &[u32],
        user: &Tensor,
        item: &Tensor,
        aux: usize,
        target: usize,
    ) -> TrainResult<Tensor> {
        let mut loss = Tensor::zeros((), DType::F32, user.device()).map_err(map_candle)?;
        if self.mode.includes_users() && !users.is_empty() {
            let side = self.side(users, user, aux, target, &self.user_mask)?;
            loss = (&loss + &side).map_err(map_candle)?;
        }
        if self.mode.includes_items() && !items.is_empty() {
            let side = self.side(items, item, aux, target, &self.item_mask)?;
            loss = (&loss + &side).map_err(map_candle)?;
        }
        loss.affine(self.weights[aux] as f64, 0.0).map_err(map_candle)
    }

    fn side(
        &self,
        nodes: &[u32],
        embeddings: &Tensor,
        aux: usize,
        target: usize,
        mask: &ExclusionMask,
    ) -> TrainResult<Tensor> {
        let device = embeddings.device();
        let idx = index_tensor(nodes, device)?;
        let anchors = l2_normalize(
            &relation_slice(embeddings, target)?
                .index_select(&idx, 0)
                .map_err(map_candle)?,
        )?;
        let candidates = l2_normalize(&relation_slice(embeddings, aux)?)?;
        let keep: Vec<f32> = mask
            .batch_dense(nodes)
            .into_iter()
            .map(|excluded| 1.0 - excluded)
            .collect();
        let keep = Tensor::from_vec(keep, (nodes.len(), mask.n_cols()), device).map_err(map_candle)?;
        info_nce_sum(&anchors, &candidates, &idx, Some(&keep), self.temperature)
    }
}
