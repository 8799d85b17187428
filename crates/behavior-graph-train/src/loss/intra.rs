//! Intra-behavior contrastive loss between the two augmented views.
//!
//! For each (user, item) pair of the batch, the node's target-behavior
//! embedding in view 1 must pick out the same node among all nodes of view 2.

use behavior_graph_core::{LossConfig, SslMode};
use candle_core::{DType, Tensor};

use crate::error::{map_candle, TrainResult};
use crate::loss::info_nce_sum;
use crate::sparse_ops::{index_tensor, l2_normalize, relation_slice};

#[derive(Debug, Clone)]
pub struct IntraViewLoss {
    temperature: f32,
    weight: f32,
    mode: SslMode,
}

impl IntraViewLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            temperature: config.ssl_temp,
            weight: config.ssl_reg,
            mode: config.ssl_mode,
        }
    }

    /// View tensors are `[n, R, d]`; only relation `target` is used.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        users: &[u32],
        items: &[u32],
        user_view1: &Tensor,
        user_view2: &Tensor,
        item_view1: &Tensor,
        item_view2: &Tensor,
        target: usize,
    ) -> TrainResult<Tensor> {
        let mut loss = Tensor::zeros((), DType::F32, user_view1.device()).map_err(map_candle)?;
        if self.mode.includes_users() && !users.is_empty() {
            let side = self.side(
                users,
                &relation_slice(user_view1, target)?,
                &relation_slice(user_view2, target)?,
            )?;
            loss = (&loss + &side).map_err(map_candle)?;
        }
        if self.mode.includes_items() && !items.is_empty() {
            let side = self.side(
                items,
                &relation_slice(item_view1, target)?,
                &relation_slice(item_view2, target)?,
            )?;
            loss = (&loss + &side).map_err(map_candle)?;
        }
        loss.affine(self.weight as f64, 0.0).map_err(map_candle)
    }

    /// One side with `[n, d]` views.
    pub fn side(&self, nodes: &[u32], view1: &Tensor, view2: &Tensor) -> TrainResult<Tensor> {
        let idx = index_tensor(nodes, view1.device())?;
        let anchors = l2_normalize(&view1.index_select(&idx, 0).map_err(map_candle)?)?;
        let candidates = l2_normalize(view2)?;
        info_nce_sum(&anchors, &candidates, &idx, None, self.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_ops::scalar;
    use candle_core::Device;

    fn loss(mode: SslMode) -> IntraViewLoss {
        IntraViewLoss::new(&LossConfig {
            ssl_temp: 0.5,
            ssl_reg: 1.0,
            ssl_mode: mode,
            ..LossConfig::default()
        })
    }

    #[test]
    fn test_identical_views_beat_opposed_views() {
        let device = Device::Cpu;
        let v1 = Tensor::new(&[[[1f32]], [[-1.0]]], &device).unwrap();
        let opposed = Tensor::new(&[[[-1f32]], [[1.0]]], &device).unwrap();
        let l = loss(SslMode::UserSide);
        let same = l.compute(&[0, 1], &[], &v1, &v1, &v1, &v1, 0).unwrap();
        let flipped = l.compute(&[0, 1], &[], &v1, &opposed, &v1, &v1, 0).unwrap();
        assert!(scalar(&same).unwrap() < scalar(&flipped).unwrap());
    }

    #[test]
    fn test_mode_selects_sides() {
        let device = Device::Cpu;
        let users = Tensor::new(&[[[1f32]], [[-1.0]]], &device).unwrap();
        let items = Tensor::new(&[[[1f32]], [[0.5]], [[0.0]]], &device).unwrap();
        let user_only = loss(SslMode::UserSide)
            .compute(&[0], &[1], &users, &users, &items, &items, 0)
            .unwrap();
        let item_only = loss(SslMode::ItemSide)
            .compute(&[0], &[1], &users, &users, &items, &items, 0)
            .unwrap();
        let both = loss(SslMode::BothSide)
            .compute(&[0], &[1], &users, &users, &items, &items, 0)
            .unwrap();
        let (u, i, b) = (
            scalar(&user_only).unwrap(),
            scalar(&item_only).unwrap(),
            scalar(&both).unwrap(),
        );
        assert!((u + i - b).abs() < 1e-5);
    }
}
