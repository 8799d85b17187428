//! Weighted non-sampling recommendation loss plus the embedding regularizer.
//!
//! For relation `i`, batch users `U_i`, all items `I_i` and the padded
//! positive lists `P_i`:
//!
//! ```text
//! pos_r[b, j] = Σ_k u_i[b, k] · p_i[b, j, k] · r_i[k]
//! L_i = wid_i · Σ((I_iᵀ I_i) ⊙ (U_iᵀ U_i) ⊙ (r_iᵀ r_i))
//!     + Σ((1 - wid_i) · pos_r² - 2 · pos_r)
//! ```
//!
//! The first term scores every (user, item) pair at once through the
//! `d x d` Gram matrices, so no negative sampling is needed.

use behavior_graph_core::{LossConfig, TrainingBatch};
use candle_core::{DType, Tensor};

use crate::error::{map_candle, TrainResult};
use crate::sparse_ops::{index_tensor, relation_slice};

#[derive(Debug, Clone)]
pub struct RecLoss {
    coefficient: Vec<f32>,
    wid: Vec<f32>,
    decay: f32,
    n_items: usize,
}

impl RecLoss {
    /// `config` must already be resolved against the behavior list.
    pub fn new(config: &LossConfig, n_items: usize) -> Self {
        Self {
            coefficient: config.coefficient.clone(),
            wid: config.wid.clone(),
            decay: config.decay,
            n_items,
        }
    }

    /// Returns `(ranking, regularization)`.
    ///
    /// `user` is `[n_users, R, d]`, `item` is `[n_items + 1, R, d]` and
    /// `relations` is `[R, d]`. The regularizer covers the batch users but
    /// every item.
    pub fn compute(
        &self,
        batch: &TrainingBatch,
        user: &Tensor,
        item: &Tensor,
        relations: &Tensor,
    ) -> TrainResult<(Tensor, Tensor)> {
        let device = user.device();
        let (_, n_rel, d) = user.dims3().map_err(map_candle)?;
        let b = batch.len();
        let users = index_tensor(&batch.users, device)?;
        let uid = user.index_select(&users, 0).map_err(map_candle)?;

        let mut ranking = Tensor::zeros((), DType::F32, device).map_err(map_candle)?;
        for i in 0..n_rel {
            let wid = self.wid[i] as f64;
            let u_i = relation_slice(&uid, i)?;
            let items_i = relation_slice(item, i)?;
            let r_i = relations.narrow(0, i, 1).map_err(map_candle)?;

            let item_gram = items_i.t().map_err(map_candle)?.matmul(&items_i).map_err(map_candle)?;
            let user_gram = u_i.t().map_err(map_candle)?.matmul(&u_i).map_err(map_candle)?;
            let rel_gram = r_i.t().map_err(map_candle)?.matmul(&r_i).map_err(map_candle)?;
            let mut loss_i = (&item_gram * &user_gram)
                .map_err(map_candle)?
                .mul(&rel_gram)
                .map_err(map_candle)?
                .sum_all()
                .map_err(map_candle)?
                .affine(wid, 0.0)
                .map_err(map_candle)?;

            let w = batch.widths[i];
            if w > 0 && b > 0 {
                let labels = &batch.labels[i];
                let label_idx = index_tensor(labels, device)?;
                let present: Vec<f32> = labels
                    .iter()
                    .map(|&l| if l as usize == self.n_items { 0.0 } else { 1.0 })
                    .collect();
                let present = Tensor::from_vec(present, (b, w, 1), device).map_err(map_candle)?;
                let pos = items_i
                    .index_select(&label_idx, 0)
                    .map_err(map_candle)?
                    .reshape((b, w, d))
                    .map_err(map_candle)?
                    .broadcast_mul(&present)
                    .map_err(map_candle)?;
                let ur = u_i
                    .broadcast_mul(&r_i)
                    .map_err(map_candle)?
                    .unsqueeze(2)
                    .map_err(map_candle)?;
                let pos_r = pos.matmul(&ur).map_err(map_candle)?.squeeze(2).map_err(map_candle)?;
                let pointwise = (pos_r.sqr().map_err(map_candle)?.affine(1.0 - wid, 0.0).map_err(map_candle)?
                    - pos_r.affine(2.0, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .sum_all()
                .map_err(map_candle)?;
                loss_i = (&loss_i + &pointwise).map_err(map_candle)?;
            }

            let weighted = loss_i.affine(self.coefficient[i] as f64, 0.0).map_err(map_candle)?;
            ranking = (&ranking + &weighted).map_err(map_candle)?;
        }

        let user_sq = uid.sqr().map_err(map_candle)?.sum_all().map_err(map_candle)?;
        let item_sq = item.sqr().map_err(map_candle)?.sum_all().map_err(map_candle)?;
        let regularization = (&user_sq + &item_sq)
            .map_err(map_candle)?
            .affine(0.5 * self.decay as f64, 0.0)
            .map_err(map_candle)?;

        Ok((ranking, regularization))
    }
}
