//! Multi-relational graph propagation with attention fusion across relations.
//!
//! Each layer propagates every relation channel over its own adjacency,
//! modulates it by that relation's current embedding, transforms it, and
//! then lets each channel attend over all channels of the same node:
//!
//! ```text
//! h_i   = LeakyReLU(((A_i x_i) ⊙ r_i^k) W_gc_k)
//! a_i   = softmax_R(tanh(H S1_i) S2_i)        H = stack_i h_i
//! x'_i  = Σ_j a_ij h_j
//! r^k+1 = r^k W_rel_k
//! ```
//!
//! The output of each pass is the mean of the input and every layer output.
//! Training runs three passes: the main graph and two augmented views that
//! differ only in the target relation's adjacency.

use std::sync::Arc;

use behavior_graph_core::{Behaviors, ModelConfig, SparseAdjacency, ViewSchedule};
use candle_core::{Device, Tensor};
use rand::distributions::{Bernoulli, Distribution};
use rand::{Rng, RngCore};

use crate::error::{map_candle, TrainError, TrainResult};
use crate::params::ModelParams;
use crate::sparse_ops::{leaky_relu, relation_slice, SparseTensor};

/// Negative slope of the propagation nonlinearity.
pub const LEAKY_SLOPE: f64 = 0.01;

/// Per-layer augmented views uploaded to the device.
#[derive(Debug, Clone)]
pub struct DeviceViews {
    pairs: Vec<(Arc<SparseTensor>, Arc<SparseTensor>)>,
}

impl DeviceViews {
    /// Upload a schedule. Layers sharing one view pair share one upload.
    pub fn upload(schedule: &ViewSchedule, device: &Device) -> TrainResult<Self> {
        let mut pairs: Vec<(Arc<SparseTensor>, Arc<SparseTensor>)> = Vec::new();
        for k in 0..schedule.n_layers() {
            let pair = schedule.layer(k);
            if k > 0 {
                let prev = schedule.layer(k - 1);
                if Arc::ptr_eq(&prev.first, &pair.first) && Arc::ptr_eq(&prev.second, &pair.second) {
                    let shared = pairs[k - 1].clone();
                    pairs.push(shared);
                    continue;
                }
            }
            pairs.push((
                Arc::new(SparseTensor::from_adjacency(&pair.first, device)?),
                Arc::new(SparseTensor::from_adjacency(&pair.second, device)?),
            ));
        }
        Ok(Self { pairs })
    }

    pub fn n_layers(&self) -> usize {
        self.pairs.len()
    }
}

/// Everything one training forward pass produces.
///
/// Node tensors are `[n, R, d]`; item tensors carry an extra all-zero
/// padding row at index `n_items`.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub user: Tensor,
    pub item: Tensor,
    pub user_view1: Tensor,
    pub item_view1: Tensor,
    pub user_view2: Tensor,
    pub item_view2: Tensor,
    /// Mean relation-embedding trajectory, `[R, d]`.
    pub relations: Tensor,
    /// Main-pass attention of the last layer, `[n_users, R, R]`.
    pub attention_user: Tensor,
    /// Main-pass attention of the last layer, `[n_items, R, R]`.
    pub attention_item: Tensor,
    /// Main-pass attention of every layer, `[n_users + n_items, R, R]`.
    pub layer_attention: Vec<Tensor>,
}

/// Main-pass embeddings only (inference).
#[derive(Debug, Clone)]
pub struct MainOutput {
    pub user: Tensor,
    pub item: Tensor,
    pub relations: Tensor,
    pub layer_attention: Vec<Tensor>,
}

/// Which adjacency the target relation uses in a pass.
#[derive(Clone, Copy)]
enum Pass<'a> {
    Main,
    View(&'a DeviceViews, ViewSide),
}

#[derive(Clone, Copy)]
enum ViewSide {
    First,
    Second,
}

struct PassOutput {
    user: Tensor,
    item: Tensor,
    attention: Vec<Tensor>,
}

pub struct RelationalGraphEncoder {
    params: ModelParams,
    adjacencies: Vec<SparseTensor>,
    target: usize,
    dropout: Option<Bernoulli>,
    keep_scale: f64,
    device: Device,
}

impl RelationalGraphEncoder {
    /// `adjacencies` holds one normalized static graph per behavior.
    pub fn new(
        params: ModelParams,
        adjacencies: &[SparseAdjacency],
        behaviors: &Behaviors,
        config: &ModelConfig,
        device: &Device,
    ) -> TrainResult<Self> {
        config.validate()?;
        behaviors.expect_len("static adjacencies", adjacencies.len())?;
        let dims = *params.dims();
        behaviors.expect_len("model relations", dims.n_relations)?;
        if dims.embed_dim != config.embed_dim || dims.n_layers != config.n_layers() {
            return Err(TrainError::ShapeMismatch {
                what: "model parameters".to_string(),
                expected: format!("d={} layers={}", config.embed_dim, config.n_layers()),
                actual: format!("d={} layers={}", dims.embed_dim, dims.n_layers),
            });
        }
        let n_nodes = dims.n_users + dims.n_items;
        let adjacencies = adjacencies
            .iter()
            .map(|adj| {
                if adj.n_nodes() != n_nodes {
                    return Err(TrainError::ShapeMismatch {
                        what: "adjacency".to_string(),
                        expected: n_nodes.to_string(),
                        actual: adj.n_nodes().to_string(),
                    });
                }
                SparseTensor::from_adjacency(adj, device)
            })
            .collect::<TrainResult<Vec<_>>>()?;

        let dropout = if config.mess_dropout > 0.0 {
            Some(
                Bernoulli::new(1.0 - config.mess_dropout)
                    .map_err(|e| TrainError::config(format!("mess_dropout: {}", e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            params,
            adjacencies,
            target: behaviors.target(),
            dropout,
            keep_scale: 1.0 / (1.0 - config.mess_dropout),
            device: device.clone(),
        })
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn n_relations(&self) -> usize {
        self.params.dims().n_relations
    }

    /// Training forward: main pass plus both views, dropout on.
    pub fn forward<R: Rng>(&self, views: &DeviceViews, rng: &mut R) -> TrainResult<EncoderOutput> {
        let n_layers = self.params.dims().n_layers;
        if views.n_layers() != n_layers {
            return Err(TrainError::ShapeMismatch {
                what: "view schedule layers".to_string(),
                expected: n_layers.to_string(),
                actual: views.n_layers().to_string(),
            });
        }
        let rng: &mut dyn RngCore = rng;
        let trajectory = self.relation_trajectory()?;
        let main = self.run_pass(Pass::Main, &trajectory, Some(&mut *rng))?;
        let view1 = self.run_pass(Pass::View(views, ViewSide::First), &trajectory, Some(&mut *rng))?;
        let view2 = self.run_pass(Pass::View(views, ViewSide::Second), &trajectory, Some(&mut *rng))?;

        let last = main.attention.last().ok_or_else(|| TrainError::config("model has no layers"))?;
        let n_users = self.params.dims().n_users;
        let n_items = self.params.dims().n_items;
        Ok(EncoderOutput {
            attention_user: last.narrow(0, 0, n_users).map_err(map_candle)?,
            attention_item: last.narrow(0, n_users, n_items).map_err(map_candle)?,
            relations: mean_trajectory(&trajectory)?,
            user: main.user,
            item: main.item,
            user_view1: view1.user,
            item_view1: view1.item,
            user_view2: view2.user,
            item_view2: view2.item,
            layer_attention: main.attention,
        })
    }

    /// Main pass without dropout, for evaluation.
    pub fn forward_main(&self) -> TrainResult<MainOutput> {
        let trajectory = self.relation_trajectory()?;
        let main = self.run_pass(Pass::Main, &trajectory, None)?;
        Ok(MainOutput {
            user: main.user,
            item: main.item,
            relations: mean_trajectory(&trajectory)?,
            layer_attention: main.attention,
        })
    }

    /// `r^0 .. r^L`, each `[R, d]`.
    fn relation_trajectory(&self) -> TrainResult<Vec<Tensor>> {
        let mut trajectory = vec![self.params.relation.as_tensor().clone()];
        for layer in &self.params.layers {
            let next = trajectory[trajectory.len() - 1]
                .matmul(layer.rel.as_tensor())
                .map_err(map_candle)?;
            trajectory.push(next);
        }
        Ok(trajectory)
    }

    fn adjacency<'a>(&'a self, pass: Pass<'a>, relation: usize, layer: usize) -> &'a SparseTensor {
        match pass {
            Pass::View(views, side) if relation == self.target => {
                let (first, second) = &views.pairs[layer];
                match side {
                    ViewSide::First => first.as_ref(),
                    ViewSide::Second => second.as_ref(),
                }
            }
            _ => &self.adjacencies[relation],
        }
    }

    fn run_pass(
        &self,
        pass: Pass<'_>,
        trajectory: &[Tensor],
        mut rng: Option<&mut dyn RngCore>,
    ) -> TrainResult<PassOutput> {
        let dims = *self.params.dims();
        let n_rel = dims.n_relations;
        let n_nodes = dims.n_users + dims.n_items;
        let d = dims.embed_dim;

        let ego0 = Tensor::cat(&[self.params.user.as_tensor(), self.params.item.as_tensor()], 0)
            .map_err(map_candle)?
            .unsqueeze(1)
            .map_err(map_candle)?
            .broadcast_as((n_nodes, n_rel, d))
            .map_err(map_candle)?
            .contiguous()
            .map_err(map_candle)?;

        let mut ego = ego0.clone();
        let mut total = ego0;
        let mut attention = Vec::with_capacity(dims.n_layers);
        for (k, layer) in self.params.layers.iter().enumerate() {
            let rel_k = &trajectory[k];
            let mut channels = Vec::with_capacity(n_rel);
            for i in 0..n_rel {
                let x_i = relation_slice(&ego, i)?;
                let propagated = self.adjacency(pass, i, k).matmul(&x_i)?;
                let r_ik = rel_k.narrow(0, i, 1).map_err(map_candle)?;
                let h = propagated
                    .broadcast_mul(&r_ik)
                    .map_err(map_candle)?
                    .matmul(layer.gc.as_tensor())
                    .map_err(map_candle)?;
                channels.push(leaky_relu(&h, LEAKY_SLOPE)?);
            }
            let stacked = Tensor::stack(&channels, 1).map_err(map_candle)?;
            let (fused, attn) = self.fuse(&stacked)?;
            let fused = match rng.as_deref_mut() {
                Some(rng) => self.dropout(&fused, rng)?,
                None => fused,
            };
            total = (&total + &fused).map_err(map_candle)?;
            ego = fused;
            attention.push(attn);
        }

        let mean = total
            .affine(1.0 / (dims.n_layers as f64 + 1.0), 0.0)
            .map_err(map_candle)?;
        let user = mean.narrow(0, 0, dims.n_users).map_err(map_candle)?;
        let item = mean.narrow(0, dims.n_users, dims.n_items).map_err(map_candle)?;
        let padding = Tensor::zeros((1, n_rel, d), item.dtype(), &self.device).map_err(map_candle)?;
        let item = Tensor::cat(&[&item, &padding], 0).map_err(map_candle)?;
        Ok(PassOutput {
            user,
            item,
            attention,
        })
    }

    /// Attention fusion of a stacked `[N, R, d]` tensor.
    ///
    /// Returns the fused `[N, R, d]` tensor and the weights `[N, R, R]`,
    /// where `weights[n, i, :]` is channel `i`'s distribution over channels.
    fn fuse(&self, stacked: &Tensor) -> TrainResult<(Tensor, Tensor)> {
        let (n, n_rel, d) = stacked.dims3().map_err(map_candle)?;
        let flat = stacked.reshape((n * n_rel, d)).map_err(map_candle)?;
        let mut fused = Vec::with_capacity(n_rel);
        let mut weights = Vec::with_capacity(n_rel);
        for att in &self.params.attention {
            let scores = flat
                .matmul(att.s1.as_tensor())
                .map_err(map_candle)?
                .tanh()
                .map_err(map_candle)?
                .matmul(att.s2.as_tensor())
                .map_err(map_candle)?
                .reshape((n, n_rel))
                .map_err(map_candle)?;
            let a = candle_nn::ops::softmax(&scores, 1).map_err(map_candle)?;
            let combined = a
                .unsqueeze(2)
                .map_err(map_candle)?
                .broadcast_mul(stacked)
                .map_err(map_candle)?
                .sum(1)
                .map_err(map_candle)?;
            fused.push(combined);
            weights.push(a);
        }
        Ok((
            Tensor::stack(&fused, 1).map_err(map_candle)?,
            Tensor::stack(&weights, 1).map_err(map_candle)?,
        ))
    }

    /// Inverted dropout with a mask drawn from `rng`.
    fn dropout(&self, x: &Tensor, rng: &mut dyn RngCore) -> TrainResult<Tensor> {
        let Some(keep) = self.dropout else {
            return Ok(x.clone());
        };
        let scale = self.keep_scale as f32;
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if keep.sample(rng) { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, x.dims(), &self.device).map_err(map_candle)?;
        x.mul(&mask).map_err(map_candle)
    }
}

fn mean_trajectory(trajectory: &[Tensor]) -> TrainResult<Tensor> {
    Tensor::stack(trajectory, 0)
        .map_err(map_candle)?
        .mean(0)
        .map_err(map_candle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ModelDims;
    use behavior_graph_core::{AugmentKind, GraphAugmentor};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup(dropout: f64) -> (RelationalGraphEncoder, GraphAugmentor) {
        let behaviors = Behaviors::parse("view,buy").unwrap();
        let view_edges = vec![(0, 0), (0, 1), (1, 1), (2, 2), (3, 0)];
        let buy_edges = vec![(0, 1), (1, 1), (2, 2), (3, 0)];
        let adjs = vec![
            SparseAdjacency::normalized_bipartite(4, 3, view_edges).unwrap(),
            SparseAdjacency::normalized_bipartite(4, 3, buy_edges.clone()).unwrap(),
        ];
        let config = ModelConfig {
            embed_dim: 2,
            layer_sizes: vec![2, 2],
            att_dim: 2,
            mess_dropout: dropout,
        };
        let dims = ModelDims {
            n_users: 4,
            n_items: 3,
            n_relations: 2,
            embed_dim: 2,
            n_layers: 2,
            att_dim: 2,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let params = ModelParams::init(dims, &mut rng, &Device::Cpu).unwrap();
        let encoder =
            RelationalGraphEncoder::new(params, &adjs, &behaviors, &config, &Device::Cpu).unwrap();
        (encoder, GraphAugmentor::new(4, 3, buy_edges))
    }

    fn views(aug: &GraphAugmentor, kind: AugmentKind) -> DeviceViews {
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let schedule = ViewSchedule::generate(aug, kind, 0.3, 2, &mut rng).unwrap();
        DeviceViews::upload(&schedule, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_shapes_and_padding_row() {
        let (encoder, aug) = setup(0.1);
        let views = views(&aug, AugmentKind::RandomWalk);
        let out = encoder.forward(&views, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(out.user.dims(), &[4, 2, 2]);
        for item in [&out.item, &out.item_view1, &out.item_view2] {
            assert_eq!(item.dims(), &[4, 2, 2]);
            let pad: Vec<f32> = item.narrow(0, 3, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            assert!(pad.iter().all(|&v| v == 0.0));
        }
        assert_eq!(out.relations.dims(), &[2, 2]);
        assert_eq!(out.attention_user.dims(), &[4, 2, 2]);
        assert_eq!(out.attention_item.dims(), &[3, 2, 2]);
        assert_eq!(out.layer_attention.len(), 2);
    }

    #[test]
    fn test_attention_rows_sum_to_one() {
        let (encoder, _) = setup(0.0);
        let out = encoder.forward_main().unwrap();
        for attn in &out.layer_attention {
            let sums: Vec<Vec<f32>> = attn.sum(2).unwrap().to_vec2().unwrap();
            for s in sums.iter().flatten() {
                assert!((s - 1.0).abs() < 1e-5, "attention sum {}", s);
            }
        }
    }

    #[test]
    fn test_identical_views_without_dropout_match_main() {
        let (encoder, aug) = setup(0.0);
        let schedule = ViewSchedule::fixed(aug.unperturbed().unwrap(), 2);
        let views = DeviceViews::upload(&schedule, &Device::Cpu).unwrap();
        let out = encoder.forward(&views, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let a: Vec<f32> = out.user.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = out.user_view1.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_layer_count_mismatch() {
        let (encoder, aug) = setup(0.0);
        let schedule = ViewSchedule::fixed(aug.unperturbed().unwrap(), 1);
        let views = DeviceViews::upload(&schedule, &Device::Cpu).unwrap();
        let err = encoder.forward(&views, &mut ChaCha8Rng::seed_from_u64(0)).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_rejects_relation_count_mismatch() {
        let behaviors = Behaviors::parse("view,cart,buy").unwrap();
        let adj = SparseAdjacency::normalized_bipartite(1, 1, [(0, 0)]).unwrap();
        let config = ModelConfig {
            embed_dim: 2,
            layer_sizes: vec![2],
            att_dim: 2,
            mess_dropout: 0.0,
        };
        let dims = ModelDims {
            n_users: 1,
            n_items: 1,
            n_relations: 3,
            embed_dim: 2,
            n_layers: 1,
            att_dim: 2,
        };
        let params = ModelParams::init(dims, &mut ChaCha8Rng::seed_from_u64(0), &Device::Cpu).unwrap();
        let err = RelationalGraphEncoder::new(params, &[adj.clone(), adj], &behaviors, &config, &Device::Cpu)
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_shared_views_upload_once() {
        let (_, aug) = setup(0.0);
        let views = views(&aug, AugmentKind::EdgeDropout);
        assert!(Arc::ptr_eq(&views.pairs[0].0, &views.pairs[1].0));
    }
}
