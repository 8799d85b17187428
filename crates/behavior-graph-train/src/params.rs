//! Learnable parameters of the relational encoder.
//!
//! Parameters live in typed fields; [`ModelParams::vars`] exposes them in a
//! fixed registration order that the optimizer and gradient bookkeeping
//! index into:
//!
//! 1. user table `[n_users, d]`
//! 2. item table `[n_items, d]`
//! 3. relation table `[R, d]`
//! 4. per layer `k`: `W_gc_k [d, d]`, then `W_rel_k [d, d]`
//! 5. per relation `i`: `S1_i [d, att_dim]`, then `S2_i [att_dim, 1]`

use candle_core::{Device, Tensor, Var};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::error::{map_candle, TrainError, TrainResult};

/// Sizes needed to allocate the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub n_users: usize,
    pub n_items: usize,
    pub n_relations: usize,
    pub embed_dim: usize,
    pub n_layers: usize,
    pub att_dim: usize,
}

#[derive(Debug, Clone)]
pub struct LayerParams {
    /// Graph-convolution transform.
    pub gc: Var,
    /// Relation-embedding transform.
    pub rel: Var,
}

#[derive(Debug, Clone)]
pub struct AttentionParams {
    /// Projection into the attention space.
    pub s1: Var,
    /// Scoring vector.
    pub s2: Var,
}

#[derive(Debug, Clone)]
pub struct ModelParams {
    dims: ModelDims,
    pub user: Var,
    pub item: Var,
    pub relation: Var,
    pub layers: Vec<LayerParams>,
    pub attention: Vec<AttentionParams>,
}

/// Xavier-uniform matrix drawn from `rng`.
fn xavier_uniform<R>(rows: usize, cols: usize, rng: &mut R, device: &Device) -> TrainResult<Var>
where
    R: Rng + ?Sized,
{
    let bound = (6.0 / (rows + cols) as f64).sqrt() as f32;
    let dist = Uniform::new_inclusive(-bound, bound);
    let data: Vec<f32> = (0..rows * cols).map(|_| dist.sample(rng)).collect();
    let tensor = Tensor::from_vec(data, (rows, cols), device).map_err(map_candle)?;
    Var::from_tensor(&tensor).map_err(map_candle)
}

impl ModelParams {
    /// Allocate and initialize every parameter. Draw order follows
    /// registration order, so a fixed seed gives fixed weights.
    pub fn init<R>(dims: ModelDims, rng: &mut R, device: &Device) -> TrainResult<Self>
    where
        R: Rng + ?Sized,
    {
        if dims.n_users == 0 || dims.n_items == 0 || dims.n_relations == 0 {
            return Err(TrainError::config(format!(
                "model needs users, items and relations (got {} / {} / {})",
                dims.n_users, dims.n_items, dims.n_relations
            )));
        }
        let d = dims.embed_dim;
        let user = xavier_uniform(dims.n_users, d, rng, device)?;
        let item = xavier_uniform(dims.n_items, d, rng, device)?;
        let relation = xavier_uniform(dims.n_relations, d, rng, device)?;
        let layers = (0..dims.n_layers)
            .map(|_| {
                Ok(LayerParams {
                    gc: xavier_uniform(d, d, rng, device)?,
                    rel: xavier_uniform(d, d, rng, device)?,
                })
            })
            .collect::<TrainResult<Vec<_>>>()?;
        let attention = (0..dims.n_relations)
            .map(|_| {
                Ok(AttentionParams {
                    s1: xavier_uniform(d, dims.att_dim, rng, device)?,
                    s2: xavier_uniform(dims.att_dim, 1, rng, device)?,
                })
            })
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(Self {
            dims,
            user,
            item,
            relation,
            layers,
            attention,
        })
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    /// All parameters in registration order.
    pub fn vars(&self) -> Vec<&Var> {
        let mut vars = vec![&self.user, &self.item, &self.relation];
        for layer in &self.layers {
            vars.push(&layer.gc);
            vars.push(&layer.rel);
        }
        for att in &self.attention {
            vars.push(&att.s1);
            vars.push(&att.s2);
        }
        vars
    }

    /// Display names aligned with [`Self::vars`].
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![
            "user_embedding".to_string(),
            "item_embedding".to_string(),
            "relation_embedding".to_string(),
        ];
        for k in 0..self.layers.len() {
            names.push(format!("W_gc_{}", k));
            names.push(format!("W_rel_{}", k));
        }
        for i in 0..self.attention.len() {
            names.push(format!("att_s1_{}", i));
            names.push(format!("att_s2_{}", i));
        }
        names
    }

    pub fn len(&self) -> usize {
        3 + 2 * self.layers.len() + 2 * self.attention.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Total number of scalar weights.
    pub fn num_weights(&self) -> usize {
        self.vars().iter().map(|v| v.as_tensor().elem_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn dims() -> ModelDims {
        ModelDims {
            n_users: 4,
            n_items: 3,
            n_relations: 2,
            embed_dim: 2,
            n_layers: 1,
            att_dim: 3,
        }
    }

    #[test]
    fn test_registration_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let params = ModelParams::init(dims(), &mut rng, &Device::Cpu).unwrap();
        let names = params.names();
        assert_eq!(names.len(), params.len());
        assert_eq!(params.vars().len(), params.len());
        assert_eq!(
            names,
            vec![
                "user_embedding",
                "item_embedding",
                "relation_embedding",
                "W_gc_0",
                "W_rel_0",
                "att_s1_0",
                "att_s2_0",
                "att_s1_1",
                "att_s2_1"
            ]
        );
        assert_eq!(params.vars()[1].as_tensor().dims(), &[3, 2]);
        assert_eq!(params.vars()[6].as_tensor().dims(), &[3, 1]);
    }

    #[test]
    fn test_seeded_init_is_reproducible_and_bounded() {
        let a = ModelParams::init(dims(), &mut ChaCha8Rng::seed_from_u64(1), &Device::Cpu).unwrap();
        let b = ModelParams::init(dims(), &mut ChaCha8Rng::seed_from_u64(1), &Device::Cpu).unwrap();
        let va: Vec<f32> = a.user.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        let vb: Vec<f32> = b.user.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(va, vb);
        let bound = (6.0f32 / 6.0).sqrt();
        assert!(va.iter().all(|v| v.abs() <= bound));
        assert_eq!(a.num_weights(), 8 + 6 + 4 + 4 + 4 + 2 * (6 + 3));
    }

    #[test]
    fn test_rejects_empty_id_space() {
        let mut d = dims();
        d.n_items = 0;
        assert!(ModelParams::init(d, &mut ChaCha8Rng::seed_from_u64(0), &Device::Cpu).is_err());
    }
}
