//! Tensor helpers: sparse propagation and a few elementwise ops.
//!
//! Candle has no sparse tensor type, so `A · X` is written as a gather of the
//! source rows, a per-entry scale and a scatter-add into the target rows.
//! All three steps are differentiable with respect to `X`.

use behavior_graph_core::SparseAdjacency;
use candle_core::{DType, Device, Tensor};

use crate::error::{map_candle, TrainResult};

/// Squared-norm floor inside the L2 normalization square root.
const NORM_EPS: f64 = 1e-24;

/// Normalized adjacency uploaded to a device in COO form.
#[derive(Debug, Clone)]
pub struct SparseTensor {
    n_nodes: usize,
    nnz: usize,
    rows: Tensor,
    cols: Tensor,
    /// `[nnz, 1]` so it broadcasts over the feature dimension.
    values: Tensor,
}

impl SparseTensor {
    pub fn from_adjacency(adj: &SparseAdjacency, device: &Device) -> TrainResult<Self> {
        let (rows, cols, values) = adj.to_coo();
        let nnz = values.len();
        Ok(Self {
            n_nodes: adj.n_nodes(),
            nnz,
            rows: Tensor::from_vec(rows, nnz, device).map_err(map_candle)?,
            cols: Tensor::from_vec(cols, nnz, device).map_err(map_candle)?,
            values: Tensor::from_vec(values, (nnz, 1), device).map_err(map_candle)?,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// `A · x` for `x` of shape `[n_nodes, d]`.
    pub fn matmul(&self, x: &Tensor) -> TrainResult<Tensor> {
        if self.nnz == 0 {
            return x.zeros_like().map_err(map_candle);
        }
        let gathered = x.index_select(&self.cols, 0).map_err(map_candle)?;
        let weighted = gathered.broadcast_mul(&self.values).map_err(map_candle)?;
        x.zeros_like()
            .map_err(map_candle)?
            .index_add(&self.rows, &weighted, 0)
            .map_err(map_candle)
    }
}

/// Upload node ids as a `u32` index tensor.
pub fn index_tensor(ids: &[u32], device: &Device) -> TrainResult<Tensor> {
    Tensor::from_slice(ids, ids.len(), device).map_err(map_candle)
}

/// Row-wise L2 normalization. All-zero rows stay zero.
pub fn l2_normalize(x: &Tensor) -> TrainResult<Tensor> {
    let norm = x
        .sqr()
        .map_err(map_candle)?
        .sum_keepdim(1)
        .map_err(map_candle)?
        .affine(1.0, NORM_EPS)
        .map_err(map_candle)?
        .sqrt()
        .map_err(map_candle)?;
    x.broadcast_div(&norm).map_err(map_candle)
}

/// LeakyReLU as `max(x, 0) + slope * min(x, 0)`.
pub fn leaky_relu(x: &Tensor, slope: f64) -> TrainResult<Tensor> {
    let zeros = x.zeros_like().map_err(map_candle)?;
    let positive = x.maximum(&zeros).map_err(map_candle)?;
    let negative = x
        .minimum(&zeros)
        .map_err(map_candle)?
        .affine(slope, 0.0)
        .map_err(map_candle)?;
    (&positive + &negative).map_err(map_candle)
}

/// Slice `[:, i, :]` of a `[n, R, d]` tensor as a contiguous `[n, d]`.
pub fn relation_slice(x: &Tensor, relation: usize) -> TrainResult<Tensor> {
    x.narrow(1, relation, 1)
        .map_err(map_candle)?
        .squeeze(1)
        .map_err(map_candle)?
        .contiguous()
        .map_err(map_candle)
}

/// Host copy of a scalar tensor.
pub fn scalar(x: &Tensor) -> TrainResult<f32> {
    x.to_dtype(DType::F32)
        .map_err(map_candle)?
        .to_scalar::<f32>()
        .map_err(map_candle)
}
