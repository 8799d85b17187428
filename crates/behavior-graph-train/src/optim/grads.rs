//! Per-parameter gradient sets aligned with [`ModelParams::vars`].

use candle_core::{DType, Tensor, Var};

use crate::error::{map_candle, TrainResult};
use crate::params::ModelParams;
use crate::sparse_ops::scalar;

/// One gradient slot per registered parameter; `None` when the loss does not
/// reach that parameter.
#[derive(Debug, Clone)]
pub struct ParamGradients {
    grads: Vec<Option<Tensor>>,
}

impl ParamGradients {
    pub fn new(grads: Vec<Option<Tensor>>) -> Self {
        Self { grads }
    }

    /// Backpropagate `loss` and collect the gradient of every parameter.
    pub fn from_backward(loss: &Tensor, params: &ModelParams) -> TrainResult<Self> {
        Self::from_backward_vars(loss, &params.vars())
    }

    pub fn from_backward_vars(loss: &Tensor, vars: &[&Var]) -> TrainResult<Self> {
        let store = loss.backward().map_err(map_candle)?;
        let grads = vars
            .iter()
            .map(|var| store.get(var.as_tensor()).map(|g| g.detach()))
            .collect();
        Ok(Self { grads })
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Tensor> {
        self.grads.get(idx).and_then(|g| g.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&Tensor>> {
        self.grads.iter().map(|g| g.as_ref())
    }

    /// Missing or all-zero gradient at `idx`.
    pub fn is_zero(&self, idx: usize) -> TrainResult<bool> {
        match self.get(idx) {
            None => Ok(true),
            Some(g) => {
                let max = g
                    .abs()
                    .map_err(map_candle)?
                    .flatten_all()
                    .map_err(map_candle)?
                    .max(0)
                    .map_err(map_candle)?;
                Ok(scalar(&max)? == 0.0)
            }
        }
    }

    /// Inner product over the parameters selected by `include`.
    pub fn dot_where<F>(&self, other: &ParamGradients, include: F) -> TrainResult<f64>
    where
        F: Fn(usize) -> bool,
    {
        let mut total = 0.0;
        for (idx, (a, b)) in self.grads.iter().zip(&other.grads).enumerate() {
            if !include(idx) {
                continue;
            }
            if let (Some(a), Some(b)) = (a, b) {
                let prod = (a * b).map_err(map_candle)?.sum_all().map_err(map_candle)?;
                total += scalar(&prod)? as f64;
            }
        }
        Ok(total)
    }

    pub fn dot(&self, other: &ParamGradients) -> TrainResult<f64> {
        self.dot_where(other, |_| true)
    }

    pub fn norm(&self) -> TrainResult<f64> {
        Ok(self.dot(self)?.sqrt())
    }

    /// `self + factor · other` on the selected parameters; the rest of `self`
    /// is kept as is.
    pub fn axpy_where<F>(&self, factor: f64, other: &ParamGradients, include: F) -> TrainResult<Self>
    where
        F: Fn(usize) -> bool,
    {
        let mut grads = Vec::with_capacity(self.grads.len());
        for (idx, (a, b)) in self.grads.iter().zip(&other.grads).enumerate() {
            let combined = match (a, b) {
                (a, Some(b)) if include(idx) => {
                    let scaled = b.affine(factor, 0.0).map_err(map_candle)?;
                    match a {
                        Some(a) => Some((a + &scaled).map_err(map_candle)?),
                        None => Some(scaled),
                    }
                }
                (a, _) => a.clone(),
            };
            grads.push(combined);
        }
        Ok(Self { grads })
    }

    /// Multiply the selected parameters by `factor`.
    pub fn scale_where<F>(&self, factor: f64, include: F) -> TrainResult<Self>
    where
        F: Fn(usize) -> bool,
    {
        let grads = self
            .grads
            .iter()
            .enumerate()
            .map(|(idx, g)| match g {
                Some(g) if include(idx) => g.affine(factor, 0.0).map(Some).map_err(map_candle),
                other => Ok(other.clone()),
            })
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(Self { grads })
    }

    pub fn add(&self, other: &ParamGradients) -> TrainResult<Self> {
        self.axpy_where(1.0, other, |_| true)
    }

    /// Every present gradient is free of NaN and infinity.
    pub fn is_finite(&self) -> TrainResult<bool> {
        for g in self.grads.iter().flatten() {
            let values = g
                .flatten_all()
                .map_err(map_candle)?
                .to_dtype(DType::F32)
                .map_err(map_candle)?
                .to_vec1::<f32>()
                .map_err(map_candle)?;
            if !values.iter().all(|v| v.is_finite()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
