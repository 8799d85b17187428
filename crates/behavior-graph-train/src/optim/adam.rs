//! Adam for Candle Var tensors, driven by externally combined gradients.
//!
//! Implements Adam with:
//! - Per-parameter moment estimates (m, v)
//! - Bias correction
//! - Step-wise learning-rate decay through [`StepLr`]

use candle_core::{DType, Tensor, Var};

use crate::error::{map_candle, TrainError, TrainResult};
use crate::optim::grads::ParamGradients;

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// A tracked parameter with its moment estimates.
struct TrackedParam {
    var: Var,
    /// First moment estimate.
    m: Tensor,
    /// Second moment estimate.
    v: Tensor,
}

pub struct Adam {
    config: AdamConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl Adam {
    /// Track `vars` in the order gradients will be supplied.
    pub fn new(config: AdamConfig, vars: &[&Var]) -> TrainResult<Self> {
        let params = vars
            .iter()
            .map(|var| {
                let t = var.as_tensor();
                let m = Tensor::zeros(t.shape(), DType::F32, t.device()).map_err(map_candle)?;
                let v = m.clone();
                Ok(TrackedParam {
                    var: (*var).clone(),
                    m,
                    v,
                })
            })
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Apply one update. Parameters without a gradient keep their value and
    /// moments.
    pub fn step(&mut self, grads: &ParamGradients) -> TrainResult<()> {
        if grads.len() != self.params.len() {
            return Err(TrainError::ShapeMismatch {
                what: "gradient set".to_string(),
                expected: self.params.len().to_string(),
                actual: grads.len().to_string(),
            });
        }
        self.step += 1;
        let t = self.step as i32;
        let bc1 = 1.0 - self.config.beta1.powi(t);
        let bc2 = 1.0 - self.config.beta2.powi(t);
        let lr = self.config.lr;

        for (param, grad) in self.params.iter_mut().zip(grads.iter()) {
            let Some(grad) = grad else { continue };

            // m = β1 * m + (1 - β1) * grad
            param.m = param
                .m
                .affine(self.config.beta1, 0.0)
                .map_err(map_candle)?
                .add(&grad.affine(1.0 - self.config.beta1, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();

            // v = β2 * v + (1 - β2) * grad^2
            let grad_sq = grad.sqr().map_err(map_candle)?;
            param.v = param
                .v
                .affine(self.config.beta2, 0.0)
                .map_err(map_candle)?
                .add(&grad_sq.affine(1.0 - self.config.beta2, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(map_candle)?;
            let denom = param
                .v
                .affine(1.0 / bc2, 0.0)
                .map_err(map_candle)?
                .sqrt()
                .map_err(map_candle)?
                .affine(1.0, self.config.epsilon)
                .map_err(map_candle)?;
            let update = m_hat.div(&denom).map_err(map_candle)?.affine(-lr, 0.0).map_err(map_candle)?;

            let new_val = param
                .var
                .as_tensor()
                .add(&update)
                .map_err(map_candle)?
                .detach();
            param.var.set(&new_val).map_err(map_candle)?;
        }
        Ok(())
    }
}

/// Multiply the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }

    /// Advance one epoch and return the learning rate for the next one.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.base_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_first_step_moves_by_lr() {
        let var = Var::new(&[1f32, -1.0], &Device::Cpu).unwrap();
        let mut opt = Adam::new(
            AdamConfig {
                lr: 0.1,
                ..AdamConfig::default()
            },
            &[&var],
        )
        .unwrap();
        let grad = Tensor::new(&[2f32, -0.5], &Device::Cpu).unwrap();
        opt.step(&ParamGradients::new(vec![Some(grad)])).unwrap();
        // bias-corrected first step is lr * sign(grad)
        let v = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((v[0] - 0.9).abs() < 1e-5);
        assert!((v[1] + 0.9).abs() < 1e-5);
        assert_eq!(opt.global_step(), 1);
    }

    #[test]
    fn test_missing_gradient_leaves_param() {
        let a = Var::new(&[1f32], &Device::Cpu).unwrap();
        let b = Var::new(&[5f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new(AdamConfig::default(), &[&a, &b]).unwrap();
        let g = ParamGradients::new(vec![Some(Tensor::new(&[1f32], &Device::Cpu).unwrap()), None]);
        opt.step(&g).unwrap();
        assert_eq!(b.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0]);
        assert!(opt.step(&ParamGradients::new(vec![None])).is_err());
    }

    #[test]
    fn test_step_lr_schedule() {
        let mut sched = StepLr::new(1.0, 2, 0.5);
        let lrs: Vec<f64> = (0..4).map(|_| sched.step()).collect();
        assert_eq!(lrs, vec![1.0, 0.5, 0.5, 0.25]);
    }
}
