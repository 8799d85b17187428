//! Conflict-aware combination of per-task gradients.
//!
//! Task 0 (recommendation) is the anchor. On the shared parameters every
//! auxiliary gradient that points against the anchor is projected onto the
//! anchor's normal plane, then its norm is capped at `relax_factor` times a
//! moving average of the anchor norm. The probe parameter is outside the
//! shared set and receives the plain sum of all task gradients.

use candle_core::Tensor;
use tracing::debug;

use crate::error::{TrainError, TrainResult};
use crate::optim::grads::ParamGradients;
use crate::params::ModelParams;

#[derive(Debug, Clone)]
pub struct GradientSurgery {
    relax_factor: f64,
    beta: f64,
    anchor_norm_ema: Option<f64>,
}

/// What happened during one [`GradientSurgery::combine`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SurgeryStats {
    pub conflicts: usize,
    pub capped: usize,
    pub anchor_norm: f64,
}

impl GradientSurgery {
    pub fn new(relax_factor: f64, beta: f64) -> Self {
        Self {
            relax_factor,
            beta,
            anchor_norm_ema: None,
        }
    }

    pub fn anchor_norm_ema(&self) -> Option<f64> {
        self.anchor_norm_ema
    }

    /// Backpropagate each task loss separately and combine the results.
    pub fn step(
        &mut self,
        tasks: &[&Tensor],
        params: &ModelParams,
        probe: Option<usize>,
    ) -> TrainResult<(ParamGradients, SurgeryStats)> {
        let task_grads = tasks
            .iter()
            .map(|loss| ParamGradients::from_backward(loss, params))
            .collect::<TrainResult<Vec<_>>>()?;
        self.combine(&task_grads, probe)
    }

    pub fn combine(
        &mut self,
        task_grads: &[ParamGradients],
        probe: Option<usize>,
    ) -> TrainResult<(ParamGradients, SurgeryStats)> {
        let Some((anchor, auxiliary)) = task_grads.split_first() else {
            return Err(TrainError::config("gradient surgery needs at least one task"));
        };
        let shared = |idx: usize| Some(idx) != probe;
        let not_shared = |idx: usize| Some(idx) == probe;

        let anchor_sq = anchor.dot_where(anchor, shared)?;
        let anchor_norm = anchor_sq.sqrt();
        let ema = match self.anchor_norm_ema {
            None => anchor_norm,
            Some(prev) => self.beta * prev + (1.0 - self.beta) * anchor_norm,
        };
        self.anchor_norm_ema = Some(ema);
        let cap = self.relax_factor * ema;

        let mut stats = SurgeryStats {
            anchor_norm,
            ..SurgeryStats::default()
        };
        let mut combined = anchor.clone();
        for task in auxiliary {
            // probe parameter: plain sum
            combined = combined.axpy_where(1.0, task, not_shared)?;

            let mut g = task.clone();
            let overlap = g.dot_where(anchor, shared)?;
            if overlap < 0.0 && anchor_sq > 0.0 {
                g = g.axpy_where(-overlap / anchor_sq, anchor, shared)?;
                stats.conflicts += 1;
            }
            let norm = g.dot_where(&g, shared)?.sqrt();
            if norm > cap {
                let factor = if norm > 0.0 { cap / norm } else { 0.0 };
                g = g.scale_where(factor, shared)?;
                stats.capped += 1;
            }
            combined = combined.axpy_where(1.0, &g, shared)?;
        }
        Ok((combined, stats))
    }
}

/// First parameter, in registration order, that `loss` does not reach.
///
/// Returns `None` when every parameter receives a non-zero gradient, in
/// which case all parameters are treated as shared.
pub fn discover_probe(loss: &Tensor, params: &ModelParams) -> TrainResult<Option<usize>> {
    let grads = ParamGradients::from_backward(loss, params)?;
    for idx in 0..grads.len() {
        if grads.is_zero(idx)? {
            debug!(probe = idx, name = %params.names()[idx], "Non-shared probe parameter discovered");
            return Ok(Some(idx));
        }
    }
    debug!("Every parameter is reached by the intra-view loss; all shared");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grads(values: &[[f32; 2]]) -> ParamGradients {
        ParamGradients::new(
            values
                .iter()
                .map(|v| Some(Tensor::new(v, &Device::Cpu).unwrap()))
                .collect(),
        )
    }

    fn vec(g: &ParamGradients, idx: usize) -> Vec<f32> {
        g.get(idx).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_conflicting_gradient_projected() {
        let mut surgery = GradientSurgery::new(10.0, 0.9);
        let anchor = grads(&[[1.0, 0.0]]);
        let aux = grads(&[[-1.0, 1.0]]);
        let (combined, stats) = surgery.combine(&[anchor, aux], None).unwrap();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.capped, 0);
        // aux projected to [0, 1]
        let c = vec(&combined, 0);
        assert!((c[0] - 1.0).abs() < 1e-6);
        assert!((c[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_aligned_gradient_capped() {
        let mut surgery = GradientSurgery::new(0.5, 0.9);
        let anchor = grads(&[[2.0, 0.0]]);
        let aux = grads(&[[0.0, 4.0]]);
        let (combined, stats) = surgery.combine(&[anchor, aux], None).unwrap();
        assert_eq!(stats.conflicts, 0);
        assert_eq!(stats.capped, 1);
        // cap = 0.5 * 2
        assert_eq!(vec(&combined, 0), vec![2.0, 1.0]);
        assert_eq!(surgery.anchor_norm_ema(), Some(2.0));
    }

    #[test]
    fn test_probe_parameter_plain_sum() {
        let mut surgery = GradientSurgery::new(0.1, 0.9);
        let anchor = grads(&[[1.0, 0.0], [1.0, 1.0]]);
        let aux = grads(&[[-3.0, 0.0], [-3.0, 5.0]]);
        let (combined, _) = surgery.combine(&[anchor, aux], Some(1)).unwrap();
        assert_eq!(vec(&combined, 1), vec![-2.0, 6.0]);
        // shared: aux fully opposed, projected to zero
        let c = vec(&combined, 0);
        assert!((c[0] - 1.0).abs() < 1e-6 && c[1].abs() < 1e-6);
    }

    #[test]
    fn test_ema_tracks_anchor_norm() {
        let mut surgery = GradientSurgery::new(1.0, 0.5);
        surgery.combine(&[grads(&[[4.0, 0.0]])], None).unwrap();
        surgery.combine(&[grads(&[[0.0, 2.0]])], None).unwrap();
        assert_eq!(surgery.anchor_norm_ema(), Some(3.0));
        assert!(surgery.combine(&[], None).is_err());
    }
}
