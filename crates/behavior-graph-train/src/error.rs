//! Error type for model construction and training.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Configuration | ConfigError, ShapeMismatch | Fix configuration |
//! | Numerics | NumericalDivergence | Lower lr / inspect data, rerun |
//! | Infrastructure | TensorError, Graph | Check device / inputs |
//!
//! Nothing is rolled back: a diverged run stops at the epoch that produced
//! the NaN.

use behavior_graph_core::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    // === Configuration Errors ===
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Tensor dimensions disagree with the model layout.
    #[error("Shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    // === Numerical Errors ===
    /// Epoch loss became NaN.
    #[error("Numerical divergence at epoch {epoch}: loss = {loss}")]
    NumericalDivergence { epoch: usize, loss: f64 },

    // === Infrastructure Errors ===
    /// A candle operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// Graph, data or configuration failure from the core crate.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl TrainError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the error stems from configuration (as opposed to data or numerics).
    pub fn is_config(&self) -> bool {
        match self {
            TrainError::ConfigError { .. } | TrainError::ShapeMismatch { .. } => true,
            TrainError::Graph(inner) => inner.is_config(),
            _ => false,
        }
    }
}

pub type TrainResult<T> = Result<T, TrainError>;

/// Map candle errors to [`TrainError::TensorError`].
pub(crate) fn map_candle(e: candle_core::Error) -> TrainError {
    TrainError::TensorError {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divergence_message() {
        let err = TrainError::NumericalDivergence {
            epoch: 4,
            loss: f64::NAN,
        };
        let msg = err.to_string();
        assert!(msg.contains("epoch 4"));
        assert!(msg.contains("NaN"));
        assert!(!err.is_config());
    }

    #[test]
    fn test_graph_config_errors_stay_config() {
        let err: TrainError = GraphError::config("bad ratio").into();
        assert!(err.is_config());
        let err: TrainError = GraphError::DataError {
            message: "empty".to_string(),
        }
        .into();
        assert!(!err.is_config());
    }
}
