//! Exit codes for the command-line trainer.
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Generic failure (I/O, data, tensor backend) |
//! | 2 | Numerical divergence (NaN loss) |
//! | 3 | Configuration error |

use behavior_graph_core::GraphError;
use behavior_graph_train::TrainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CliExitCode {
    Success = 0,
    Failure = 1,
    Divergence = 2,
    Config = 3,
}

pub fn exit_code_for_error(err: &TrainError) -> CliExitCode {
    match err {
        TrainError::NumericalDivergence { .. } => CliExitCode::Divergence,
        e if e.is_config() => CliExitCode::Config,
        _ => CliExitCode::Failure,
    }
}

pub fn exit_code_for_graph_error(err: &GraphError) -> CliExitCode {
    if err.is_config() {
        CliExitCode::Config
    } else {
        CliExitCode::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let nan = TrainError::NumericalDivergence { epoch: 3, loss: f64::NAN };
        assert_eq!(exit_code_for_error(&nan), CliExitCode::Divergence);
        assert_eq!(exit_code_for_error(&TrainError::config("bad")), CliExitCode::Config);
        let wrapped = TrainError::Graph(GraphError::config("bad width"));
        assert_eq!(exit_code_for_error(&wrapped), CliExitCode::Config);
        let data = TrainError::Graph(GraphError::DataError {
            message: "empty".to_string(),
        });
        assert_eq!(exit_code_for_error(&data), CliExitCode::Failure);
        assert_eq!(CliExitCode::Config as i32, 3);
    }
}
