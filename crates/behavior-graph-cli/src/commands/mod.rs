//! CLI command handlers
//!
//! - `train`: load a dataset directory, train, report the best evaluation
//! - `inspect_config`: print a resolved configuration

pub mod inspect_config;
pub mod train;

use std::path::Path;

use behavior_graph_core::{GraphResult, RunConfig};

/// Config file (or defaults) with `MBGRAPH_*` environment overrides applied.
pub fn load_config(path: Option<&Path>) -> GraphResult<RunConfig> {
    let config = match path {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    Ok(config.with_env_overrides())
}
