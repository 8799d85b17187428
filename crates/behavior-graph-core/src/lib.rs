//! Graph side of the multi-behavior recommender.
//!
//! Everything here is plain data with no tensor dependency: normalized
//! adjacencies, augmented views, padded labels, similarity masks, dataset
//! files and run configuration. The training crate turns these into tensors.

pub mod augment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod labels;
pub mod relation;
pub mod similarity;
pub mod sparse;

pub use augment::{AugmentKind, GraphAugmentor, ViewPair, ViewSchedule};
pub use config::{
    AugmentConfig, LossConfig, ModelConfig, OptimConfig, RunConfig, SslMode, TrainingConfig,
};
pub use dataset::InteractionData;
pub use error::{GraphError, GraphResult};
pub use labels::{InteractionMap, TrainingBatch, TrainingInstances, LABEL_QUANTILE};
pub use relation::Behaviors;
pub use similarity::{ExclusionMask, SimilarityMatrix};
pub use sparse::{SparseAdjacency, SparseMatrixBuilder};
