//! Error type for graph construction, data loading and configuration.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Configuration | ConfigError, RelationMismatch | Fix configuration |
//! | Data | InvalidIndex, DataError, ParseError | Fix input data |
//! | Infrastructure | IoError | Fix paths / permissions |
//!
//! Nothing here is retried. Configuration problems surface at construction
//! time and abort the run.

use thiserror::Error;

/// Error type for everything in `behavior-graph-core`.
#[derive(Debug, Error)]
pub enum GraphError {
    // === Configuration Errors ===
    /// Configuration value invalid or inconsistent.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// A per-relation list does not have one entry per relation.
    #[error("Relation count mismatch for {what}: expected {expected}, got {actual}")]
    RelationMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    // === Data Errors ===
    /// Node index outside its id space.
    #[error("Invalid {kind} index {index} (count: {count})")]
    InvalidIndex {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    /// Structurally invalid data (empty behavior file, missing target, etc).
    #[error("Data error: {message}")]
    DataError { message: String },

    /// A line of an interaction file could not be parsed.
    #[error("Parse error in {file} at line {line}: {message}")]
    ParseError {
        file: String,
        line: usize,
        message: String,
    },

    // === Infrastructure Errors ===
    /// File I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GraphError {
    /// Shorthand for a [`GraphError::ConfigError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether this error comes from configuration rather than data.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            GraphError::ConfigError { .. } | GraphError::RelationMismatch { .. }
        )
    }
}

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
