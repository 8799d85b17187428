//! Ordered behavior (relation) list.
//!
//! The last behavior is the target being recommended; every other entry is an
//! auxiliary signal. The order is fixed for the whole run and is the index
//! space used by every per-relation tensor and config vector.

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

/// Ordered, validated list of behavior names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Behaviors {
    names: Vec<String>,
}

impl Behaviors {
    /// Build from names. Fails on an empty list, empty names or duplicates.
    pub fn new<I, S>(names: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(GraphError::config("at least one behavior is required"));
        }
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(GraphError::config(format!("behavior {} has an empty name", i)));
            }
            if names[..i].contains(name) {
                return Err(GraphError::config(format!("duplicate behavior name '{}'", name)));
            }
        }
        Ok(Self { names })
    }

    /// Parse a comma separated list such as `pv,cart,buy`.
    pub fn parse(list: &str) -> GraphResult<Self> {
        Self::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    /// Number of relations `R`.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false for a constructed list.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of the target behavior (`R - 1`).
    pub fn target(&self) -> usize {
        self.names.len() - 1
    }

    /// Name of the target behavior.
    pub fn target_name(&self) -> &str {
        &self.names[self.target()]
    }

    /// Indices of the auxiliary behaviors, in declaration order.
    pub fn auxiliary(&self) -> impl Iterator<Item = usize> {
        0..self.target()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fail with `RelationMismatch` unless `actual == R`.
    pub fn expect_len(&self, what: &str, actual: usize) -> GraphResult<()> {
        if actual != self.len() {
            return Err(GraphError::RelationMismatch {
                what: what.to_string(),
                expected: self.len(),
                actual,
            });
        }
        Ok(())
    }
}
