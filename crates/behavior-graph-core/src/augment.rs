//! Stochastic perturbation of the target-behavior graph.
//!
//! Each call resamples the target relation's edge list and renormalizes it the
//! same way the static adjacencies are built. All randomness comes from the
//! RNG handed in by the caller, so a seeded stream reproduces the views.

use std::sync::Arc;

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::sparse::SparseAdjacency;

/// How augmented views are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentKind {
    /// Drop a fraction of users and items together with all their edges.
    NodeDropout,
    /// Keep a random subset of edges, one view pair per epoch.
    EdgeDropout,
    /// Edge dropout resampled independently for every propagation layer.
    RandomWalk,
}

impl AugmentKind {
    /// Whether views differ per layer.
    pub fn per_layer(self) -> bool {
        matches!(self, AugmentKind::RandomWalk)
    }
}

impl std::str::FromStr for AugmentKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node_dropout" | "nd" | "0" => Ok(AugmentKind::NodeDropout),
            "edge_dropout" | "ed" | "1" => Ok(AugmentKind::EdgeDropout),
            "random_walk" | "rw" | "2" => Ok(AugmentKind::RandomWalk),
            other => Err(GraphError::config(format!("unknown augmentation '{}'", other))),
        }
    }
}

/// Produces perturbed, normalized copies of the target relation's graph.
#[derive(Debug, Clone)]
pub struct GraphAugmentor {
    n_users: usize,
    n_items: usize,
    edges: Vec<(u32, u32)>,
}

impl GraphAugmentor {
    /// `edges` are the target behavior's training (user, item) pairs.
    pub fn new(n_users: usize, n_items: usize, mut edges: Vec<(u32, u32)>) -> Self {
        edges.sort_unstable();
        edges.dedup();
        Self {
            n_users,
            n_items,
            edges,
        }
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// One perturbed normalized adjacency over `n_users + n_items` nodes.
    pub fn augment<R>(&self, kind: AugmentKind, ratio: f64, rng: &mut R) -> GraphResult<SparseAdjacency>
    where
        R: Rng + ?Sized,
    {
        check_ratio(ratio)?;
        let kept: Vec<(u32, u32)> = match kind {
            AugmentKind::NodeDropout => {
                let n_drop_users = (self.n_users as f64 * ratio).floor() as usize;
                let n_drop_items = (self.n_items as f64 * ratio).floor() as usize;
                let mut keep_user = vec![true; self.n_users];
                let mut keep_item = vec![true; self.n_items];
                for u in index::sample(rng, self.n_users, n_drop_users) {
                    keep_user[u] = false;
                }
                for i in index::sample(rng, self.n_items, n_drop_items) {
                    keep_item[i] = false;
                }
                self.edges
                    .iter()
                    .copied()
                    .filter(|&(u, i)| keep_user[u as usize] && keep_item[i as usize])
                    .collect()
            }
            AugmentKind::EdgeDropout | AugmentKind::RandomWalk => {
                let n_keep = (self.edges.len() as f64 * (1.0 - ratio)).floor() as usize;
                let mut keep = index::sample(rng, self.edges.len(), n_keep).into_vec();
                keep.sort_unstable();
                keep.into_iter().map(|k| self.edges[k]).collect()
            }
        };
        tracing::trace!(?kind, ratio, kept = kept.len(), total = self.edges.len(), "augmented view");
        SparseAdjacency::normalized_bipartite(self.n_users, self.n_items, kept)
    }

    /// Target adjacency without any perturbation.
    pub fn unperturbed(&self) -> GraphResult<SparseAdjacency> {
        SparseAdjacency::normalized_bipartite(self.n_users, self.n_items, self.edges.iter().copied())
    }
}

fn check_ratio(ratio: f64) -> GraphResult<()> {
    if !(0.0..1.0).contains(&ratio) {
        return Err(GraphError::config(format!(
            "augmentation ratio must be in [0, 1), got {}",
            ratio
        )));
    }
    Ok(())
}

/// The two views consumed by one propagation layer.
#[derive(Debug, Clone)]
pub struct ViewPair {
    pub first: Arc<SparseAdjacency>,
    pub second: Arc<SparseAdjacency>,
}

/// Per-layer view pairs for one epoch.
///
/// Node and edge dropout share a single pair across layers; random walk
/// holds an independent pair per layer.
#[derive(Debug, Clone)]
pub struct ViewSchedule {
    pairs: Vec<ViewPair>,
}

impl ViewSchedule {
    pub fn generate<R>(
        augmentor: &GraphAugmentor,
        kind: AugmentKind,
        ratio: f64,
        n_layers: usize,
        rng: &mut R,
    ) -> GraphResult<Self>
    where
        R: Rng + ?Sized,
    {
        if n_layers == 0 {
            return Err(GraphError::config("view schedule needs at least one layer"));
        }
        let mut pairs = Vec::with_capacity(n_layers);
        if kind.per_layer() {
            for _ in 0..n_layers {
                pairs.push(ViewPair {
                    first: Arc::new(augmentor.augment(kind, ratio, rng)?),
                    second: Arc::new(augmentor.augment(kind, ratio, rng)?),
                });
            }
        } else {
            let shared = ViewPair {
                first: Arc::new(augmentor.augment(kind, ratio, rng)?),
                second: Arc::new(augmentor.augment(kind, ratio, rng)?),
            };
            pairs.resize(n_layers, shared);
        }
        Ok(Self { pairs })
    }

    /// Same adjacency for both views on every layer.
    pub fn fixed(adjacency: SparseAdjacency, n_layers: usize) -> Self {
        let shared = Arc::new(adjacency);
        let pair = ViewPair {
            first: Arc::clone(&shared),
            second: shared,
        };
        Self {
            pairs: vec![pair; n_layers],
        }
    }

    pub fn n_layers(&self) -> usize {
        self.pairs.len()
    }

    pub fn layer(&self, k: usize) -> &ViewPair {
        &self.pairs[k]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewPair> {
        self.pairs.iter()
    }
}
