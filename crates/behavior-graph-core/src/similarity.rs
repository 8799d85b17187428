//! Node-node similarity and the negative-exclusion mask derived from it.
//!
//! The inter-behavior contrastive loss treats every other node as a negative.
//! Near-duplicates by interaction similarity are poor negatives, so each node's
//! top-K most similar other nodes are removed from its normalizer.

use std::collections::BTreeMap;

use crate::error::{GraphError, GraphResult};

/// Dense row-major square similarity matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    n: usize,
    values: Vec<f32>,
}

impl SimilarityMatrix {
    pub fn from_dense(n: usize, values: Vec<f32>) -> GraphResult<Self> {
        if values.len() != n * n {
            return Err(GraphError::DataError {
                message: format!("similarity matrix needs {} values, got {}", n * n, values.len()),
            });
        }
        Ok(Self { n, values })
    }

    /// Cosine similarity between binary interaction sets.
    ///
    /// `sets[r]` lists the partner ids of node `r`; duplicates are ignored.
    pub fn cosine(sets: &[Vec<u32>]) -> Self {
        let n = sets.len();
        let unique: Vec<Vec<u32>> = sets
            .iter()
            .map(|s| {
                let mut s = s.clone();
                s.sort_unstable();
                s.dedup();
                s
            })
            .collect();

        let mut inverted: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (r, set) in unique.iter().enumerate() {
            for &p in set {
                inverted.entry(p).or_default().push(r);
            }
        }

        let mut values = vec![0.0f32; n * n];
        let mut overlap = vec![0u32; n];
        for r in 0..n {
            overlap.iter_mut().for_each(|c| *c = 0);
            for p in &unique[r] {
                for &other in &inverted[p] {
                    overlap[other] += 1;
                }
            }
            let norm_r = (unique[r].len() as f32).sqrt();
            for (c, &count) in overlap.iter().enumerate() {
                if count > 0 {
                    let norm_c = (unique[c].len() as f32).sqrt();
                    values[r * n + c] = count as f32 / (norm_r * norm_c);
                }
            }
        }
        Self { n, values }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.values[r * self.n + c]
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.values[r * self.n..(r + 1) * self.n]
    }
}

/// Per node, the columns that must not act as negatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionMask {
    n_cols: usize,
    excluded: Vec<Vec<u32>>,
}

impl ExclusionMask {
    /// Mark each node's `top_k` most similar other nodes.
    ///
    /// Only strictly positive similarities qualify; ties go to the lower index.
    /// The node itself is never excluded. With `padding_column` the mask gains
    /// one extra column (the item padding sentinel) that is never excluded.
    pub fn from_similarity(sim: &SimilarityMatrix, top_k: usize, padding_column: bool) -> Self {
        let n = sim.len();
        let excluded = (0..n)
            .map(|r| {
                let mut candidates: Vec<(u32, f32)> = sim
                    .row(r)
                    .iter()
                    .enumerate()
                    .filter(|&(c, &v)| c != r && v > 0.0)
                    .map(|(c, &v)| (c as u32, v))
                    .collect();
                candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                let mut cols: Vec<u32> = candidates.into_iter().take(top_k).map(|(c, _)| c).collect();
                cols.sort_unstable();
                cols
            })
            .collect();
        Self {
            n_cols: n + usize::from(padding_column),
            excluded,
        }
    }

    /// Mask with no exclusions.
    pub fn empty(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_cols,
            excluded: vec![Vec::new(); n_rows],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.excluded.len()
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn is_excluded(&self, row: usize, col: usize) -> bool {
        self.excluded[row].binary_search(&(col as u32)).is_ok()
    }

    pub fn excluded(&self, row: usize) -> &[u32] {
        &self.excluded[row]
    }

    /// Dense `[rows.len() x n_cols]` 0/1 matrix (1 = excluded) for a batch.
    pub fn batch_dense(&self, rows: &[u32]) -> Vec<f32> {
        let mut out = vec![0.0f32; rows.len() * self.n_cols];
        for (b, &r) in rows.iter().enumerate() {
            for &c in &self.excluded[r as usize] {
                out[b * self.n_cols + c as usize] = 1.0;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> SimilarityMatrix {
        SimilarityMatrix::from_dense(
            3,
            vec![
                1.0, 0.9, 0.1, //
                0.9, 1.0, 0.4, //
                0.1, 0.4, 1.0,
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_top1_neighbour() {
        let mask = ExclusionMask::from_similarity(&three_nodes(), 1, false);
        assert_eq!(mask.excluded(0), &[1]);
        assert_eq!(mask.excluded(1), &[0]);
        assert_eq!(mask.excluded(2), &[1]);
        assert!(!mask.is_excluded(0, 0), "self is never excluded");
    }

    #[test]
    fn test_padding_column_never_excluded() {
        let mask = ExclusionMask::from_similarity(&three_nodes(), 5, true);
        assert_eq!(mask.n_cols(), 4);
        for r in 0..3 {
            assert!(!mask.is_excluded(r, 3));
            assert_eq!(mask.excluded(r).len(), 2);
        }
        let dense = mask.batch_dense(&[2]);
        assert_eq!(dense, vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_zero_similarity_not_excluded() {
        let sim = SimilarityMatrix::from_dense(2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let mask = ExclusionMask::from_similarity(&sim, 1, false);
        assert!(mask.excluded(0).is_empty());
    }

    #[test]
    fn test_cosine_of_sets() {
        let sim = SimilarityMatrix::cosine(&[vec![0, 1], vec![1], vec![2], vec![]]);
        assert!((sim.get(0, 0) - 1.0).abs() < 1e-6);
        assert!((sim.get(0, 1) - 1.0 / 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(sim.get(0, 2), 0.0);
        assert_eq!(sim.get(3, 3), 0.0);
        assert_eq!(sim.get(1, 0), sim.get(0, 1));
    }

    #[test]
    fn test_dense_size_checked() {
        assert!(SimilarityMatrix::from_dense(2, vec![1.0; 3]).is_err());
    }
}
