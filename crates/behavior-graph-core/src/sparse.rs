//! Symmetric-normalized bipartite adjacency matrices.
//!
//! Users occupy nodes `0..n_users`, item `j` occupies node `n_users + j`.
//! Every (user, item) edge is mirrored, then both sides are scaled by the
//! inverse square root of the node degree:
//!
//! ```text
//! A_hat = D^{-1/2} (B + B^T) D^{-1/2}
//! ```
//!
//! Nodes with degree zero keep an empty row and column (the `1/sqrt(0)`
//! factor is mapped to zero, never to Inf/NaN).

use crate::error::{GraphError, GraphResult};

/// Immutable adjacency in CSR layout with `f32` weights.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseAdjacency {
    n_nodes: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<u32>,
    values: Vec<f32>,
}

/// Collects (user, item) edges and produces a normalized [`SparseAdjacency`].
#[derive(Debug, Clone)]
pub struct SparseMatrixBuilder {
    n_users: usize,
    n_items: usize,
    edges: Vec<(u32, u32)>,
}

impl SparseMatrixBuilder {
    pub fn new(n_users: usize, n_items: usize) -> Self {
        Self {
            n_users,
            n_items,
            edges: Vec::new(),
        }
    }

    /// Add one interaction. Indices are validated in [`Self::build_normalized`].
    pub fn add_edge(&mut self, user: u32, item: u32) -> &mut Self {
        self.edges.push((user, item));
        self
    }

    pub fn extend<I>(&mut self, edges: I) -> &mut Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        self.edges.extend(edges);
        self
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// Symmetrize, degree-normalize and freeze the collected edges.
    ///
    /// Duplicate (user, item) pairs collapse into one edge of weight 1.
    pub fn build_normalized(&self) -> GraphResult<SparseAdjacency> {
        let n_nodes = self.n_users + self.n_items;
        let mut pairs: Vec<(u32, u32)> = Vec::with_capacity(self.edges.len() * 2);
        for &(u, i) in &self.edges {
            if u as usize >= self.n_users {
                return Err(GraphError::InvalidIndex {
                    kind: "user",
                    index: u as usize,
                    count: self.n_users,
                });
            }
            if i as usize >= self.n_items {
                return Err(GraphError::InvalidIndex {
                    kind: "item",
                    index: i as usize,
                    count: self.n_items,
                });
            }
            let item_node = (self.n_users + i as usize) as u32;
            pairs.push((u, item_node));
            pairs.push((item_node, u));
        }
        pairs.sort_unstable();
        pairs.dedup();

        let mut degree = vec![0usize; n_nodes];
        for &(r, _) in &pairs {
            degree[r as usize] += 1;
        }
        let d_inv_sqrt: Vec<f32> = degree
            .iter()
            .map(|&d| if d == 0 { 0.0 } else { (d as f32).powf(-0.5) })
            .collect();

        let mut row_ptr = vec![0usize; n_nodes + 1];
        let mut col_idx = Vec::with_capacity(pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        for &(r, c) in &pairs {
            row_ptr[r as usize + 1] += 1;
            col_idx.push(c);
            values.push(d_inv_sqrt[r as usize] * d_inv_sqrt[c as usize]);
        }
        for i in 0..n_nodes {
            row_ptr[i + 1] += row_ptr[i];
        }

        Ok(SparseAdjacency {
            n_nodes,
            row_ptr,
            col_idx,
            values,
        })
    }
}

impl SparseAdjacency {
    /// Convenience wrapper around [`SparseMatrixBuilder`].
    pub fn normalized_bipartite<I>(n_users: usize, n_items: usize, edges: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut builder = SparseMatrixBuilder::new(n_users, n_items);
        builder.extend(edges);
        builder.build_normalized()
    }

    /// Side length of the square matrix (`n_users + n_items`).
    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Number of stored entries (twice the number of distinct edges).
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Non-zero entries of one row as `(column, value)`.
    pub fn row(&self, r: usize) -> impl Iterator<Item = (u32, f32)> + '_ {
        let (start, end) = (self.row_ptr[r], self.row_ptr[r + 1]);
        self.col_idx[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }

    /// Value at `(r, c)`, zero when absent.
    pub fn get(&self, r: usize, c: usize) -> f32 {
        let (start, end) = (self.row_ptr[r], self.row_ptr[r + 1]);
        match self.col_idx[start..end].binary_search(&(c as u32)) {
            Ok(pos) => self.values[start + pos],
            Err(_) => 0.0,
        }
    }

    pub fn row_sums(&self) -> Vec<f32> {
        (0..self.n_nodes).map(|r| self.row(r).map(|(_, v)| v).sum()).collect()
    }

    /// COO triplets `(rows, cols, values)` in row-major order.
    pub fn to_coo(&self) -> (Vec<u32>, Vec<u32>, Vec<f32>) {
        let mut rows = Vec::with_capacity(self.nnz());
        for r in 0..self.n_nodes {
            let count = self.row_ptr[r + 1] - self.row_ptr[r];
            rows.extend(std::iter::repeat(r as u32).take(count));
        }
        (rows, self.col_idx.clone(), self.values.clone())
    }

    /// Dense row-major copy. Only meant for small graphs and tests.
    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0f32; self.n_nodes * self.n_nodes];
        for r in 0..self.n_nodes {
            for (c, v) in self.row(r) {
                dense[r * self.n_nodes + c as usize] = v;
            }
        }
        dense
    }

    /// Whether `A == A^T` within `tol`.
    pub fn is_symmetric(&self, tol: f32) -> bool {
        (0..self.n_nodes).all(|r| {
            self.row(r)
                .all(|(c, v)| (self.get(c as usize, r) - v).abs() <= tol)
        })
    }

    /// Whether every stored value is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}
