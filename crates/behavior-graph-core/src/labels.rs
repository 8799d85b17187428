//! Fixed-width positive-item labels and minibatch construction.
//!
//! Every behavior's per-user item list is truncated or padded to one width,
//! chosen as a high percentile of the observed list lengths. Padding uses the
//! sentinel item index `n_items`, which maps to the all-zero padding row of
//! the item embedding tensor.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{GraphError, GraphResult};

/// Percentile used to pick the label width (outliers beyond it are truncated).
pub const LABEL_QUANTILE: f64 = 0.9999;

/// Per-user interaction lists of one behavior, keyed by user id.
pub type InteractionMap = BTreeMap<u32, Vec<u32>>;

/// Label width for a set of list lengths.
///
/// Sorts the lengths and reads position `floor(len * quantile) - 1`. A
/// position of `-1` (tiny inputs) wraps to the last, i.e. the maximum.
pub fn padded_length(lengths: &[usize], quantile: f64) -> usize {
    if lengths.is_empty() {
        return 0;
    }
    let mut sorted = lengths.to_vec();
    sorted.sort_unstable();
    let pos = (sorted.len() as f64 * quantile).floor() as usize;
    if pos == 0 {
        sorted[sorted.len() - 1]
    } else {
        sorted[pos - 1]
    }
}

/// One behavior's labels padded to a common width.
#[derive(Debug, Clone)]
pub struct BehaviorLabels {
    width: usize,
    rows: BTreeMap<u32, Vec<u32>>,
}

impl BehaviorLabels {
    /// Truncate/pad every list of `interactions` with the sentinel `n_items`.
    pub fn build(interactions: &InteractionMap, n_items: usize, quantile: f64) -> Self {
        let lengths: Vec<usize> = interactions.values().map(Vec::len).collect();
        let width = padded_length(&lengths, quantile);
        let sentinel = n_items as u32;
        let rows = interactions
            .iter()
            .map(|(&user, items)| {
                let mut row: Vec<u32> = items.iter().copied().take(width).collect();
                row.resize(width, sentinel);
                (user, row)
            })
            .collect();
        Self { width, rows }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, user: u32) -> Option<&[u32]> {
        self.rows.get(&user).map(Vec::as_slice)
    }

    pub fn users(&self) -> impl Iterator<Item = u32> + '_ {
        self.rows.keys().copied()
    }
}

/// Training users with their padded labels for every behavior.
///
/// Users are the keys of the target behavior. A user without interactions
/// under some auxiliary behavior gets an all-padding row for it.
#[derive(Debug, Clone)]
pub struct TrainingInstances {
    n_items: usize,
    users: Vec<u32>,
    widths: Vec<usize>,
    /// Row-major `[users.len() x widths[b]]` per behavior.
    labels: Vec<Vec<u32>>,
}

/// A contiguous slice of [`TrainingInstances`].
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub users: Vec<u32>,
    /// Row-major `[users.len() x widths[b]]` per behavior.
    pub labels: Vec<Vec<u32>>,
    pub widths: Vec<usize>,
    n_items: usize,
}

impl TrainingInstances {
    /// `per_behavior` is ordered like the behavior list; the last is the target.
    pub fn build(per_behavior: &[InteractionMap], n_items: usize, quantile: f64) -> GraphResult<Self> {
        let Some(target) = per_behavior.last() else {
            return Err(GraphError::DataError {
                message: "no behaviors supplied".to_string(),
            });
        };
        if target.is_empty() {
            return Err(GraphError::DataError {
                message: "target behavior has no training users".to_string(),
            });
        }
        let built: Vec<BehaviorLabels> = per_behavior
            .iter()
            .map(|m| BehaviorLabels::build(m, n_items, quantile))
            .collect();
        let users: Vec<u32> = target.keys().copied().collect();
        let widths: Vec<usize> = built.iter().map(BehaviorLabels::width).collect();
        let sentinel = n_items as u32;

        let mut labels = Vec::with_capacity(built.len());
        for (b, beh) in built.iter().enumerate() {
            let mut flat = Vec::with_capacity(users.len() * beh.width());
            let mut substituted = 0usize;
            for &u in &users {
                match beh.get(u) {
                    Some(row) => flat.extend_from_slice(row),
                    None => {
                        substituted += 1;
                        flat.extend(std::iter::repeat(sentinel).take(beh.width()));
                    }
                }
            }
            if substituted > 0 {
                tracing::debug!(
                    behavior = b,
                    users = substituted,
                    "no interactions under behavior; substituted all-padding labels"
                );
            }
            labels.push(flat);
        }

        Ok(Self {
            n_items,
            users,
            widths,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    pub fn users(&self) -> &[u32] {
        &self.users
    }

    /// Number of batches per epoch; the last partial batch counts.
    ///
    /// This is `ceil(users / batch_size)`, not `floor`: flooring would skip up
    /// to `batch_size - 1` shuffled users every epoch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.users.len().div_ceil(batch_size.max(1))
    }

    /// Apply one random permutation to users and every label matrix.
    pub fn shuffle<R>(&mut self, rng: &mut R)
    where
        R: Rng + ?Sized,
    {
        let mut order: Vec<usize> = (0..self.users.len()).collect();
        order.shuffle(rng);
        self.users = order.iter().map(|&i| self.users[i]).collect();
        for (b, flat) in self.labels.iter_mut().enumerate() {
            let w = self.widths[b];
            let mut permuted = Vec::with_capacity(flat.len());
            for &i in &order {
                permuted.extend_from_slice(&flat[i * w..(i + 1) * w]);
            }
            *flat = permuted;
        }
    }

    /// Rows `start..end` (clamped to the instance count).
    pub fn batch(&self, start: usize, end: usize) -> TrainingBatch {
        let end = end.min(self.users.len());
        let start = start.min(end);
        TrainingBatch {
            users: self.users[start..end].to_vec(),
            labels: self
                .labels
                .iter()
                .zip(&self.widths)
                .map(|(flat, &w)| flat[start * w..end * w].to_vec())
                .collect(),
            widths: self.widths.clone(),
            n_items: self.n_items,
        }
    }

    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = TrainingBatch> + '_ {
        let size = batch_size.max(1);
        (0..self.num_batches(size)).map(move |b| self.batch(b * size, (b + 1) * size))
    }
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Label row of `behavior` for batch row `row`.
    pub fn row(&self, behavior: usize, row: usize) -> &[u32] {
        let w = self.widths[behavior];
        &self.labels[behavior][row * w..(row + 1) * w]
    }

    /// Expand the target behavior's labels into aligned `(users, items)` pairs,
    /// skipping padding entries.
    pub fn target_pairs(&self) -> (Vec<u32>, Vec<u32>) {
        let target = self.labels.len() - 1;
        let sentinel = self.n_items as u32;
        let mut users = Vec::new();
        let mut items = Vec::new();
        for (row, &u) in self.users.iter().enumerate() {
            for &i in self.row(target, row) {
                if i != sentinel {
                    users.push(u);
                    items.push(i);
                }
            }
        }
        (users, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_percentile_boundary() {
        let lengths: Vec<usize> = (1..=100).collect();
        // floor(100 * 0.9999) = 99 -> sorted[98] = 99
        assert_eq!(padded_length(&lengths, LABEL_QUANTILE), 99);
    }

    #[test]
    fn test_percentile_tiny_input_wraps_to_max() {
        assert_eq!(padded_length(&[3], LABEL_QUANTILE), 3);
        // floor(2 * 0.9999) = 1 -> the smaller length
        assert_eq!(padded_length(&[5, 2], LABEL_QUANTILE), 2);
        assert_eq!(padded_length(&[], LABEL_QUANTILE), 0);
    }

    #[test]
    fn test_behavior_labels_pad_and_truncate() {
        let mut m = InteractionMap::new();
        m.insert(0, vec![1]);
        m.insert(1, vec![0, 1, 2]);
        let labels = BehaviorLabels::build(&m, 3, 0.5);
        // floor(2 * 0.5) = 1 -> sorted[0] = 1
        assert_eq!(labels.width(), 1);
        assert_eq!(labels.get(1).unwrap(), &[0]);

        let labels = BehaviorLabels::build(&m, 3, 1.0);
        assert_eq!(labels.width(), 3);
        assert_eq!(labels.get(0).unwrap(), &[1, 3, 3]);
    }

    fn instances() -> TrainingInstances {
        let mut view = InteractionMap::new();
        view.insert(0, vec![0, 1]);
        view.insert(2, vec![2]);
        let mut buy = InteractionMap::new();
        buy.insert(0, vec![1]);
        buy.insert(1, vec![0, 2]);
        buy.insert(2, vec![2]);
        TrainingInstances::build(&[view, buy], 3, 1.0).unwrap()
    }

    #[test]
    fn test_missing_auxiliary_rows_are_padding() {
        let inst = instances();
        assert_eq!(inst.users(), &[0, 1, 2]);
        let batch = inst.batch(0, 3);
        assert_eq!(batch.row(0, 1), &[3, 3]);
        assert_eq!(batch.row(1, 1), &[0, 2]);
    }

    #[test]
    fn test_target_pairs_skip_padding() {
        let inst = instances();
        let batch = inst.batch(0, 3);
        let (users, items) = batch.target_pairs();
        assert_eq!(users, vec![0, 1, 1, 2]);
        assert_eq!(items, vec![1, 0, 2, 2]);
    }

    #[test]
    fn test_shuffle_keeps_rows_aligned() {
        let mut inst = instances();
        let before: Vec<(u32, Vec<u32>)> = {
            let b = inst.batch(0, 3);
            (0..3).map(|r| (b.users[r], b.row(1, r).to_vec())).collect()
        };
        inst.shuffle(&mut ChaCha8Rng::seed_from_u64(9));
        let after = inst.batch(0, 3);
        for r in 0..3 {
            let user = after.users[r];
            let expected = &before.iter().find(|(u, _)| *u == user).unwrap().1;
            assert_eq!(after.row(1, r), expected.as_slice());
        }
    }

    #[test]
    fn test_batches_include_partial_tail() {
        let inst = instances();
        assert_eq!(inst.num_batches(2), 2);
        let sizes: Vec<usize> = inst.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_empty_target_is_error() {
        let err = TrainingInstances::build(&[InteractionMap::new()], 3, LABEL_QUANTILE).unwrap_err();
        assert!(matches!(err, GraphError::DataError { .. }));
    }
}
