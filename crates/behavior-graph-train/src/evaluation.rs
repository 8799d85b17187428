//! Ranking evaluation of the target behavior: P@K, R@K, NDCG@K, HR@K, AUC.
//!
//! Scores are `s(u, i) = u_tgt · (i_tgt ⊙ r_tgt)`. Items the user already
//! interacted with under the target behavior during training are not ranked.
//! Users are scored in batches on the device; the per-user metrics run in a
//! bounded rayon pool.

use std::collections::HashSet;

use behavior_graph_core::{InteractionMap, TrainingConfig};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::encoder::MainOutput;
use crate::error::{map_candle, TrainError, TrainResult};
use crate::sparse_ops::{index_tensor, relation_slice};

/// Metrics averaged over test users. Vectors are aligned with `ks`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub ks: Vec<usize>,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub ndcg: Vec<f64>,
    pub hit_ratio: Vec<f64>,
    pub auc: f64,
    /// Number of users evaluated.
    pub users: usize,
}

impl RankingMetrics {
    fn zeros(ks: &[usize]) -> Self {
        Self {
            ks: ks.to_vec(),
            precision: vec![0.0; ks.len()],
            recall: vec![0.0; ks.len()],
            ndcg: vec![0.0; ks.len()],
            hit_ratio: vec![0.0; ks.len()],
            auc: 0.0,
            users: 0,
        }
    }

    fn accumulate(&mut self, other: &RankingMetrics) {
        for j in 0..self.ks.len() {
            self.precision[j] += other.precision[j];
            self.recall[j] += other.recall[j];
            self.ndcg[j] += other.ndcg[j];
            self.hit_ratio[j] += other.hit_ratio[j];
        }
        self.auc += other.auc;
        self.users += other.users;
    }

    fn averaged(mut self) -> Self {
        let n = self.users.max(1) as f64;
        for j in 0..self.ks.len() {
            self.precision[j] /= n;
            self.recall[j] /= n;
            self.ndcg[j] /= n;
            self.hit_ratio[j] /= n;
        }
        self.auc /= n;
        self
    }

    /// Recall at the first cutoff.
    pub fn primary_recall(&self) -> f64 {
        self.recall.first().copied().unwrap_or(0.0)
    }
}

/// Metrics of one user from their full score row.
///
/// `train_items` are excluded from the ranking. Returns `users == 1` even
/// when `test_items` is empty (all metrics zero).
pub fn evaluate_user(scores: &[f32], train_items: &[u32], test_items: &[u32], ks: &[usize]) -> RankingMetrics {
    let mut metrics = RankingMetrics::zeros(ks);
    metrics.users = 1;
    let excluded: HashSet<u32> = train_items.iter().copied().collect();
    let relevant: HashSet<u32> = test_items.iter().copied().collect();
    if relevant.is_empty() {
        return metrics;
    }

    let mut candidates: Vec<u32> = (0..scores.len() as u32)
        .filter(|i| !excluded.contains(i))
        .collect();
    candidates.sort_by(|&a, &b| {
        scores[b as usize]
            .partial_cmp(&scores[a as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    for (j, &k) in ks.iter().enumerate() {
        let mut hits = 0usize;
        let mut dcg = 0.0;
        for (rank, item) in candidates.iter().take(k).enumerate() {
            if relevant.contains(item) {
                hits += 1;
                dcg += 1.0 / ((rank + 2) as f64).log2();
            }
        }
        let ideal: f64 = (0..relevant.len().min(k))
            .map(|rank| 1.0 / ((rank + 2) as f64).log2())
            .sum();
        metrics.precision[j] = hits as f64 / k as f64;
        metrics.recall[j] = hits as f64 / relevant.len() as f64;
        metrics.ndcg[j] = if ideal > 0.0 { dcg / ideal } else { 0.0 };
        metrics.hit_ratio[j] = if hits > 0 { 1.0 } else { 0.0 };
    }
    metrics.auc = auc(&candidates, scores, &relevant);
    metrics
}

/// Pairwise AUC over the ranked candidates; ties count one half.
fn auc(candidates: &[u32], scores: &[f32], relevant: &HashSet<u32>) -> f64 {
    let positives: Vec<f32> = candidates
        .iter()
        .filter(|i| relevant.contains(*i))
        .map(|&i| scores[i as usize])
        .collect();
    let negatives: Vec<f32> = candidates
        .iter()
        .filter(|i| !relevant.contains(*i))
        .map(|&i| scores[i as usize])
        .collect();
    if positives.is_empty() || negatives.is_empty() {
        return 0.0;
    }
    let mut wins = 0.0;
    for &p in &positives {
        for &n in &negatives {
            if p > n {
                wins += 1.0;
            } else if p == n {
                wins += 0.5;
            }
        }
    }
    wins / (positives.len() * negatives.len()) as f64
}

/// Scores test users against every item and averages their metrics.
pub struct Evaluator {
    ks: Vec<usize>,
    batch_size: usize,
    target: usize,
    pool: rayon::ThreadPool,
}

impl Evaluator {
    pub fn new(config: &TrainingConfig, target: usize) -> TrainResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.eval_threads)
            .thread_name(|i| format!("eval-{}", i))
            .build()
            .map_err(|e| TrainError::config(format!("evaluation pool: {}", e)))?;
        Ok(Self {
            ks: config.ks.clone(),
            batch_size: config.eval_batch_size.max(1),
            target,
            pool,
        })
    }

    pub fn ks(&self) -> &[usize] {
        &self.ks
    }

    /// `train` holds the target behavior's training items per user.
    pub fn evaluate(
        &self,
        embeddings: &MainOutput,
        train: &InteractionMap,
        test: &InteractionMap,
    ) -> TrainResult<RankingMetrics> {
        let device = embeddings.user.device();
        let users = relation_slice(&embeddings.user, self.target)?;
        let items = relation_slice(&embeddings.item, self.target)?;
        let n_items = items.dim(0).map_err(map_candle)? - 1;
        let relation = embeddings
            .relations
            .narrow(0, self.target, 1)
            .map_err(map_candle)?;
        let keyed = items
            .narrow(0, 0, n_items)
            .map_err(map_candle)?
            .broadcast_mul(&relation)
            .map_err(map_candle)?
            .t()
            .map_err(map_candle)?
            .contiguous()
            .map_err(map_candle)?;

        let test_users: Vec<u32> = test.keys().copied().collect();
        let mut total = RankingMetrics::zeros(&self.ks);
        for chunk in test_users.chunks(self.batch_size) {
            let idx = index_tensor(chunk, device)?;
            let scores: Vec<Vec<f32>> = users
                .index_select(&idx, 0)
                .map_err(map_candle)?
                .matmul(&keyed)
                .map_err(map_candle)?
                .to_vec2::<f32>()
                .map_err(map_candle)?;
            let batch: Vec<RankingMetrics> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .zip(scores.par_iter())
                    .map(|(user, row)| {
                        let seen = train.get(user).map(Vec::as_slice).unwrap_or(&[]);
                        let truth = test.get(user).map(Vec::as_slice).unwrap_or(&[]);
                        evaluate_user(row, seen, truth, &self.ks)
                    })
                    .collect()
            });
            for m in &batch {
                total.accumulate(m);
            }
        }
        let metrics = total.averaged();
        info!(
            users = metrics.users,
            recall = ?metrics.recall,
            ndcg = ?metrics.ndcg,
            auc = metrics.auc,
            "Evaluation complete"
        );
        Ok(metrics)
    }
}
