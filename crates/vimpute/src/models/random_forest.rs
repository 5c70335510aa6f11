//! Random Forest implementation

use super::decision_tree::{DecisionTree, TreeParams};
use crate::config::ForestSettings;
use crate::utils::child_seed;
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bagged classification forest with its out-of-bag error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    /// Individual trees
    trees: Vec<DecisionTree>,
    /// Features examined per split
    mtry: usize,
    /// Number of features seen at fit time
    n_features: usize,
    /// Misclassification rate of the OOB-averaged votes; NaN when no row was
    /// ever out of bag
    #[serde(with = "crate::utils::nan_as_null")]
    oob_error: f64,
}

/// Default `mtry` for `p` features: `ceil(sqrt(p))`.
pub fn default_mtry(n_features: usize) -> usize {
    ((n_features as f64).sqrt().ceil() as usize).max(1)
}

/// Tuning grid used when no candidates are configured: half, once and twice
/// [`default_mtry`], clamped to `1..=p`, ascending and distinct.
pub fn default_mtry_grid(n_features: usize) -> Vec<usize> {
    let p = n_features.max(1);
    let centre = default_mtry(p);
    let mut grid: Vec<usize> = [centre / 2, centre, centre * 2]
        .into_iter()
        .map(|m| m.clamp(1, p))
        .collect();
    grid.dedup();
    grid
}

impl RandomForest {
    /// Fit a forest with a fixed `mtry`. Tree `t` draws from `child_seed(seed, t)`.
    pub fn fit(
        x: &Array2<f64>,
        y: &Array1<f64>,
        settings: &ForestSettings,
        mtry: usize,
        seed: u64,
    ) -> Self {
        let n_samples = x.nrows();
        let n_features = x.ncols();
        let params = TreeParams {
            mtry: mtry.clamp(1, n_features.max(1)),
            min_samples_leaf: settings.min_samples_leaf.max(1),
            max_depth: settings.max_depth,
        };
        let y_slice: Vec<f64> = y.to_vec();

        // Build trees in parallel
        let fitted: Vec<(DecisionTree, Vec<bool>)> = (0..settings.n_trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(child_seed(seed, tree_idx));

                // Bootstrap sample
                let sample_indices: Vec<usize> = (0..n_samples)
                    .map(|_| rng.gen_range(0..n_samples))
                    .collect();
                let mut in_bag = vec![false; n_samples];
                for &i in &sample_indices {
                    in_bag[i] = true;
                }

                let tree = DecisionTree::fit(x, &y_slice, &sample_indices, &params, &mut rng);
                (tree, in_bag)
            })
            .collect();

        // OOB votes
        let mut vote_sum = vec![0.0; n_samples];
        let mut vote_count = vec![0usize; n_samples];
        for (tree, in_bag) in &fitted {
            for i in (0..n_samples).filter(|&i| !in_bag[i]) {
                vote_sum[i] += tree.predict_row(x.row(i));
                vote_count[i] += 1;
            }
        }

        let (mut errors, mut counted) = (0usize, 0usize);
        for i in 0..n_samples {
            if vote_count[i] == 0 {
                continue;
            }
            let predicted = vote_sum[i] / vote_count[i] as f64 >= 0.5;
            if predicted != (y[i] >= 0.5) {
                errors += 1;
            }
            counted += 1;
        }
        let oob_error = if counted == 0 {
            f64::NAN
        } else {
            errors as f64 / counted as f64
        };

        Self {
            trees: fitted.into_iter().map(|(tree, _)| tree).collect(),
            mtry: params.mtry,
            n_features,
            oob_error,
        }
    }

    /// Fit one forest per `mtry` candidate and keep the one with the lowest OOB
    /// error. Ties go to the smaller `mtry`.
    pub fn tune(x: &Array2<f64>, y: &Array1<f64>, settings: &ForestSettings, seed: u64) -> Self {
        let n_features = x.ncols().max(1);
        let mut candidates: Vec<usize> = if settings.mtry_candidates.is_empty() {
            default_mtry_grid(n_features)
        } else {
            settings
                .mtry_candidates
                .iter()
                .map(|&m| m.clamp(1, n_features))
                .collect()
        };
        candidates.sort_unstable();
        candidates.dedup();

        let mut best: Option<RandomForest> = None;
        for mtry in candidates {
            let forest = Self::fit(x, y, settings, mtry, seed);
            debug!("Forest mtry = {} OOB error = {:.4}", mtry, forest.oob_error);
            let better = match &best {
                None => true,
                Some(current) => {
                    forest.oob_error < current.oob_error
                        || (current.oob_error.is_nan() && !forest.oob_error.is_nan())
                }
            };
            if better {
                best = Some(forest);
            }
        }

        // candidates is never empty
        best.unwrap_or_else(|| Self::fit(x, y, settings, default_mtry(n_features), seed))
    }

    /// Mean positive-class fraction over all trees.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        let n_trees = self.trees.len().max(1) as f64;
        x.rows()
            .into_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect()
    }

    pub fn oob_error(&self) -> f64 {
        self.oob_error
    }

    pub fn mtry(&self) -> usize {
        self.mtry
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}
