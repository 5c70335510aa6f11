//! Gini CART tree for a binary outcome.

use ndarray::{Array2, ArrayView1};
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Decision tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Leaf storing the positive-class fraction of its samples
    Leaf { value: f64, n_samples: usize },
    /// Internal node with split
    Split {
        feature_idx: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    /// Features examined per split
    pub mtry: usize,
    pub min_samples_leaf: usize,
    pub max_depth: Option<usize>,
}

/// Classification tree fit on a (possibly repeated) subset of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    root: TreeNode,
}

struct SplitCandidate {
    feature_idx: usize,
    threshold: f64,
    impurity: f64,
}

#[inline]
fn gini(positives: f64, count: f64) -> f64 {
    if count == 0.0 {
        return 0.0;
    }
    let p = positives / count;
    2.0 * p * (1.0 - p)
}

impl DecisionTree {
    /// Grow a tree on rows `indices` of `x` against the 0/1 outcome `y`.
    pub fn fit(
        x: &Array2<f64>,
        y: &[f64],
        indices: &[usize],
        params: &TreeParams,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let root = Self::build(x, y, indices.to_vec(), 0, params, rng);
        Self { root }
    }

    fn leaf(y: &[f64], indices: &[usize]) -> TreeNode {
        let positives: f64 = indices.iter().map(|&i| y[i]).sum();
        TreeNode::Leaf {
            value: if indices.is_empty() {
                0.0
            } else {
                positives / indices.len() as f64
            },
            n_samples: indices.len(),
        }
    }

    fn build(
        x: &Array2<f64>,
        y: &[f64],
        indices: Vec<usize>,
        depth: usize,
        params: &TreeParams,
        rng: &mut ChaCha8Rng,
    ) -> TreeNode {
        let n_samples = indices.len();
        let positives: f64 = indices.iter().map(|&i| y[i]).sum();
        let pure = positives == 0.0 || positives == n_samples as f64;

        if pure
            || n_samples < 2 * params.min_samples_leaf
            || params.max_depth.is_some_and(|d| depth >= d)
        {
            return Self::leaf(y, &indices);
        }

        let Some(best) = Self::find_best_split(x, y, &indices, params, rng) else {
            return Self::leaf(y, &indices);
        };

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| x[[i, best.feature_idx]] <= best.threshold);

        let left = Box::new(Self::build(x, y, left_indices, depth + 1, params, rng));
        let right = Box::new(Self::build(x, y, right_indices, depth + 1, params, rng));
        TreeNode::Split {
            feature_idx: best.feature_idx,
            threshold: best.threshold,
            left,
            right,
        }
    }

    fn find_best_split(
        x: &Array2<f64>,
        y: &[f64],
        indices: &[usize],
        params: &TreeParams,
        rng: &mut ChaCha8Rng,
    ) -> Option<SplitCandidate> {
        let n_features = x.ncols();
        let mtry = params.mtry.clamp(1, n_features);
        let mut features = sample(rng, n_features, mtry).into_vec();
        features.sort_unstable();

        let n = indices.len() as f64;
        let total_pos: f64 = indices.iter().map(|&i| y[i]).sum();
        let parent = gini(total_pos, n);

        let mut best: Option<SplitCandidate> = None;
        let mut order = indices.to_vec();

        for feature_idx in features {
            order.sort_by(|&a, &b| x[[a, feature_idx]].total_cmp(&x[[b, feature_idx]]));

            let mut left_pos = 0.0;
            for (pos, window) in order.windows(2).enumerate() {
                left_pos += y[window[0]];
                let left_count = pos + 1;
                let right_count = order.len() - left_count;
                let (lo, hi) = (x[[window[0], feature_idx]], x[[window[1], feature_idx]]);
                if lo == hi
                    || left_count < params.min_samples_leaf
                    || right_count < params.min_samples_leaf
                {
                    continue;
                }

                let impurity = (left_count as f64 * gini(left_pos, left_count as f64)
                    + right_count as f64 * gini(total_pos - left_pos, right_count as f64))
                    / n;
                if impurity < parent - 1e-12
                    && best.as_ref().is_none_or(|b| impurity < b.impurity)
                {
                    best = Some(SplitCandidate {
                        feature_idx,
                        threshold: (lo + hi) / 2.0,
                        impurity,
                    });
                }
            }
        }

        best
    }

    /// Positive-class fraction of the leaf `sample` falls into.
    pub fn predict_row(&self, sample: ArrayView1<'_, f64>) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf { value, .. } => return *value,
                TreeNode::Split {
                    feature_idx,
                    threshold,
                    left,
                    right,
                } => {
                    node = if sample[*feature_idx] <= *threshold {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        fn count(node: &TreeNode) -> usize {
            match node {
                TreeNode::Leaf { .. } => 1,
                TreeNode::Split { left, right, .. } => count(left) + count(right),
            }
        }
        count(&self.root)
    }
}
