use super::{
    Completion, Estimate, ImputationMethod, MethodKind, UnitContext, check_feature_names,
    wrong_estimate,
};
use crate::error::{Result, VimputeError};
use crate::grid::Configuration;
use crate::matrix::FeatureMatrix;
use ndarray::{Array2, ArrayView1};
use tracing::debug;

const DEFAULT_NEIGHBORS: usize = 5;

/// K-nearest-neighbor imputation against a reference matrix.
///
/// At train time the reference is the data being completed, excluding the row
/// being filled. At replay time it is the stored training matrix; rows of the
/// new data are never neighbors of each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborImputer;

impl NeighborImputer {
    fn neighbors(config: &Configuration) -> Result<usize> {
        let k = config.get_usize("k")?.unwrap_or(DEFAULT_NEIGHBORS);
        if k == 0 {
            return Err(VimputeError::InvalidConfig(format!(
                "{config}: k must be at least 1"
            )));
        }
        Ok(k)
    }

    /// Fill every missing cell of `target` from rows of `reference`.
    /// With `exclude_self` row `i` of the reference is skipped for target row `i`.
    pub fn fill(
        target: &Array2<f64>,
        reference: &Array2<f64>,
        k: usize,
        exclude_self: bool,
    ) -> Array2<f64> {
        let mut filled = target.clone();
        let column_means: Vec<f64> = reference
            .columns()
            .into_iter()
            .map(|col| {
                let observed: Vec<f64> = col.iter().copied().filter(|v| !v.is_nan()).collect();
                crate::utils::mean(&observed).unwrap_or(0.0)
            })
            .collect();

        for ((row_idx, col_idx), cell) in filled.indexed_iter_mut() {
            if !cell.is_nan() {
                continue;
            }
            let skip_row = exclude_self.then_some(row_idx);
            *cell = Self::impute_value(
                target.row(row_idx),
                reference,
                col_idx,
                k,
                skip_row,
                column_means[col_idx],
            );
        }

        filled
    }

    /// Impute a single missing value using KNN
    fn impute_value(
        target_row: ArrayView1<'_, f64>,
        reference: &Array2<f64>,
        target_col: usize,
        k: usize,
        skip_row: Option<usize>,
        fallback: f64,
    ) -> f64 {
        // Reference rows with an observed value in the target column
        let mut distances: Vec<(usize, f64)> = reference
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(idx, row)| Some(*idx) != skip_row && !row[target_col].is_nan())
            .map(|(idx, row)| (idx, Self::calculate_distance(target_row, row, target_col)))
            .collect();

        if distances.is_empty() {
            return fallback;
        }

        // stable sort keeps the lower row index first on equal distance
        distances.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for &(neighbor_row, distance) in distances.iter().take(k) {
            let weight = if distance < 1e-10 {
                1e10
            } else {
                1.0 / distance
            };
            weighted_sum += reference[[neighbor_row, target_col]] * weight;
            weight_sum += weight;
        }

        if weight_sum > 0.0 {
            weighted_sum / weight_sum
        } else {
            fallback
        }
    }

    /// Normalized Euclidean distance over co-observed columns, skipping the target column.
    fn calculate_distance(
        row1: ArrayView1<'_, f64>,
        row2: ArrayView1<'_, f64>,
        skip_col: usize,
    ) -> f64 {
        let mut sum_squared_diff = 0.0;
        let mut count = 0;

        for (col_idx, (&a, &b)) in row1.iter().zip(row2.iter()).enumerate() {
            if col_idx == skip_col || a.is_nan() || b.is_nan() {
                continue;
            }
            let diff = a - b;
            sum_squared_diff += diff * diff;
            count += 1;
        }

        if count > 0 {
            (sum_squared_diff / count as f64).sqrt()
        } else {
            // no common observed features
            f64::INFINITY
        }
    }
}

impl ImputationMethod for NeighborImputer {
    fn kind(&self) -> MethodKind {
        MethodKind::Neighbor
    }

    fn impute(
        &self,
        data: &FeatureMatrix,
        config: &Configuration,
        estimate: Option<&Estimate>,
        _ctx: &UnitContext,
    ) -> Vec<Result<Completion>> {
        vec![self.complete(data, config, estimate)]
    }
}

impl NeighborImputer {
    fn complete(
        &self,
        data: &FeatureMatrix,
        config: &Configuration,
        estimate: Option<&Estimate>,
    ) -> Result<Completion> {
        let k = Self::neighbors(config)?;

        let (reference, exclude_self, stored) = match estimate {
            Some(Estimate::Reference { names, rows }) => {
                check_feature_names(&config.method, names, data)?;
                (rows, false, estimate.cloned())
            }
            Some(other) => return Err(wrong_estimate(&config.method, other)),
            None => (
                data.values(),
                true,
                Some(Estimate::Reference {
                    names: data.names().to_vec(),
                    rows: data.values().clone(),
                }),
            ),
        };

        debug!(
            "KNN imputing {} rows against {} reference rows (k = {})",
            data.nrows(),
            reference.nrows(),
            k
        );
        let filled = Self::fill(data.values(), reference, k, exclude_self);

        Ok(Completion {
            data: FeatureMatrix::new(data.names().to_vec(), filled)?,
            estimate: stored,
        })
    }
}
