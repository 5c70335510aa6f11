//! Iterative low-rank matrix completion.
//!
//! Missing cells start at their column means. Each pass recentres the current
//! fill, projects it onto its leading `rank` right singular vectors (found by
//! warm-started subspace iteration) and overwrites only the missing cells with
//! the projection. Passes stop once the relative change in the missing cells
//! drops below tolerance or the pass cap is reached.

use super::{Completion, Estimate, ImputationMethod, MethodKind, UnitContext, wrong_estimate};
use crate::error::{Result, VimputeError};
use crate::grid::Configuration;
use crate::matrix::FeatureMatrix;
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

const INNER_STEPS: usize = 10;
const TOLERANCE: f64 = 1e-9;
const COLLAPSE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, Default)]
pub struct LowRankImputer;

impl ImputationMethod for LowRankImputer {
    fn kind(&self) -> MethodKind {
        MethodKind::MatrixCompletion
    }

    fn impute(
        &self,
        data: &FeatureMatrix,
        config: &Configuration,
        estimate: Option<&Estimate>,
        ctx: &UnitContext,
    ) -> Vec<Result<Completion>> {
        vec![self.complete(data, config, estimate, ctx)]
    }
}

impl LowRankImputer {
    fn complete(
        &self,
        data: &FeatureMatrix,
        config: &Configuration,
        estimate: Option<&Estimate>,
        ctx: &UnitContext,
    ) -> Result<Completion> {
        if let Some(stored) = estimate {
            return Err(wrong_estimate(&config.method, stored));
        }
        let rank = config.get_usize("rank")?.ok_or_else(|| {
            VimputeError::InvalidConfig(format!("{config}: parameter 'rank' is required"))
        })?;
        let max_passes = ctx.max_rounds.saturating_mul(10);

        let mut rng = ChaCha8Rng::seed_from_u64(ctx.seed);
        let filled = complete_low_rank(data.values(), rank, max_passes, &mut rng)
            .map_err(|reason| VimputeError::convergence(&config.method, config.index, reason))?;

        Ok(Completion {
            data: FeatureMatrix::new(data.names().to_vec(), filled)?,
            estimate: None,
        })
    }
}

fn complete_low_rank(
    values: &Array2<f64>,
    rank: usize,
    max_passes: usize,
    rng: &mut ChaCha8Rng,
) -> std::result::Result<Array2<f64>, String> {
    let (n, p) = values.dim();
    if rank == 0 || rank > n.min(p) {
        return Err(format!(
            "rank {rank} outside 1..={} for a {n}x{p} matrix",
            n.min(p)
        ));
    }

    let mask = values.mapv(f64::is_nan);
    let n_missing = mask.iter().filter(|&&m| m).count();
    if n_missing == 0 {
        return Ok(values.clone());
    }

    let mut filled = values.clone();
    for (j, mut column) in filled.axis_iter_mut(Axis(1)).enumerate() {
        let observed: Vec<f64> = values.column(j).iter().copied().filter(|v| !v.is_nan()).collect();
        let Some(mean) = crate::utils::mean(&observed) else {
            return Err(format!("column {j} has no observed values"));
        };
        column.mapv_inplace(|v| if v.is_nan() { mean } else { v });
    }

    let mut basis = Array2::from_shape_fn((p, rank), |_| rng.gen_range(-1.0f64..1.0));
    orthonormalize(&mut basis, 1.0)?;

    for pass in 0..max_passes {
        let means = filled.mean_axis(Axis(0)).ok_or("empty matrix")?;
        let centered = &filled - &means;
        let scale = centered.iter().map(|v| v * v).sum::<f64>().sqrt();

        for _ in 0..INNER_STEPS {
            let mut left = centered.dot(&basis);
            orthonormalize(&mut left, scale)?;
            basis = centered.t().dot(&left);
            orthonormalize(&mut basis, scale)?;
        }

        let approx = centered.dot(&basis).dot(&basis.t()) + &means;

        let mut change = 0.0f64;
        let mut magnitude = 0.0f64;
        for ((idx, cell), &missing) in filled.indexed_iter_mut().zip(mask.iter()) {
            if missing {
                let next = approx[idx];
                change += (next - *cell).powi(2);
                magnitude += next * next;
                *cell = next;
            }
        }

        if !change.is_finite() {
            return Err(format!("non-finite update in pass {pass}"));
        }
        if change <= TOLERANCE * magnitude.max(1.0) {
            debug!("Low-rank completion converged after {} passes", pass + 1);
            break;
        }
    }

    Ok(filled)
}

/// Modified Gram-Schmidt on the columns of `m`. A column whose residual norm
/// collapses relative to `scale` means the data has lower rank than requested.
fn orthonormalize(m: &mut Array2<f64>, scale: f64) -> std::result::Result<(), String> {
    let k = m.ncols();
    for c in 0..k {
        for prev in 0..c {
            let projection = m.column(c).dot(&m.column(prev));
            let prev_col: Array1<f64> = m.column(prev).to_owned();
            m.column_mut(c).scaled_add(-projection, &prev_col);
        }
        let norm = m.column(c).dot(&m.column(c)).sqrt();
        if !(norm > COLLAPSE * scale) {
            return Err(format!(
                "data is rank-deficient: component {} of {k} vanished",
                c + 1
            ));
        }
        m.column_mut(c).mapv_inplace(|v| v / norm);
    }
    Ok(())
}
