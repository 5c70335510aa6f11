//! Multiple imputation by chained equations.
//!
//! Each realization starts from random draws of the observed values, then for a
//! fixed number of rounds visits every incomplete column and re-imputes it by
//! predictive mean matching: a linear regression on the other columns is fit to
//! the observed rows, a second fit on a bootstrap resample supplies the
//! predictions for the missing rows, and each missing cell takes the observed
//! value of a random donor among the closest predicted means.

use super::{Completion, Estimate, ImputationMethod, MethodKind, UnitContext, wrong_estimate};
use crate::error::{Result, VimputeError};
use crate::grid::Configuration;
use crate::matrix::FeatureMatrix;
use crate::utils::{child_seed, solve_linear_system};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

const DEFAULT_DONORS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChainedImputer;

impl ChainedImputer {
    fn settings(config: &Configuration, ctx: &UnitContext) -> Result<(usize, usize)> {
        let rounds = config
            .get_usize("rounds")?
            .unwrap_or(ctx.max_rounds)
            .min(ctx.max_rounds);
        let donors = config.get_usize("donors")?.unwrap_or(DEFAULT_DONORS);
        if rounds == 0 || donors == 0 {
            return Err(VimputeError::InvalidConfig(format!(
                "{config}: rounds and donors must be at least 1"
            )));
        }
        Ok((rounds, donors))
    }
}

impl ImputationMethod for ChainedImputer {
    fn kind(&self) -> MethodKind {
        MethodKind::Stochastic
    }

    fn realizations(&self, config: &Configuration, default_m: usize) -> Result<usize> {
        let m = config.get_usize("m")?.unwrap_or(default_m);
        if m == 0 {
            return Err(VimputeError::InvalidConfig(format!(
                "{config}: m must be at least 1"
            )));
        }
        Ok(m)
    }

    fn impute(
        &self,
        data: &FeatureMatrix,
        config: &Configuration,
        estimate: Option<&Estimate>,
        ctx: &UnitContext,
    ) -> Vec<Result<Completion>> {
        // without a realization count there is nothing to size the slots by
        let m = match self.realizations(config, ctx.realizations) {
            Ok(m) => m,
            Err(e) => return vec![Err(e)],
        };
        if let Some(stored) = estimate {
            return (0..m)
                .map(|_| Err(wrong_estimate(&config.method, stored)))
                .collect();
        }
        let (rounds, donors) = match Self::settings(config, ctx) {
            Ok(settings) => settings,
            // settings are pure, so every slot gets the same error
            Err(first) => {
                return std::iter::once(first)
                    .chain((1..m).filter_map(|_| Self::settings(config, ctx).err()))
                    .map(Err)
                    .collect();
            }
        };

        debug!(
            "Chained imputation {}: {} realizations, {} rounds, {} donors",
            config, m, rounds, donors
        );

        (0..m)
            .map(|r| -> Result<Completion> {
                let mut rng = ChaCha8Rng::seed_from_u64(child_seed(ctx.seed, r));
                let filled = realize(data.values(), rounds, donors, &mut rng).map_err(|reason| {
                    VimputeError::convergence(
                        &config.method,
                        config.index,
                        format!("realization {r}: {reason}"),
                    )
                })?;
                Ok(Completion {
                    data: FeatureMatrix::new(data.names().to_vec(), filled)?,
                    estimate: None,
                })
            })
            .collect()
    }
}

fn realize(
    values: &Array2<f64>,
    rounds: usize,
    donors: usize,
    rng: &mut ChaCha8Rng,
) -> std::result::Result<Array2<f64>, String> {
    let (n, p) = values.dim();
    let mask = values.mapv(f64::is_nan);
    let mut filled = values.clone();

    let incomplete: Vec<usize> = (0..p)
        .filter(|&j| mask.column(j).iter().any(|&m| m))
        .collect();
    if incomplete.is_empty() {
        return Ok(filled);
    }

    // starting values: random draws from each column's observed values
    for &j in &incomplete {
        let observed: Vec<f64> = values.column(j).iter().copied().filter(|v| !v.is_nan()).collect();
        if observed.is_empty() {
            return Err(format!("column {j} has no observed values"));
        }
        for i in 0..n {
            if mask[[i, j]] {
                filled[[i, j]] = observed[rng.gen_range(0..observed.len())];
            }
        }
    }

    for _ in 0..rounds {
        for &j in &incomplete {
            let (obs_rows, mis_rows): (Vec<usize>, Vec<usize>) =
                (0..n).partition(|&i| !mask[[i, j]]);

            let beta_hat = fit_column(&filled, j, &obs_rows)?;
            let boot: Vec<usize> = (0..obs_rows.len())
                .map(|_| obs_rows[rng.gen_range(0..obs_rows.len())])
                .collect();
            let beta_dot = fit_column(&filled, j, &boot)?;

            let predicted_obs: Vec<f64> = obs_rows
                .iter()
                .map(|&i| predict(&filled, i, j, &beta_hat))
                .collect();

            for &i in &mis_rows {
                let target = predict(&filled, i, j, &beta_dot);
                let mut order: Vec<usize> = (0..obs_rows.len()).collect();
                order.sort_by(|&a, &b| {
                    (predicted_obs[a] - target)
                        .abs()
                        .total_cmp(&(predicted_obs[b] - target).abs())
                });
                let pool = donors.min(order.len());
                let donor = order[rng.gen_range(0..pool)];
                filled[[i, j]] = values[[obs_rows[donor], j]];
            }
        }
    }

    if filled.iter().any(|v| !v.is_finite()) {
        return Err("non-finite value after final round".to_string());
    }
    Ok(filled)
}

/// Feature index behind design column `c` (column 0 is the intercept).
#[inline]
fn feature_of(c: usize, j: usize) -> usize {
    if c - 1 < j { c - 1 } else { c }
}

fn fit_column(
    filled: &Array2<f64>,
    j: usize,
    rows: &[usize],
) -> std::result::Result<Array1<f64>, String> {
    let width = filled.ncols();
    let x = Array2::from_shape_fn((rows.len(), width), |(r, c)| {
        if c == 0 { 1.0 } else { filled[[rows[r], feature_of(c, j)]] }
    });
    let y: Array1<f64> = rows.iter().map(|&i| filled[[i, j]]).collect();

    let mut xtx = x.t().dot(&x);
    let xty = x.t().dot(&y);
    let scale = (1..width).map(|c| xtx[[c, c]]).fold(1.0f64, f64::max);
    for c in 1..width {
        xtx[[c, c]] += 1e-6 * scale;
    }

    solve_linear_system(xtx, xty).ok_or_else(|| format!("singular regression for column {j}"))
}

fn predict(filled: &Array2<f64>, i: usize, j: usize, beta: &Array1<f64>) -> f64 {
    beta[0]
        + (1..beta.len())
            .map(|c| beta[c] * filled[[i, feature_of(c, j)]])
            .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ParamGrid;
    use ndarray::array;

    fn data() -> FeatureMatrix {
        FeatureMatrix::new(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            array![
                [1.0, 2.1, f64::NAN],
                [2.0, f64::NAN, 0.5],
                [3.0, 6.2, 0.9],
                [f64::NAN, 8.1, 1.1],
                [5.0, 9.8, f64::NAN],
                [6.0, 12.3, 1.9],
                [7.0, f64::NAN, 2.2],
                [8.0, 16.1, 2.4],
            ],
        )
        .unwrap()
    }

    fn config(m: usize) -> Configuration {
        ParamGrid::new()
            .param("m", [m])
            .param("donors", [3usize])
            .expand("mice")
            .unwrap()
            .remove(0)
    }

    fn ctx(seed: u64) -> UnitContext {
        UnitContext {
            seed,
            realizations: 5,
            max_rounds: 5,
        }
    }

    #[test]
    fn test_one_slot_per_realization() {
        let out = ChainedImputer.impute(&data(), &config(3), None, &ctx(11));
        assert_eq!(out.len(), 3);
        for slot in out {
            let completion = slot.unwrap();
            assert!(completion.data.is_complete());
            assert!(completion.estimate.is_none());
        }
    }

    #[test]
    fn test_same_seed_reproduces_completions() {
        let a = ChainedImputer.impute(&data(), &config(2), None, &ctx(42));
        let b = ChainedImputer.impute(&data(), &config(2), None, &ctx(42));
        for (x, y) in a.into_iter().zip(b) {
            assert_eq!(x.unwrap().data, y.unwrap().data);
        }
    }

    #[test]
    fn test_imputed_values_are_observed_donor_values() {
        let original = data();
        let out = ChainedImputer.impute(&original, &config(2), None, &ctx(3));
        for slot in out {
            let completion = slot.unwrap();
            for j in 0..original.ncols() {
                let observed = original.observed(j);
                for i in 0..original.nrows() {
                    if original.values()[[i, j]].is_nan() {
                        let v = completion.data.values()[[i, j]];
                        assert!(
                            observed.contains(&v),
                            "{v} is not an observed value of column {j}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_all_missing_column_fails_every_realization() {
        let matrix = FeatureMatrix::new(
            vec!["a".to_string(), "b".to_string()],
            array![[1.0, f64::NAN], [2.0, f64::NAN]],
        )
        .unwrap();
        let out = ChainedImputer.impute(&matrix, &config(2), None, &ctx(1));
        assert_eq!(out.len(), 2);
        for slot in out {
            let err = slot.unwrap_err();
            assert!(err.is_recoverable());
        }
    }

    #[test]
    fn test_invalid_settings_fail_every_realization() {
        let invalid = ParamGrid::new()
            .param("m", [4usize])
            .param("donors", [0usize])
            .expand("mice")
            .unwrap()
            .remove(0);
        let expected = ChainedImputer.realizations(&invalid, 5).unwrap();
        let out = ChainedImputer.impute(&data(), &invalid, None, &ctx(1));
        assert_eq!(out.len(), expected);
        assert!(out.iter().all(|slot| {
            slot.as_ref()
                .is_err_and(|e| e.error_code() == "INVALID_CONFIG")
        }));

        let stored = Estimate::Indicators {
            fill: 0.0,
            kept: Vec::new(),
        };
        let out = ChainedImputer.impute(&data(), &config(3), Some(&stored), &ctx(1));
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(Result::is_err));
    }

    #[test]
    fn test_complete_data_passes_through() {
        let matrix = FeatureMatrix::new(vec!["a".to_string()], array![[1.0], [2.0]]).unwrap();
        let out = ChainedImputer.impute(&matrix, &config(1), None, &ctx(1));
        assert_eq!(out.into_iter().next().unwrap().unwrap().data, matrix);
    }
}
