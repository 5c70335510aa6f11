//! Single-value imputation methods.
//!
//! Provides min, max, mean, median, zero and outlier-constant fills. One
//! constant per feature is computed from the training data and stored as an
//! [`Estimate::FillValues`]; replay applies the stored constants verbatim.

use super::{
    Completion, Estimate, ImputationMethod, MethodKind, UnitContext, check_feature_names,
    wrong_estimate,
};
use crate::error::Result;
use crate::grid::Configuration;
use crate::matrix::FeatureMatrix;
use crate::utils::{mean, median, min_max};
use tracing::debug;

/// Statistic used to derive a feature's fill constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillStatistic {
    Min,
    Max,
    Mean,
    Median,
    Zero,
    /// `min - (max - min) - 1`, strictly below the observed range
    Outlier,
}

impl FillStatistic {
    pub const ALL: [FillStatistic; 6] = [
        Self::Min,
        Self::Max,
        Self::Mean,
        Self::Median,
        Self::Zero,
        Self::Outlier,
    ];

    /// Registry name of the method using this statistic.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Zero => "zero",
            Self::Outlier => "outlier",
        }
    }

    /// Fill constant for one column's observed values. An all-missing column
    /// yields 0.
    pub fn compute(&self, observed: &[f64]) -> f64 {
        let value = match self {
            Self::Min => min_max(observed).map(|(lo, _)| lo),
            Self::Max => min_max(observed).map(|(_, hi)| hi),
            Self::Mean => mean(observed),
            Self::Median => median(observed),
            Self::Zero => Some(0.0),
            Self::Outlier => min_max(observed).map(|(lo, hi)| lo - (hi - lo) - 1.0),
        };
        value.unwrap_or(0.0)
    }
}

/// Imputation by one stored constant per feature.
#[derive(Debug, Clone, Copy)]
pub struct SingleValueImputer {
    statistic: FillStatistic,
}

impl SingleValueImputer {
    pub fn new(statistic: FillStatistic) -> Self {
        Self { statistic }
    }

    /// Compute the fill constants from training data.
    pub fn fit(&self, data: &FeatureMatrix) -> Estimate {
        let values = (0..data.ncols())
            .map(|j| self.statistic.compute(&data.observed(j)))
            .collect();
        Estimate::FillValues {
            names: data.names().to_vec(),
            values,
        }
    }

    fn apply(&self, data: &FeatureMatrix, estimate: &Estimate) -> Result<Completion> {
        let method = self.statistic.name();
        let Estimate::FillValues { names, values } = estimate else {
            return Err(wrong_estimate(method, estimate));
        };
        check_feature_names(method, names, data)?;

        let (names, mut matrix) = data.clone().into_parts();
        for (mut column, &fill) in matrix.columns_mut().into_iter().zip(values) {
            column.mapv_inplace(|v| if v.is_nan() { fill } else { v });
        }

        Ok(Completion {
            data: FeatureMatrix::new(names, matrix)?,
            estimate: Some(estimate.clone()),
        })
    }
}

impl ImputationMethod for SingleValueImputer {
    fn kind(&self) -> MethodKind {
        MethodKind::SingleValue
    }

    fn impute(
        &self,
        data: &FeatureMatrix,
        _config: &Configuration,
        estimate: Option<&Estimate>,
        _ctx: &UnitContext,
    ) -> Vec<Result<Completion>> {
        let completion = match estimate {
            Some(stored) => self.apply(data, stored),
            None => {
                let fitted = self.fit(data);
                debug!(
                    "Computed {} fill constants for {} features",
                    self.statistic.name(),
                    data.ncols()
                );
                self.apply(data, &fitted)
            }
        };
        vec![completion]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ParamGrid;
    use ndarray::array;

    fn matrix() -> FeatureMatrix {
        FeatureMatrix::new(
            vec!["a".to_string(), "b".to_string()],
            array![[1.0, f64::NAN], [f64::NAN, f64::NAN], [5.0, f64::NAN], [3.0, f64::NAN]],
        )
        .unwrap()
    }

    fn ctx() -> UnitContext {
        UnitContext {
            seed: 1,
            realizations: 1,
            max_rounds: 10,
        }
    }

    fn config(method: &str) -> Configuration {
        ParamGrid::new().expand(method).unwrap().remove(0)
    }

    #[test]
    fn test_statistics() {
        let observed = [1.0, 5.0, 3.0];
        assert_eq!(FillStatistic::Min.compute(&observed), 1.0);
        assert_eq!(FillStatistic::Max.compute(&observed), 5.0);
        assert_eq!(FillStatistic::Mean.compute(&observed), 3.0);
        assert_eq!(FillStatistic::Median.compute(&observed), 3.0);
        assert_eq!(FillStatistic::Zero.compute(&observed), 0.0);
        assert_eq!(FillStatistic::Outlier.compute(&observed), -4.0);
    }

    #[test]
    fn test_all_missing_column_stores_zero() {
        let imputer = SingleValueImputer::new(FillStatistic::Mean);
        let Estimate::FillValues { values, .. } = imputer.fit(&matrix()) else {
            panic!("expected fill values");
        };
        assert_eq!(values, vec![3.0, 0.0]);
    }

    #[test]
    fn test_train_fill_is_missing_free() {
        let imputer = SingleValueImputer::new(FillStatistic::Median);
        let out = imputer.impute(&matrix(), &config("median"), None, &ctx());
        assert_eq!(out.len(), 1);
        let completion = out.into_iter().next().unwrap().unwrap();
        assert!(completion.data.is_complete());
        assert_eq!(completion.data.values()[[1, 0]], 3.0);
        assert!(completion.estimate.is_some());
    }

    #[test]
    fn test_replay_uses_stored_constants() {
        let imputer = SingleValueImputer::new(FillStatistic::Max);
        let stored = imputer.fit(&matrix());

        let new_data = FeatureMatrix::new(
            vec!["a".to_string(), "b".to_string()],
            array![[1000.0, f64::NAN], [f64::NAN, 2000.0]],
        )
        .unwrap();
        let completion = imputer
            .impute(&new_data, &config("max"), Some(&stored), &ctx())
            .remove(0)
            .unwrap();
        assert_eq!(completion.data.values()[[1, 0]], 5.0);
        assert_eq!(completion.data.values()[[0, 1]], 0.0);
        assert_eq!(completion.estimate, Some(stored));
    }

    #[test]
    fn test_replay_rejects_foreign_features() {
        let imputer = SingleValueImputer::new(FillStatistic::Zero);
        let stored = imputer.fit(&matrix());
        let other = FeatureMatrix::new(vec!["z".to_string()], array![[1.0]]).unwrap();
        let err = imputer
            .impute(&other, &config("zero"), Some(&stored), &ctx())
            .remove(0)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DATA");
    }
}
