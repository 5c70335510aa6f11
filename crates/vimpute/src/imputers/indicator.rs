use super::{Completion, Estimate, ImputationMethod, MethodKind, UnitContext, wrong_estimate};
use crate::error::{Result, VimputeError};
use crate::grid::Configuration;
use crate::matrix::FeatureMatrix;
use ndarray::{Array2, Axis};
use tracing::debug;

const INDICATOR_SUFFIX: &str = "_missing";
const FILL: f64 = 0.0;

/// Missingness indicator augmentation.
///
/// Appends a `<column>_missing` 0/1 feature per column whose indicator varied
/// in training, then fills the original missing cells with a constant. The set
/// of kept indicators is fixed at train time and replayed unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorAugmenter;

impl IndicatorAugmenter {
    pub fn indicator_name(column: &str) -> String {
        format!("{column}{INDICATOR_SUFFIX}")
    }

    /// Decide which indicators to keep: those not constant on `data`.
    pub fn fit(data: &FeatureMatrix) -> Estimate {
        let n = data.nrows();
        let kept = data
            .names()
            .iter()
            .enumerate()
            .filter(|(j, _)| {
                let missing = data.missing_in_column(*j);
                missing > 0 && missing < n
            })
            .map(|(_, name)| Self::indicator_name(name))
            .collect();
        Estimate::Indicators { fill: FILL, kept }
    }

    fn apply(data: &FeatureMatrix, estimate: &Estimate) -> Result<Completion> {
        let Estimate::Indicators { fill, kept } = estimate else {
            return Err(wrong_estimate("indicator", estimate));
        };

        let sources = kept
            .iter()
            .map(|name| {
                let source = name.strip_suffix(INDICATOR_SUFFIX).ok_or_else(|| {
                    VimputeError::InvalidData(format!("'{name}' is not an indicator column"))
                })?;
                data.column_index(source)
            })
            .collect::<Result<Vec<_>>>()?;

        let n = data.nrows();
        let mut indicators = Array2::zeros((n, sources.len()));
        for (k, &j) in sources.iter().enumerate() {
            for (i, v) in data.values().column(j).iter().enumerate() {
                if v.is_nan() {
                    indicators[[i, k]] = 1.0;
                }
            }
        }

        let fill = *fill;
        let base = data.values().mapv(|v| if v.is_nan() { fill } else { v });
        let values = ndarray::concatenate(Axis(1), &[base.view(), indicators.view()])
            .map_err(|e| VimputeError::Internal(format!("indicator concatenation: {e}")))?;

        let mut names = data.names().to_vec();
        names.extend(kept.iter().cloned());

        Ok(Completion {
            data: FeatureMatrix::new(names, values)?,
            estimate: Some(estimate.clone()),
        })
    }
}

impl ImputationMethod for IndicatorAugmenter {
    fn kind(&self) -> MethodKind {
        MethodKind::Indicator
    }

    fn impute(
        &self,
        data: &FeatureMatrix,
        _config: &Configuration,
        estimate: Option<&Estimate>,
        _ctx: &UnitContext,
    ) -> Vec<Result<Completion>> {
        let completion = match estimate {
            Some(stored) => Self::apply(data, stored),
            None => {
                let fitted = Self::fit(data);
                if let Estimate::Indicators { kept, .. } = &fitted {
                    debug!("Keeping {} of {} missingness indicators", kept.len(), data.ncols());
                }
                Self::apply(data, &fitted)
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

    fn ctx() -> UnitContext {
        UnitContext {
            seed: 0,
            realizations: 1,
            max_rounds: 1,
        }
    }

    fn config() -> Configuration {
        ParamGrid::new().expand("indicator").unwrap().remove(0)
    }

    fn train() -> FeatureMatrix {
        FeatureMatrix::new(
            vec!["sift".to_string(), "gerp".to_string(), "phylop".to_string()],
            array![
                [0.1, 1.0, f64::NAN],
                [f64::NAN, 2.0, f64::NAN],
                [0.3, 3.0, f64::NAN],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_constant_indicators_are_dropped() {
        let completion = IndicatorAugmenter
            .impute(&train(), &config(), None, &ctx())
            .remove(0)
            .unwrap();

        // gerp never missing, phylop always missing: both indicators constant
        assert_eq!(
            completion.data.names(),
            &["sift", "gerp", "phylop", "sift_missing"].map(String::from)
        );
        assert!(completion.data.is_complete());
        assert_eq!(completion.data.values()[[1, 3]], 1.0);
        assert_eq!(completion.data.values()[[1, 0]], 0.0);
    }

    #[test]
    fn test_replay_keeps_train_drop_set() {
        let stored = IndicatorAugmenter::fit(&train());
        // In new data gerp is missing, but its indicator was dropped in training.
        let new_data = FeatureMatrix::new(
            vec!["sift".to_string(), "gerp".to_string(), "phylop".to_string()],
            array![[0.5, f64::NAN, 1.0], [0.6, 2.0, 1.0]],
        )
        .unwrap();
        let completion = IndicatorAugmenter
            .impute(&new_data, &config(), Some(&stored), &ctx())
            .remove(0)
            .unwrap();
        assert_eq!(completion.data.ncols(), 4);
        assert_eq!(completion.data.values()[[0, 3]], 0.0);
        assert_eq!(completion.data.values()[[0, 1]], 0.0);
        assert_eq!(completion.estimate, Some(stored));
    }
}
