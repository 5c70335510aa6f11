//! Persisted selection state and leakage-free replay on new data.
//!
//! [`PersistedState`] is the only thing that crosses the train/replay
//! boundary. Replay regenerates each selected method's completions on the new
//! dataset, substituting the stored [`Estimate`] wherever the method needs
//! one, and applies the stored models leaf by leaf.

use crate::error::{Result, ResultExt, VimputeError};
use crate::grid::Configuration;
use crate::imputers::{Estimate, MethodRegistry, UnitContext};
use crate::matrix::FeatureMatrix;
use crate::models::TrainedModel;
use crate::selection::SelectionResult;
use crate::tree::{EXPERIMENT_DEPTH, ExperimentTree, KeyPath, experiment_path};
use polars::prelude::DataFrame;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Predicted P(outcome = true) per case, keyed method -> configuration -> realization.
pub type PredictionTree = ExperimentTree<Vec<f64>>;

/// Winning hyperparameter row of one method and how to regenerate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterRecord {
    pub method: String,
    pub configuration: Configuration,
    pub realizations: usize,
    pub seed: u64,
    pub max_rounds: usize,
}

/// One persisted model, keyed like its prediction leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub method: String,
    pub configuration: usize,
    pub realization: usize,
    pub model: TrainedModel,
}

/// Everything replay needs, as a plain serializable structure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// Final feature columns, in training order
    pub features: Vec<String>,
    pub hyperparameters: Vec<HyperparameterRecord>,
    /// Per-method estimates; absent for methods that do not keep one
    pub estimates: BTreeMap<String, Estimate>,
    pub models: Vec<ModelRecord>,
}

impl PersistedState {
    /// Collect the persisted fields from a set of selections.
    pub fn from_selections(features: Vec<String>, selections: &[SelectionResult]) -> Self {
        let mut state = Self {
            features,
            ..Self::default()
        };
        for selection in selections {
            state.hyperparameters.push(HyperparameterRecord {
                method: selection.method.clone(),
                configuration: selection.configuration.clone(),
                realizations: selection.realizations,
                seed: selection.seed,
                max_rounds: selection.max_rounds,
            });
            if let Some(estimate) = &selection.estimate {
                state
                    .estimates
                    .insert(selection.method.clone(), estimate.clone());
            }
            state
                .models
                .extend(selection.models.iter().map(|(realization, model)| ModelRecord {
                    method: selection.method.clone(),
                    configuration: selection.configuration.index,
                    realization: *realization,
                    model: model.clone(),
                }));
        }
        state
    }

    /// Methods with a persisted selection, in selection order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.hyperparameters.iter().map(|h| h.method.as_str())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(VimputeError::from)
            .context("Failed to read persisted state")
    }

    fn models_for(&self, method: &str) -> impl Iterator<Item = &ModelRecord> {
        self.models.iter().filter(move |m| m.method == method)
    }
}

/// Regenerate one method's completions and predict with its stored models.
fn replay_method(
    state: &PersistedState,
    record: &HyperparameterRecord,
    data: &FeatureMatrix,
    registry: &MethodRegistry,
) -> Result<Vec<(KeyPath, Vec<f64>)>> {
    let method = registry.resolve(&record.method)?;
    let configuration = &record.configuration;
    let estimate = state.estimates.get(&record.method);
    if method.kind().requires_estimate() && estimate.is_none() {
        return Err(VimputeError::InvalidData(format!(
            "persisted state has no estimate for '{}', which cannot be replayed without one",
            record.method
        )));
    }

    let ctx = UnitContext {
        seed: record.seed,
        realizations: record.realizations,
        max_rounds: record.max_rounds,
    };
    let completions = method.impute(data, configuration, estimate, &ctx);
    if completions.len() != record.realizations {
        return Err(VimputeError::StructuralMismatch(format!(
            "'{}' regenerated {} realizations, {} were persisted",
            configuration,
            completions.len(),
            record.realizations
        )));
    }

    let mut leaves = Vec::new();
    for model in state.models_for(&record.method) {
        if model.configuration != configuration.index {
            return Err(VimputeError::StructuralMismatch(format!(
                "model for {}[{}] does not belong to the selected {}",
                model.method, model.configuration, configuration
            )));
        }
        let completion = match completions.get(model.realization) {
            Some(Ok(completion)) => completion,
            Some(Err(e)) => {
                return Err(VimputeError::convergence(
                    &record.method,
                    configuration.index,
                    format!("replay realization {}: {e}", model.realization),
                ));
            }
            None => {
                return Err(VimputeError::StructuralMismatch(format!(
                    "model for realization {} of {} has no completion",
                    model.realization, configuration
                )));
            }
        };
        let probabilities = model
            .model
            .predict_proba(&completion.data)
            .context(format!("Prediction failed for {configuration}"))?;
        leaves.push((
            experiment_path(&record.method, configuration.index, model.realization),
            probabilities.to_vec(),
        ));
    }

    debug!("Replayed {} with {} models", configuration, leaves.len());
    Ok(leaves)
}

/// Replay every persisted method on `df` and predict with the stored models.
///
/// Only the persisted features of `df` are used. The result holds exactly the
/// persisted (method, configuration, realization) set.
pub fn replay(
    state: &PersistedState,
    df: &DataFrame,
    registry: &MethodRegistry,
    pool: &ThreadPool,
) -> Result<PredictionTree> {
    let data = FeatureMatrix::from_frame_columns(df, &state.features)?;
    info!(
        "Replaying {} methods on {} rows",
        state.hyperparameters.len(),
        data.nrows()
    );

    let per_method: Vec<Result<Vec<(KeyPath, Vec<f64>)>>> = pool.install(|| {
        state
            .hyperparameters
            .par_iter()
            .map(|record| replay_method(state, record, &data, registry))
            .collect()
    });

    let mut leaves = Vec::new();
    for method in per_method {
        leaves.extend(method?);
    }
    ExperimentTree::from_leaves(EXPERIMENT_DEPTH, leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierFamily, ExperimentConfig};
    use crate::grid::ParamGrid;
    use crate::imputers::{FillStatistic, SingleValueImputer};
    use crate::models::Trainer;
    use polars::df;
    use rayon::ThreadPoolBuilder;

    fn pool() -> ThreadPool {
        ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn training() -> FeatureMatrix {
        FeatureMatrix::new(
            vec!["a".to_string(), "b".to_string()],
            ndarray::array![
                [0.0, 1.0],
                [1.0, f64::NAN],
                [2.0, 0.0],
                [3.0, 1.0],
                [4.0, 0.0],
                [5.0, 1.0],
                [f64::NAN, 0.0],
                [7.0, 1.0]
            ],
        )
        .unwrap()
    }

    fn mean_state() -> PersistedState {
        let data = training();
        let estimate = SingleValueImputer::new(FillStatistic::Mean).fit(&data);
        let configuration = ParamGrid::new().expand("mean").unwrap().remove(0);
        let completion = crate::imputers::MethodRegistry::standard()
            .resolve("mean")
            .unwrap()
            .impute(
                &data,
                &configuration,
                None,
                &UnitContext {
                    seed: 1,
                    realizations: 1,
                    max_rounds: 10,
                },
            )
            .remove(0)
            .unwrap();
        let config = ExperimentConfig::builder()
            .classifier(ClassifierFamily::Logistic)
            .build()
            .unwrap();
        let outcome = [false, true, true, false, true, false, false, true];
        let model = Trainer::new(&config)
            .fit("mean", 0, &completion.data, &outcome, 1)
            .unwrap();

        PersistedState {
            features: data.names().to_vec(),
            hyperparameters: vec![HyperparameterRecord {
                method: "mean".to_string(),
                configuration,
                realizations: 1,
                seed: 1,
                max_rounds: 10,
            }],
            estimates: BTreeMap::from([("mean".to_string(), estimate)]),
            models: vec![ModelRecord {
                method: "mean".to_string(),
                configuration: 0,
                realization: 0,
                model,
            }],
        }
    }

    #[test]
    fn test_replay_predicts_every_row() {
        let new_data = df!(
            "b" => [Some(1.0), None, Some(0.0)],
            "a" => [None, Some(2.0), Some(9.0)],
            "unused" => [1.0, 2.0, 3.0]
        )
        .unwrap();
        let predictions =
            replay(&mean_state(), &new_data, &MethodRegistry::standard(), &pool()).unwrap();

        let leaves = predictions.leaves().unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, experiment_path("mean", 0, 0));
        assert_eq!(leaves[0].1.len(), 3);
    }

    #[test]
    fn test_missing_estimate_is_rejected() {
        let mut state = mean_state();
        state.estimates.clear();
        let new_data = df!("a" => [1.0], "b" => [0.0]).unwrap();
        let err = replay(&state, &new_data, &MethodRegistry::standard(), &pool()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DATA");
    }

    #[test]
    fn test_json_round_trip_replays_identically() {
        let state = mean_state();
        let restored = PersistedState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored.features, state.features);
        assert_eq!(restored.methods().collect::<Vec<_>>(), vec!["mean"]);

        let new_data = df!("a" => [Some(1.0), None], "b" => [None, Some(1.0)]).unwrap();
        let registry = MethodRegistry::standard();
        let a = replay(&state, &new_data, &registry, &pool()).unwrap();
        let b = replay(&restored, &new_data, &registry, &pool()).unwrap();
        let path = experiment_path("mean", 0, 0);
        for (x, y) in a.get(&path).unwrap().iter().zip(b.get(&path).unwrap()) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_unknown_feature_is_reported() {
        let new_data = df!("a" => [1.0]).unwrap();
        let err =
            replay(&mean_state(), &new_data, &MethodRegistry::standard(), &pool()).unwrap_err();
        assert_eq!(err.error_code(), "COLUMN_NOT_FOUND");
    }

    #[test]
    fn test_non_numeric_extra_columns_are_ignored() {
        let new_data = df!(
            "variant_id" => ["chr1:1", "chr1:2"],
            "a" => [Some(1.0), None],
            "b" => [None, Some(1.0)]
        )
        .unwrap();
        let predictions =
            replay(&mean_state(), &new_data, &MethodRegistry::standard(), &pool()).unwrap();
        assert_eq!(predictions.get(&experiment_path("mean", 0, 0)).unwrap().len(), 2);
    }
}
