//! Integration tests for the nested imputation experiment.
//!
//! These tests drive full train, persist, replay and score runs on synthetic
//! variant-feature datasets.

use polars::prelude::*;
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use vimpute::imputers::{ChainedImputer, IndicatorAugmenter, LowRankImputer, NeighborImputer};
use vimpute::selection::{aggregate_signals, best_configurations};
use vimpute::tree::{EXPERIMENT_DEPTH, experiment_path, flatten};
use vimpute::{
    ClassifierFamily, ConfusionMatrix, Direction, Estimate, Experiment, ExperimentConfig,
    ExperimentTree, FeatureMatrix, ForestSettings, GridRegistry, ImputationMethod, Metric,
    MethodRegistry, ParamGrid, PersistedState, TreeKey, UnitContext, WarningKind,
};

// ============================================================================
// Helper Functions
// ============================================================================

const FEATURES: [&str; 4] = ["cadd_phred", "gerp_rs", "phylop", "revel"];

/// Four noisy views of one latent pathogenicity score, with an outcome that
/// overlaps heavily between classes. `revel` is never missing.
fn synthetic(n: usize, seed: u64, missing_rate: f64) -> (DataFrame, Vec<bool>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(n); FEATURES.len()];
    let mut outcome = Vec::with_capacity(n);

    for _ in 0..n {
        let latent: f64 = rng.gen_range(-1.0..1.0);
        let noise: f64 = rng.gen_range(-1.5..1.5);
        outcome.push(latent + noise > 0.0);
        for (j, column) in columns.iter_mut().enumerate() {
            let value = latent * (j + 1) as f64 + rng.gen_range(-0.5..0.5);
            let missing = j + 1 < FEATURES.len() && rng.gen_bool(missing_rate);
            column.push((!missing).then_some(value));
        }
    }

    let columns: Vec<Column> = FEATURES
        .iter()
        .zip(columns)
        .map(|(name, values)| Column::new((*name).into(), values))
        .collect();
    (DataFrame::new(columns).unwrap(), outcome)
}

fn config(seed: u64, workers: usize, classifier: ClassifierFamily) -> ExperimentConfig {
    ExperimentConfig::builder()
        .seed(seed)
        .n_workers(workers)
        .realizations(2)
        .max_rounds(5)
        .classifier(classifier)
        .forest(ForestSettings {
            n_trees: 30,
            ..ForestSettings::default()
        })
        .build()
        .unwrap()
}

fn experiment(seed: u64, workers: usize, classifier: ClassifierFamily) -> Experiment {
    Experiment::builder()
        .config(config(seed, workers, classifier))
        .build()
        .unwrap()
}

fn unit(seed: u64) -> UnitContext {
    UnitContext {
        seed,
        realizations: 1,
        max_rounds: 5,
    }
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_same_seed_reproduces_run_across_worker_counts() {
    let (df, outcome) = synthetic(60, 1, 0.15);
    let grids = GridRegistry::new()
        .method("mice", ParamGrid::new().param("m", [2usize]).param("rounds", [2usize]))
        .method("svd", ParamGrid::new().param("rank", [1usize, 2]))
        .method("mean", ParamGrid::new());

    let a = experiment(7, 1, ClassifierFamily::RandomForest)
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();
    let b = experiment(7, 3, ClassifierFamily::RandomForest)
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();

    assert!(a.completions == b.completions);
    assert!(a.models == b.models);
    let indices = |t: &vimpute::TrainOutcome| {
        t.selections
            .iter()
            .map(|s| (s.method.clone(), s.configuration.index))
            .collect::<Vec<_>>()
    };
    assert_eq!(indices(&a), indices(&b));
    assert_eq!(a.completions.leaf_count().unwrap(), 5);
}

#[test]
fn test_different_seed_changes_stochastic_completions() {
    let (df, outcome) = synthetic(40, 2, 0.2);
    let grids = GridRegistry::new().method("mice", ParamGrid::new().param("m", [1usize]));
    let a = experiment(1, 2, ClassifierFamily::RandomForest)
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();
    let b = experiment(2, 2, ClassifierFamily::RandomForest)
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();
    assert!(a.completions != b.completions);
}

// ============================================================================
// Leakage-free Replay
// ============================================================================

#[test]
fn test_single_value_replay_ignores_new_data_distribution() {
    let (train_df, train_outcome) = synthetic(60, 3, 0.15);
    let grids = GridRegistry::new().method("median", ParamGrid::new());
    let trained = experiment(5, 2, ClassifierFamily::RandomForest)
        .train(&train_df, &train_outcome, &grids, &HashMap::new())
        .unwrap();
    let state = trained.persist();
    let Some(Estimate::FillValues { values: stored, .. }) = state.estimates.get("median") else {
        panic!("median must persist its fill values");
    };

    // Same missing pattern, very different observed values
    let low = FeatureMatrix::new(
        FEATURES.iter().map(|s| s.to_string()).collect(),
        ndarray::array![[f64::NAN, 1.0, 1.0, 1.0], [0.0, f64::NAN, 0.0, 0.0]],
    )
    .unwrap();
    let high = FeatureMatrix::new(
        low.names().to_vec(),
        ndarray::array![[f64::NAN, 900.0, 900.0, 900.0], [800.0, f64::NAN, 800.0, 800.0]],
    )
    .unwrap();

    let median = MethodRegistry::standard().resolve("median").unwrap();
    let row = &trained.selection("median").unwrap().configuration;
    let estimate = state.estimates.get("median");
    for data in [&low, &high] {
        let completion = median.impute(data, row, estimate, &unit(0)).remove(0).unwrap();
        assert_eq!(completion.data.values()[[0, 0]], stored[0]);
        assert_eq!(completion.data.values()[[1, 1]], stored[1]);
    }
}

#[test]
fn test_neighbor_replay_only_uses_training_rows() {
    let names = vec!["a".to_string(), "b".to_string()];
    let training = FeatureMatrix::new(
        names.clone(),
        ndarray::Array2::from_shape_fn((10, 2), |(i, j)| (i + 1) as f64 * (j + 1) as f64),
    )
    .unwrap();
    let row = ParamGrid::new().param("k", [1usize]).expand("knn").unwrap().remove(0);
    let fitted = NeighborImputer
        .impute(&training, &row, None, &unit(0))
        .remove(0)
        .unwrap();
    let estimate = fitted.estimate.unwrap();

    // Row 1 is an exact neighbor of row 0 in `b`; it must never donate.
    let new_data = FeatureMatrix::new(
        names,
        ndarray::array![[f64::NAN, 2000.0], [1000.0, 2000.0]],
    )
    .unwrap();
    let replayed = NeighborImputer
        .impute(&new_data, &row, Some(&estimate), &unit(0))
        .remove(0)
        .unwrap();

    let filled = replayed.data.values()[[0, 0]];
    assert!(filled != 1000.0);
    assert!((1..=10).any(|v| v as f64 == filled));
    assert_eq!(replayed.data.values()[[1, 0]], 1000.0);
}

#[test]
fn test_indicator_set_is_fixed_at_train_time() {
    let training = FeatureMatrix::new(
        vec!["x".to_string(), "y".to_string()],
        ndarray::array![[1.0, 1.0], [f64::NAN, 2.0], [3.0, 3.0]],
    )
    .unwrap();
    let row = ParamGrid::new().expand("indicator").unwrap().remove(0);
    let fitted = IndicatorAugmenter
        .impute(&training, &row, None, &unit(0))
        .remove(0)
        .unwrap();

    // `y` is now missing, but its indicator was constant in training
    let new_data = FeatureMatrix::new(
        vec!["x".to_string(), "y".to_string()],
        ndarray::array![[1.0, f64::NAN], [2.0, 2.0]],
    )
    .unwrap();
    let replayed = IndicatorAugmenter
        .impute(&new_data, &row, fitted.estimate.as_ref(), &unit(0))
        .remove(0)
        .unwrap();

    assert_eq!(replayed.data.names(), fitted.data.names());
    assert_eq!(replayed.data.names()[2], "x_missing");
    assert!(replayed.data.is_complete());
}

#[test]
fn test_persisted_state_json_round_trip() {
    let (train_df, train_outcome) = synthetic(60, 4, 0.15);
    let (test_df, _) = synthetic(20, 40, 0.15);
    let grids = GridRegistry::new()
        .method("knn", ParamGrid::new().param("k", [3usize]))
        .method("indicator", ParamGrid::new());
    let experiment = experiment(9, 2, ClassifierFamily::RandomForest);
    let state = experiment
        .train(&train_df, &train_outcome, &grids, &HashMap::new())
        .unwrap()
        .persist();

    let restored = PersistedState::from_json(&state.to_json().unwrap()).unwrap();
    assert_eq!(restored.methods().collect::<Vec<_>>(), vec!["knn", "indicator"]);

    let a = experiment.replay(&state, &test_df).unwrap();
    let b = experiment.replay(&restored, &test_df).unwrap();
    for ((path_a, pa), (path_b, pb)) in a.leaves().unwrap().into_iter().zip(b.leaves().unwrap()) {
        assert_eq!(path_a, path_b);
        assert!(pa.iter().zip(pb).all(|(x, y)| (x - y).abs() < 1e-9));
    }
}

// ============================================================================
// Selection and Failure Isolation
// ============================================================================

#[test]
fn test_identical_configurations_tie_to_lowest_index() {
    let (df, outcome) = synthetic(60, 5, 0.15);
    // `label` does not change the completion, so every configuration ties
    let grids =
        GridRegistry::new().method("mean", ParamGrid::new().param("label", ["a", "b", "c"]));
    let trained = experiment(3, 2, ClassifierFamily::Logistic)
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();

    let selection = trained.selection("mean").unwrap();
    assert_eq!(selection.configuration.index, 0);
    assert_eq!(selection.aggregates.len(), 3);
    assert!(selection.aggregates.iter().all(|a| *a == selection.aggregates[0]));
}

#[test]
fn test_exhausted_method_is_dropped_with_warning() {
    let (df, outcome) = synthetic(50, 6, 0.15);
    let grids = GridRegistry::new()
        .method("svd", ParamGrid::new().param("rank", [10usize, 20]))
        .method("zero", ParamGrid::new());
    let trained = experiment(3, 2, ClassifierFamily::RandomForest)
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();

    assert_eq!(trained.exhausted, vec!["svd".to_string()]);
    assert!(trained.selection("svd").is_none());
    assert!(trained.selection("zero").is_some());
    assert!(
        trained
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MethodExhausted && w.method == "svd")
    );
    assert_eq!(
        trained
            .warnings
            .iter()
            .filter(|w| w.kind == WarningKind::ImputationFailed)
            .count(),
        2
    );
    assert_eq!(trained.persist().methods().collect::<Vec<_>>(), vec!["zero"]);
}

#[test]
fn test_partial_failure_keeps_best_surviving_configuration() {
    let (df, outcome) = synthetic(50, 7, 0.15);
    let registry = MethodRegistry::standard().register("svd_wide", LowRankImputer);
    let grids = GridRegistry::new().method("svd_wide", ParamGrid::new().param("rank", [9usize, 1]));
    let trained = Experiment::builder()
        .config(config(3, 2, ClassifierFamily::RandomForest))
        .registry(registry)
        .build()
        .unwrap()
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();

    let selection = trained.selection("svd_wide").unwrap();
    assert_eq!(selection.configuration.index, 1);
    assert_eq!(selection.aggregates[0], f64::INFINITY);
    assert!(trained.exhausted.is_empty());
}

#[test]
fn test_direction_override_per_method() {
    let (df, outcome) = synthetic(50, 8, 0.15);
    let grids = GridRegistry::new().method("knn", ParamGrid::new().param("k", [1usize, 5]));
    let directions = HashMap::from([("knn".to_string(), Direction::Maximize)]);
    let trained = experiment(3, 2, ClassifierFamily::RandomForest)
        .train(&df, &outcome, &grids, &directions)
        .unwrap();

    let selection = trained.selection("knn").unwrap();
    let best = selection
        .aggregates
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(selection.score, best);
}

// ============================================================================
// Neighbor Scenario: k in {1, 2, 3}
// ============================================================================

#[test]
fn test_neighbor_scenario_selects_k2_and_scores_50_rows() {
    // Measured OOB errors per configuration
    let signals = ExperimentTree::from_leaves(
        EXPERIMENT_DEPTH,
        [(0, 0.40), (1, 0.35), (2, 0.38)]
            .into_iter()
            .map(|(c, e)| (experiment_path("knn", c, 0), Some(e))),
    )
    .unwrap();
    let aggregates = aggregate_signals(&signals, |_| Direction::Minimize).unwrap();
    let best = best_configurations(&aggregates, |_| Direction::Minimize).unwrap();
    assert_eq!(best.get(&[TreeKey::name("knn")]), Some(&Some((1, 0.35))));

    // Replay k = 2 with its stored reference on 50 held-out rows
    let (train_df, train_outcome) = synthetic(80, 10, 0.15);
    let (test_df, test_outcome) = synthetic(50, 11, 0.15);
    let grids = GridRegistry::new().method("knn", ParamGrid::new().param("k", [2usize]));
    let experiment = experiment(21, 2, ClassifierFamily::RandomForest);
    let trained = experiment
        .train(&train_df, &train_outcome, &grids, &HashMap::new())
        .unwrap();
    let state = trained.persist();
    let Some(Estimate::Reference { rows, .. }) = state.estimates.get("knn") else {
        panic!("knn must persist its reference rows");
    };
    assert_eq!(rows.nrows(), 80);

    let predictions = experiment.replay(&state, &test_df).unwrap();
    let probabilities = predictions.get(&experiment_path("knn", 0, 0)).unwrap();
    assert_eq!(probabilities.len(), 50);

    let confusion = ConfusionMatrix::from_probabilities(probabilities, &test_outcome, 0.5).unwrap();
    assert_eq!(confusion.total(), 50);
}

// ============================================================================
// Tree Flattening and Scoring
// ============================================================================

#[test]
fn test_two_methods_three_configurations_two_realizations_flatten_to_12_rows() {
    let (df, outcome) = synthetic(50, 12, 0.15);
    let registry = MethodRegistry::standard().register("mice_alt", ChainedImputer);
    let grid = ParamGrid::new().param("m", [2usize]).param("rounds", [1usize, 2, 3]);
    let grids = GridRegistry::new()
        .method("mice", grid.clone())
        .method("mice_alt", grid);
    let trained = Experiment::builder()
        .config(config(4, 2, ClassifierFamily::RandomForest))
        .registry(registry)
        .build()
        .unwrap()
        .train(&df, &outcome, &grids, &HashMap::new())
        .unwrap();

    let signals = trained.signals().unwrap();
    let rows = flatten(&signals, &signals.path_tree().unwrap()).unwrap();
    assert_eq!(rows.len(), 12);
    assert!(rows.iter().all(|r| r.keys.len() == 3));
    assert!(rows.iter().all(|r| r.keys[0].as_name().is_some()));
}

#[test]
fn test_score_table_has_one_row_per_replayed_leaf() {
    let (train_df, train_outcome) = synthetic(60, 13, 0.15);
    let (test_df, test_outcome) = synthetic(40, 14, 0.15);
    let grids = GridRegistry::new()
        .method("mice", ParamGrid::new().param("m", [2usize]))
        .method("mean", ParamGrid::new())
        .method("outlier", ParamGrid::new());
    let experiment = experiment(8, 2, ClassifierFamily::RandomForest);
    let trained = experiment
        .train(&train_df, &train_outcome, &grids, &HashMap::new())
        .unwrap();
    let predictions = experiment.replay(&trained.persist(), &test_df).unwrap();
    let table = experiment.score(&predictions, &test_outcome).unwrap();

    assert_eq!(table.len(), 4);
    let frame = table.to_frame().unwrap();
    assert_eq!(frame.height(), 4);
    assert_eq!(frame.width(), 3 + Metric::ALL.len());
    assert!(frame.column("auc").is_ok());

    let summary = table.summarize(&["method"]).unwrap();
    assert_eq!(summary.height(), 3);
    assert!(summary.column("mcc_sd").is_ok());
}

#[test]
fn test_single_class_outcome_is_a_hard_error() {
    let (train_df, train_outcome) = synthetic(50, 15, 0.1);
    let (test_df, _) = synthetic(10, 16, 0.1);
    let grids = GridRegistry::new().method("min", ParamGrid::new());
    let experiment = experiment(8, 1, ClassifierFamily::RandomForest);
    let trained = experiment
        .train(&train_df, &train_outcome, &grids, &HashMap::new())
        .unwrap();
    let predictions = experiment.replay(&trained.persist(), &test_df).unwrap();

    let err = experiment.score(&predictions, &[true; 10]).unwrap_err();
    assert_eq!(err.error_code(), "DEGENERATE_METRIC");
}

#[test]
fn test_replay_requires_training_features() {
    let (train_df, train_outcome) = synthetic(50, 17, 0.1);
    let grids = GridRegistry::new().method("max", ParamGrid::new());
    let experiment = experiment(8, 1, ClassifierFamily::RandomForest);
    let state = experiment
        .train(&train_df, &train_outcome, &grids, &HashMap::new())
        .unwrap()
        .persist();

    let missing_column = df!("cadd_phred" => [1.0, 2.0]).unwrap();
    assert!(experiment.replay(&state, &missing_column).is_err());
}
