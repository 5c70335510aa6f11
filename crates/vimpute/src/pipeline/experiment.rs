//! Experiment orchestration.
//!
//! This module provides the [`Experiment`] struct and builder that run the
//! train phase (imputation, training, selection) on a dedicated worker pool,
//! and replay and score persisted selections on new data.

use crate::config::ExperimentConfig;
use crate::error::{Result, VimputeError};
use crate::grid::{Configuration, GridRegistry};
use crate::imputers::{Completion, ImputationMethod, MethodRegistry, UnitContext};
use crate::matrix::FeatureMatrix;
use crate::models::{TrainedModel, Trainer};
use crate::pipeline::progress::{
    ClosureProgressReporter, ExperimentStage, ProgressReporter, ProgressUpdate,
};
use crate::replay::{self, PersistedState, PredictionTree};
use crate::scoring::{self, PerformanceTable};
use crate::selection::{
    self, CompletionTree, Direction, ModelTree, SelectionContext, SelectionResult,
};
use crate::tree::{
    EXPERIMENT_DEPTH, ExperimentTree, KeyPath, TreeKey, display_path, experiment_path,
};
use crate::utils::derive_seed;
use polars::prelude::DataFrame;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Kind of a surfaced, non-fatal problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// An imputation realization failed and its leaf was nulled
    ImputationFailed,
    /// A classifier fit failed and its leaf was nulled
    TrainingFailed,
    /// Every configuration of a method failed; the method was dropped
    MethodExhausted,
}

/// A non-fatal problem recorded during training.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentWarning {
    pub kind: WarningKind,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realization: Option<usize>,
    /// Stable code of the underlying error
    pub code: &'static str,
    pub message: String,
}

impl ExperimentWarning {
    fn leaf(kind: WarningKind, path: &[TreeKey], error: &VimputeError) -> Self {
        Self {
            kind,
            method: path.first().map(ToString::to_string).unwrap_or_default(),
            configuration: path.get(1).and_then(TreeKey::as_index),
            realization: path.get(2).and_then(TreeKey::as_index),
            code: error.error_code(),
            message: error.to_string(),
        }
    }

    fn exhausted(method: &str) -> Self {
        let error = VimputeError::MethodExhausted(method.to_string());
        Self {
            kind: WarningKind::MethodExhausted,
            method: method.to_string(),
            configuration: None,
            realization: None,
            code: error.error_code(),
            message: error.to_string(),
        }
    }
}

/// Everything produced by a train run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Final feature columns, in training order
    pub features: Vec<String>,
    /// Expanded configurations per method, in grid order
    pub configurations: Vec<(String, Vec<Configuration>)>,
    pub completions: CompletionTree,
    pub models: ModelTree,
    /// Winners of the surviving methods, in grid order
    pub selections: Vec<SelectionResult>,
    /// Methods dropped because every configuration failed
    pub exhausted: Vec<String>,
    pub warnings: Vec<ExperimentWarning>,
}

impl TrainOutcome {
    /// Serializable state for replay.
    pub fn persist(&self) -> PersistedState {
        PersistedState::from_selections(self.features.clone(), &self.selections)
    }

    pub fn selection(&self, method: &str) -> Option<&SelectionResult> {
        self.selections.iter().find(|s| s.method == method)
    }

    /// Per-leaf selection signals of every trained model.
    pub fn signals(&self) -> Result<ExperimentTree<Option<f64>>> {
        selection::signal_tree(&self.models)
    }
}

/// Nested imputation and classifier selection experiment.
///
/// Use [`Experiment::builder()`] to create an experiment.
///
/// # Example
///
/// ```rust,ignore
/// use vimpute::{Direction, Experiment, ExperimentConfig, GridRegistry, ParamGrid};
/// use std::collections::HashMap;
///
/// let grids = GridRegistry::new()
///     .method("knn", ParamGrid::new().param("k", [1usize, 2, 3]))
///     .method("median", ParamGrid::new());
///
/// let experiment = Experiment::builder()
///     .config(ExperimentConfig::builder().seed(7).build()?)
///     .on_progress(|update| println!("[{:.0}%] {}", update.progress * 100.0, update.message))
///     .build()?;
///
/// let trained = experiment.train(&train_df, &train_outcome, &grids, &HashMap::new())?;
/// let state = trained.persist();
/// let predictions = experiment.replay(&state, &test_df)?;
/// let table = experiment.score(&predictions, &test_outcome)?;
/// ```
pub struct Experiment {
    config: ExperimentConfig,
    registry: MethodRegistry,
    trainer: Trainer,
    pool: ThreadPool,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
}

static_assertions::assert_impl_all!(Experiment: Send, Sync);

type ImputationUnit<'a> = (&'a str, Arc<dyn ImputationMethod>, &'a Configuration);

impl Experiment {
    /// Create a new experiment builder.
    pub fn builder() -> ExperimentBuilder {
        ExperimentBuilder::default()
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Report progress if a reporter is configured.
    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.progress_reporter {
            reporter.report(update);
        }
    }

    /// Run the train phase.
    ///
    /// `directions` overrides the selection direction per method; methods not
    /// listed use the direction of the configured classifier family.
    pub fn train(
        &self,
        df: &DataFrame,
        outcome: &[bool],
        grids: &GridRegistry,
        directions: &HashMap<String, Direction>,
    ) -> Result<TrainOutcome> {
        match self.train_internal(df, outcome, grids, directions) {
            Ok(result) => {
                self.report_progress(ProgressUpdate::complete(format!(
                    "Selected {} methods, {} exhausted",
                    result.selections.len(),
                    result.exhausted.len()
                )));
                Ok(result)
            }
            Err(e) => {
                self.report_progress(ProgressUpdate::failed(e.to_string()));
                error!("Training failed: {}", e);
                Err(e)
            }
        }
    }

    fn train_internal(
        &self,
        df: &DataFrame,
        outcome: &[bool],
        grids: &GridRegistry,
        directions: &HashMap<String, Direction>,
    ) -> Result<TrainOutcome> {
        let start_time = Instant::now();

        if grids.is_empty() {
            return Err(VimputeError::InvalidConfig(
                "no imputation methods to compare".to_string(),
            ));
        }
        if outcome.len() != df.height() {
            return Err(VimputeError::InvalidData(format!(
                "outcome has {} entries for {} rows",
                outcome.len(),
                df.height()
            )));
        }
        let data = FeatureMatrix::from_frame(df)?;
        info!(
            "Starting experiment: {} rows, {} features, seed {}",
            data.nrows(),
            data.ncols(),
            self.config.seed
        );

        // Resolve every method once, before any work is scheduled
        let configurations = grids.expand_all()?;
        let mut units: Vec<ImputationUnit<'_>> = Vec::new();
        for (name, rows) in &configurations {
            let method = self.registry.resolve(name)?;
            units.extend(rows.iter().map(|row| (name.as_str(), Arc::clone(&method), row)));
        }

        let mut warnings = Vec::new();
        let completions = self.impute_all(&data, &units, &mut warnings)?;
        let models = self.train_all(&completions, outcome, &mut warnings)?;

        // Selection
        self.report_progress(ProgressUpdate::new(
            ExperimentStage::Selection,
            0.0,
            "Selecting the best configuration per method...",
        ));
        let family = self.trainer.family();
        let direction_of = |method: &str| {
            directions
                .get(method)
                .copied()
                .unwrap_or_else(|| Direction::for_family(family))
        };
        let aggregates =
            selection::aggregate_signals(&selection::signal_tree(&models)?, &direction_of)?;
        let global_seed = self.config.seed;
        let seed_of = move |method: &str, configuration: usize| {
            derive_seed(global_seed, method, &[configuration])
        };
        let ctx = SelectionContext {
            models: &models,
            aggregates: &aggregates,
            completions: &completions,
            seed_of: &seed_of,
            max_rounds: self.config.max_rounds,
        };

        let mut selections = Vec::new();
        let mut exhausted = Vec::new();
        for (name, rows) in &configurations {
            match selection::select(name, rows, direction_of(name.as_str()), &ctx)? {
                Some(result) => {
                    info!(
                        "{}: selected {} (score {:.4})",
                        name, result.configuration, result.score
                    );
                    selections.push(result);
                }
                None => {
                    warnings.push(ExperimentWarning::exhausted(name));
                    exhausted.push(name.clone());
                }
            }
        }

        info!(
            "Experiment trained in {:.2?}: {} selected, {} exhausted, {} warnings",
            start_time.elapsed(),
            selections.len(),
            exhausted.len(),
            warnings.len()
        );

        Ok(TrainOutcome {
            features: data.names().to_vec(),
            configurations,
            completions,
            models,
            selections,
            exhausted,
            warnings,
        })
    }

    /// One unit per (method, configuration); results reassembled by key.
    fn impute_all(
        &self,
        data: &FeatureMatrix,
        units: &[ImputationUnit<'_>],
        warnings: &mut Vec<ExperimentWarning>,
    ) -> Result<CompletionTree> {
        let total = units.len();
        let done = AtomicUsize::new(0);
        self.report_progress(ProgressUpdate::with_items(
            ExperimentStage::Imputation,
            "configurations",
            0,
            total,
            format!("Imputing {total} configurations..."),
        ));

        let results: Vec<Vec<Result<Completion>>> = self.pool.install(|| {
            units
                .par_iter()
                .map(|(name, method, row)| {
                    let ctx = UnitContext {
                        seed: derive_seed(self.config.seed, name, &[row.index]),
                        realizations: self.config.realizations,
                        max_rounds: self.config.max_rounds,
                    };
                    let mut slots = method.impute(data, row, None, &ctx);
                    if slots.is_empty() {
                        slots.push(Err(VimputeError::convergence(
                            name,
                            row.index,
                            "adapter produced no completions",
                        )));
                    }
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    self.report_progress(ProgressUpdate::with_items(
                        ExperimentStage::Imputation,
                        row.to_string(),
                        finished,
                        total,
                        format!("Imputed {row}"),
                    ));
                    slots
                })
                .collect()
        });

        let mut tree = ExperimentTree::new(EXPERIMENT_DEPTH);
        for ((name, _, row), slots) in units.iter().zip(results) {
            for (r, slot) in slots.into_iter().enumerate() {
                let path = experiment_path(name, row.index, r);
                let leaf = match slot {
                    Ok(completion) => Some(completion),
                    Err(e) => {
                        warn!("Imputation failed at {}: {}", display_path(&path), e);
                        warnings.push(ExperimentWarning::leaf(
                            WarningKind::ImputationFailed,
                            &path,
                            &e,
                        ));
                        None
                    }
                };
                tree.insert(&path, leaf)?;
            }
        }
        debug!("Completion tree holds {} leaves", tree.leaf_count()?);
        Ok(tree)
    }

    /// One unit per completion leaf.
    fn train_all(
        &self,
        completions: &CompletionTree,
        outcome: &[bool],
        warnings: &mut Vec<ExperimentWarning>,
    ) -> Result<ModelTree> {
        let leaves = completions.leaves()?;
        let total = leaves.len();
        let done = AtomicUsize::new(0);
        self.report_progress(ProgressUpdate::with_items(
            ExperimentStage::Training,
            "completions",
            0,
            total,
            format!("Training {total} models..."),
        ));

        let fitted: Vec<(KeyPath, Option<Result<TrainedModel>>)> = self.pool.install(|| {
            leaves
                .par_iter()
                .map(|(path, completion)| {
                    let fit = (*completion).as_ref().map(|c| self.fit_leaf(path, c, outcome));
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    self.report_progress(ProgressUpdate::with_items(
                        ExperimentStage::Training,
                        display_path(path),
                        finished,
                        total,
                        format!("Trained {}", display_path(path)),
                    ));
                    (path.clone(), fit)
                })
                .collect()
        });

        let mut leaves_out = Vec::with_capacity(fitted.len());
        for (path, fit) in fitted {
            let model = match fit {
                Some(Ok(model)) => Some(model),
                Some(Err(e)) => {
                    warn!("Training failed at {}: {}", display_path(&path), e);
                    warnings.push(ExperimentWarning::leaf(WarningKind::TrainingFailed, &path, &e));
                    None
                }
                None => None,
            };
            leaves_out.push((path, model));
        }
        ExperimentTree::from_leaves(EXPERIMENT_DEPTH, leaves_out)
    }

    fn fit_leaf(
        &self,
        path: &[TreeKey],
        completion: &Completion,
        outcome: &[bool],
    ) -> Result<TrainedModel> {
        let (Some(method), Some(configuration), Some(realization)) = (
            path.first().and_then(TreeKey::as_name),
            path.get(1).and_then(TreeKey::as_index),
            path.get(2).and_then(TreeKey::as_index),
        ) else {
            return Err(VimputeError::StructuralMismatch(format!(
                "'{}' is not a method/configuration/realization path",
                display_path(path)
            )));
        };
        let seed = derive_seed(self.config.seed, method, &[configuration, realization]);
        self.trainer
            .fit(method, configuration, &completion.data, outcome, seed)
    }

    /// Replay persisted selections on new data.
    pub fn replay(&self, state: &PersistedState, df: &DataFrame) -> Result<PredictionTree> {
        self.report_progress(ProgressUpdate::new(
            ExperimentStage::Replay,
            0.0,
            format!("Replaying {} methods...", state.hyperparameters.len()),
        ));
        match replay::replay(state, df, &self.registry, &self.pool) {
            Ok(predictions) => {
                self.report_progress(ProgressUpdate::new(
                    ExperimentStage::Replay,
                    1.0,
                    "Replay finished",
                ));
                Ok(predictions)
            }
            Err(e) => {
                self.report_progress(ProgressUpdate::failed(e.to_string()));
                error!("Replay failed: {}", e);
                Err(e)
            }
        }
    }

    /// Score replayed predictions against the new outcome.
    pub fn score(
        &self,
        predictions: &PredictionTree,
        outcome: &[bool],
    ) -> Result<PerformanceTable> {
        self.report_progress(ProgressUpdate::new(
            ExperimentStage::Scoring,
            0.0,
            "Scoring predictions...",
        ));
        let table = scoring::score(predictions, outcome, self.config.threshold)?;
        self.report_progress(ProgressUpdate::complete(format!("Scored {} leaves", table.len())));
        Ok(table)
    }
}

/// Builder for [`Experiment`].
#[derive(Default)]
pub struct ExperimentBuilder {
    config: Option<ExperimentConfig>,
    registry: Option<MethodRegistry>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
}

static_assertions::assert_impl_all!(ExperimentBuilder: Send);

impl ExperimentBuilder {
    /// Set the experiment configuration.
    pub fn config(mut self, config: ExperimentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the method registry. Defaults to [`MethodRegistry::standard`].
    pub fn registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set a progress reporter for receiving updates during a run.
    pub fn progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    /// Set a progress callback closure.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_reporter = Some(Arc::new(ClosureProgressReporter::new(callback)));
        self
    }

    /// Build the experiment and its worker pool.
    pub fn build(self) -> Result<Experiment> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| VimputeError::InvalidConfig(e.to_string()))?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.n_workers)
            .thread_name(|i| format!("vimpute-worker-{i}"))
            .build()
            .map_err(|e| VimputeError::Internal(format!("failed to build worker pool: {e}")))?;

        Ok(Experiment {
            trainer: Trainer::new(&config),
            config,
            registry: self.registry.unwrap_or_else(MethodRegistry::standard),
            pool,
            progress_reporter: self.progress_reporter,
        })
    }
}
