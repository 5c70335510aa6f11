//! Nested Imputation Experiment Library
//!
//! Compares strategies for handling missing values in tabular variant features
//! combined with classifier training, selects the best imputation and model per
//! method family, and replays the selection on held-out data without leakage.
//!
//! # Overview
//!
//! - **Grid Registry**: expands per-method parameter candidates into ordered configurations
//! - **Imputation Adapters**: chained equations, low-rank completion, nearest neighbors,
//!   single-value fills and missingness indicators behind one [`ImputationMethod`] trait
//! - **Tree Engine**: depth-first map, collapse and flatten over
//!   `method -> configuration -> realization` trees
//! - **Trainer**: random forest tuned on out-of-bag error, or logistic regression
//! - **Model Selector**: mean signal per configuration with sentinel handling and
//!   lowest-index tie breaking
//! - **Replay Engine**: regenerates completions from persisted estimates only
//! - **Performance Aggregator**: MCC, AUC, sensitivity, specificity, F1, precision
//!   and recall per leaf, as a flat table
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use vimpute::{Experiment, ExperimentConfig, GridRegistry, ParamGrid};
//! use std::collections::HashMap;
//!
//! let grids = GridRegistry::new()
//!     .method("mice", ParamGrid::new().param("m", [5usize]))
//!     .method("knn", ParamGrid::new().param("k", [1usize, 2, 3]))
//!     .method("median", ParamGrid::new());
//!
//! let experiment = Experiment::builder()
//!     .config(ExperimentConfig::builder().seed(42).n_workers(4).build()?)
//!     .build()?;
//!
//! // Train phase
//! let trained = experiment.train(&train_df, &train_outcome, &grids, &HashMap::new())?;
//! for warning in &trained.warnings {
//!     eprintln!("{}: {}", warning.method, warning.message);
//! }
//!
//! // Persist, then replay on held-out data
//! let json = trained.persist().to_json()?;
//! let state = vimpute::PersistedState::from_json(&json)?;
//! let predictions = experiment.replay(&state, &test_df)?;
//! let table = experiment.score(&predictions, &test_outcome)?;
//! println!("{}", table.summarize(&["method"])?);
//! ```
//!
//! # Determinism
//!
//! Every unit of work seeds its own generator from the global seed, the method
//! name and its indices (see [`utils::derive_seed`]), so two runs with the same
//! seed produce identical completions, models and selections regardless of the
//! worker count.

pub mod config;
pub mod error;
pub mod grid;
pub mod imputers;
pub mod matrix;
pub mod models;
pub mod pipeline;
pub mod replay;
pub mod scoring;
pub mod selection;
pub mod tree;
pub mod utils;

// Re-exports for convenient access
pub use config::{
    ClassifierFamily, ConfigValidationError, ExperimentConfig, ExperimentConfigBuilder,
    ForestSettings, LogisticSettings,
};
pub use error::{Result as VimputeResult, ResultExt, VimputeError};
pub use grid::{Configuration, GridRegistry, ParamGrid, ParamValue};
pub use imputers::{Completion, Estimate, ImputationMethod, MethodKind, MethodRegistry, UnitContext};
pub use matrix::FeatureMatrix;
pub use models::{LogisticRegression, RandomForest, TrainedModel, Trainer};
pub use pipeline::{
    ClosureProgressReporter, Experiment, ExperimentBuilder, ExperimentStage, ExperimentWarning,
    ProgressReporter, ProgressUpdate, TrainOutcome, WarningKind,
};
pub use replay::{HyperparameterRecord, ModelRecord, PersistedState, PredictionTree};
pub use scoring::{ConfusionMatrix, Metric, PerformanceRecord, PerformanceTable};
pub use selection::{Direction, SelectionResult};
pub use tree::{ExperimentTree, FlatRow, KeyPath, TreeKey};

// Types handed to worker threads
static_assertions::assert_impl_all!(FeatureMatrix: Send, Sync);
static_assertions::assert_impl_all!(Completion: Send, Sync);
static_assertions::assert_impl_all!(TrainedModel: Send, Sync);
static_assertions::assert_impl_all!(MethodRegistry: Send, Sync);
static_assertions::assert_impl_all!(VimputeError: Send, Sync);
