//! Progress reporting for experiment runs.
//!
//! Training is reported in three stages (imputation, training, selection),
//! replay and scoring in two. Units of work report item counts, so a caller
//! can render "configuration 3/12" style feedback from another thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use vimpute::Experiment;
//!
//! let outcome = Experiment::builder()
//!     .on_progress(|update| {
//!         println!("[{:?}] {}", update.stage, update.message);
//!     })
//!     .build()?
//!     .train(&df, &outcome, &grids, &directions)?;
//! ```

use serde::{Deserialize, Serialize};

/// Stages of an experiment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStage {
    /// Completing the dataset under every configuration
    Imputation,
    /// Fitting one classifier per completion
    Training,
    /// Aggregating signals and picking winners
    Selection,
    /// Regenerating completions and predicting on new data
    Replay,
    /// Scoring predictions against a new outcome
    Scoring,
    /// Run completed successfully
    Complete,
    /// Run failed with an error
    Failed,
}

impl ExperimentStage {
    /// Returns a human-readable name for the stage.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Imputation => "Imputing Datasets",
            Self::Training => "Training Models",
            Self::Selection => "Selecting Models",
            Self::Replay => "Replaying Selections",
            Self::Scoring => "Scoring Predictions",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }

    /// Share of its run this stage accounts for (0.0 - 1.0).
    ///
    /// Train stages sum to 1.0, as do replay and scoring together.
    pub fn weight(&self) -> f32 {
        match self {
            Self::Imputation => 0.40,
            Self::Training => 0.50,
            Self::Selection => 0.10,
            Self::Replay => 0.80,
            Self::Scoring => 0.20,
            Self::Complete | Self::Failed => 0.0,
        }
    }

    /// Cumulative progress of the run at the start of this stage.
    pub fn base_progress(&self) -> f32 {
        match self {
            Self::Imputation => 0.0,
            Self::Training => 0.40,
            Self::Selection => 0.90,
            Self::Replay => 0.0,
            Self::Scoring => 0.80,
            Self::Complete => 1.0,
            Self::Failed => 0.0,
        }
    }
}

/// Progress update with optional sub-stage and item counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Current stage
    pub stage: ExperimentStage,

    /// Optional sub-stage description (e.g., "knn[2] k=3")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<String>,

    /// Overall progress (0.0 - 1.0)
    pub progress: f32,

    /// Progress within current stage (0.0 - 1.0)
    pub stage_progress: f32,

    /// Human-readable message describing current activity
    pub message: String,

    /// Units finished in current stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<usize>,

    /// Units scheduled in current stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_total: Option<usize>,
}

impl ProgressUpdate {
    /// Creates a new progress update for a stage without sub-stage info.
    pub fn new(stage: ExperimentStage, stage_progress: f32, message: impl Into<String>) -> Self {
        let progress = stage.base_progress() + (stage.weight() * stage_progress);
        Self {
            stage,
            sub_stage: None,
            progress: progress.clamp(0.0, 1.0),
            stage_progress: stage_progress.clamp(0.0, 1.0),
            message: message.into(),
            items_processed: None,
            items_total: None,
        }
    }

    /// Creates a new progress update with item counts.
    pub fn with_items(
        stage: ExperimentStage,
        sub_stage: impl Into<String>,
        current: usize,
        total: usize,
        message: impl Into<String>,
    ) -> Self {
        let stage_progress = if total > 0 {
            current as f32 / total as f32
        } else {
            0.0
        };
        Self {
            sub_stage: Some(sub_stage.into()),
            items_processed: Some(current),
            items_total: Some(total),
            ..Self::new(stage, stage_progress, message)
        }
    }

    /// Creates a completion progress update.
    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(ExperimentStage::Complete, 1.0, message)
    }

    /// Creates a failed progress update.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ExperimentStage::Failed, 0.0, message)
    }
}

/// Receives progress updates from an experiment.
///
/// Reports arrive from worker threads, so implementations must be
/// `Send + Sync` and should return quickly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// [`ProgressReporter`] backed by a closure.
pub struct ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    callback: F,
}

impl<F> ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        (self.callback)(update);
    }
}

static_assertions::assert_impl_all!(ProgressUpdate: Send, Sync);
