//! Pipeline module.
//!
//! This module provides the experiment facade and progress reporting.

mod experiment;
pub mod progress;

pub use experiment::{Experiment, ExperimentBuilder, ExperimentWarning, TrainOutcome, WarningKind};
pub use progress::{ClosureProgressReporter, ExperimentStage, ProgressReporter, ProgressUpdate};
