//! Classifiers trained on every completed dataset.
//!
//! The [`Trainer`] fits one model per completion leaf with a fixed,
//! per-family configuration:
//! - random forest, with `mtry` tuned on out-of-bag error
//! - logistic regression, fit directly with no internal tuning
//!
//! A fit that cannot complete is reported as a
//! [`VimputeError::ConvergenceFailure`] so the caller can null the leaf.

mod decision_tree;
mod logistic;
mod random_forest;

pub use decision_tree::{DecisionTree, TreeNode, TreeParams};
pub use logistic::LogisticRegression;
pub use random_forest::{RandomForest, default_mtry, default_mtry_grid};

use crate::config::{ClassifierFamily, ExperimentConfig, ForestSettings, LogisticSettings};
use crate::error::{Result, VimputeError};
use crate::matrix::{FeatureMatrix, outcome_vector};
use crate::scoring::ConfusionMatrix;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A fitted classifier together with the feature names it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum TrainedModel {
    RandomForest {
        features: Vec<String>,
        forest: RandomForest,
    },
    Logistic {
        features: Vec<String>,
        model: LogisticRegression,
        /// MCC of the fitted probabilities on the training completion
        training_mcc: Option<f64>,
    },
}

impl TrainedModel {
    pub fn family(&self) -> ClassifierFamily {
        match self {
            Self::RandomForest { .. } => ClassifierFamily::RandomForest,
            Self::Logistic { .. } => ClassifierFamily::Logistic,
        }
    }

    pub fn features(&self) -> &[String] {
        match self {
            Self::RandomForest { features, .. } | Self::Logistic { features, .. } => features,
        }
    }

    /// Scalar used for model selection: OOB error for forests, training MCC for
    /// logistic models. Non-finite values are reported as `None`.
    pub fn selection_signal(&self) -> Option<f64> {
        let signal = match self {
            Self::RandomForest { forest, .. } => Some(forest.oob_error()),
            Self::Logistic { training_mcc, .. } => *training_mcc,
        };
        signal.filter(|s| s.is_finite())
    }

    /// P(outcome = true) per row. `data` must carry the training features in
    /// training order.
    pub fn predict_proba(&self, data: &FeatureMatrix) -> Result<Array1<f64>> {
        if data.names() != self.features() {
            return Err(VimputeError::InvalidData(format!(
                "model expects features {:?}, data has {:?}",
                self.features(),
                data.names()
            )));
        }
        if !data.is_complete() {
            return Err(VimputeError::InvalidData(
                "cannot predict on data with missing cells".to_string(),
            ));
        }
        Ok(match self {
            Self::RandomForest { forest, .. } => forest.predict_proba(data.values()),
            Self::Logistic { model, .. } => model.predict_proba(data.values()),
        })
    }
}

/// Fits one classifier per completion with fixed per-family settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Trainer {
    family: ClassifierFamily,
    forest: ForestSettings,
    logistic: LogisticSettings,
    threshold: f64,
}

impl Trainer {
    pub fn new(config: &ExperimentConfig) -> Self {
        Self {
            family: config.classifier,
            forest: config.forest.clone(),
            logistic: config.logistic.clone(),
            threshold: config.threshold,
        }
    }

    pub fn family(&self) -> ClassifierFamily {
        self.family
    }

    /// Fit a model on one completion of `(method, configuration)`.
    pub fn fit(
        &self,
        method: &str,
        configuration: usize,
        data: &FeatureMatrix,
        outcome: &[bool],
        seed: u64,
    ) -> Result<TrainedModel> {
        if outcome.len() != data.nrows() {
            return Err(VimputeError::InvalidData(format!(
                "outcome has {} entries for {} rows",
                outcome.len(),
                data.nrows()
            )));
        }
        if !data.is_complete() {
            return Err(VimputeError::InvalidData(format!(
                "completion for '{method}' configuration {configuration} still has missing cells"
            )));
        }
        let positives = outcome.iter().filter(|&&y| y).count();
        if positives == 0 || positives == outcome.len() {
            return Err(VimputeError::convergence(
                method,
                configuration,
                "training outcome has a single class",
            ));
        }

        let y = outcome_vector(outcome);
        let features = data.names().to_vec();
        match self.family {
            ClassifierFamily::RandomForest => {
                let forest = RandomForest::tune(data.values(), &y, &self.forest, seed);
                debug!(
                    "Forest for {method}[{configuration}]: mtry = {}, OOB error = {:.4}",
                    forest.mtry(),
                    forest.oob_error()
                );
                Ok(TrainedModel::RandomForest { features, forest })
            }
            ClassifierFamily::Logistic => {
                let model = LogisticRegression::fit(data.values(), &y, &self.logistic)
                    .map_err(|reason| VimputeError::convergence(method, configuration, reason))?;
                let fitted = model.predict_proba(data.values()).to_vec();
                let confusion =
                    ConfusionMatrix::from_probabilities(&fitted, outcome, self.threshold)?;
                let mcc = confusion.mcc();
                Ok(TrainedModel::Logistic {
                    features,
                    model,
                    training_mcc: mcc.is_finite().then_some(mcc),
                })
            }
        }
    }
}
