//! Configuration types for nested imputation experiments.
//!
//! This module provides configuration options using the builder pattern
//! for flexible and ergonomic experiment setup.

use serde::{Deserialize, Serialize};

/// Classifier family trained on every completed dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierFamily {
    /// Bagged CART forest, `mtry` tuned on out-of-bag error
    #[default]
    RandomForest,
    /// Binomial GLM fit directly by IRLS, no internal tuning
    Logistic,
}

/// Settings for the random forest family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestSettings {
    /// Number of trees per forest.
    /// Default: 200
    pub n_trees: usize,

    /// Candidate features-per-split values tried during OOB tuning.
    /// Empty means half, once and twice `ceil(sqrt(p))`, clamped to `1..=p`.
    /// Default: empty
    pub mtry_candidates: Vec<usize>,

    /// Minimum samples in a leaf.
    /// Default: 1
    pub min_samples_leaf: usize,

    /// Optional depth limit per tree.
    /// Default: None
    pub max_depth: Option<usize>,
}

impl Default for ForestSettings {
    fn default() -> Self {
        Self {
            n_trees: 200,
            mtry_candidates: Vec::new(),
            min_samples_leaf: 1,
            max_depth: None,
        }
    }
}

/// Settings for the logistic regression family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticSettings {
    /// Maximum IRLS iterations before the fit is declared non-convergent.
    /// Default: 25
    pub max_iter: usize,

    /// Relative deviance change below which IRLS stops.
    /// Default: 1e-8
    pub tolerance: f64,

    /// L2 penalty added to the Hessian diagonal (intercept excluded).
    /// Default: 1e-8
    pub ridge: f64,
}

impl Default for LogisticSettings {
    fn default() -> Self {
        Self {
            max_iter: 25,
            tolerance: 1e-8,
            ridge: 1e-8,
        }
    }
}

/// Configuration for an experiment.
///
/// Use [`ExperimentConfig::builder()`] to create a new configuration
/// with fluent API.
///
/// # Example
///
/// ```rust,ignore
/// use vimpute::config::{ClassifierFamily, ExperimentConfig};
///
/// let config = ExperimentConfig::builder()
///     .seed(42)
///     .n_workers(4)
///     .classifier(ClassifierFamily::Logistic)
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Global seed from which every unit seed is derived.
    /// Default: 1234
    pub seed: u64,

    /// Number of worker threads in the experiment pool.
    /// Default: available parallelism
    pub n_workers: usize,

    /// Realizations per configuration for stochastic methods without an `m` parameter.
    /// Default: 5
    pub realizations: usize,

    /// Iteration cap for stochastic imputation procedures.
    /// Default: 10
    pub max_rounds: usize,

    /// Classifier family trained on every completion.
    /// Default: RandomForest
    pub classifier: ClassifierFamily,

    /// Random forest settings.
    pub forest: ForestSettings,

    /// Logistic regression settings.
    pub logistic: LogisticSettings,

    /// Probability threshold for the positive class decision.
    /// Default: 0.5
    pub threshold: f64,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 1234,
            n_workers: default_workers(),
            realizations: 5,
            max_rounds: 10,
            classifier: ClassifierFamily::default(),
            forest: ForestSettings::default(),
            logistic: LogisticSettings::default(),
            threshold: 0.5,
        }
    }
}

impl ExperimentConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ExperimentConfigBuilder {
        ExperimentConfigBuilder::default()
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.n_workers == 0 {
            return Err(ConfigValidationError::InvalidCount {
                field: "n_workers".to_string(),
                value: 0,
            });
        }

        if self.realizations == 0 {
            return Err(ConfigValidationError::InvalidCount {
                field: "realizations".to_string(),
                value: 0,
            });
        }

        if self.max_rounds == 0 {
            return Err(ConfigValidationError::InvalidCount {
                field: "max_rounds".to_string(),
                value: 0,
            });
        }

        if self.forest.n_trees == 0 {
            return Err(ConfigValidationError::InvalidCount {
                field: "forest.n_trees".to_string(),
                value: 0,
            });
        }

        if self.forest.mtry_candidates.contains(&0) {
            return Err(ConfigValidationError::InvalidCount {
                field: "forest.mtry_candidates".to_string(),
                value: 0,
            });
        }

        if self.logistic.max_iter == 0 {
            return Err(ConfigValidationError::InvalidCount {
                field: "logistic.max_iter".to_string(),
                value: 0,
            });
        }

        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ConfigValidationError::InvalidThreshold(self.threshold));
        }

        Ok(())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid value for '{field}': {value} (must be at least 1)")]
    InvalidCount { field: String, value: usize },

    #[error("Invalid decision threshold: {0} (must be strictly between 0.0 and 1.0)")]
    InvalidThreshold(f64),
}

/// Builder for [`ExperimentConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct ExperimentConfigBuilder {
    seed: Option<u64>,
    n_workers: Option<usize>,
    realizations: Option<usize>,
    max_rounds: Option<usize>,
    classifier: Option<ClassifierFamily>,
    forest: Option<ForestSettings>,
    logistic: Option<LogisticSettings>,
    threshold: Option<f64>,
}

impl ExperimentConfigBuilder {
    /// Set the global seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the number of worker threads.
    ///
    /// Results do not depend on this value; only wall-clock time does.
    pub fn n_workers(mut self, n: usize) -> Self {
        self.n_workers = Some(n);
        self
    }

    /// Set the default realization count for stochastic methods.
    pub fn realizations(mut self, m: usize) -> Self {
        self.realizations = Some(m);
        self
    }

    /// Set the iteration cap for stochastic imputation.
    pub fn max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    /// Set the classifier family.
    pub fn classifier(mut self, family: ClassifierFamily) -> Self {
        self.classifier = Some(family);
        self
    }

    /// Set random forest settings.
    pub fn forest(mut self, settings: ForestSettings) -> Self {
        self.forest = Some(settings);
        self
    }

    /// Set logistic regression settings.
    pub fn logistic(mut self, settings: LogisticSettings) -> Self {
        self.logistic = Some(settings);
        self
    }

    /// Set the decision threshold.
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `ExperimentConfig` or an error if validation fails.
    pub fn build(self) -> Result<ExperimentConfig, ConfigValidationError> {
        let config = ExperimentConfig {
            seed: self.seed.unwrap_or(1234),
            n_workers: self.n_workers.unwrap_or_else(default_workers),
            realizations: self.realizations.unwrap_or(5),
            max_rounds: self.max_rounds.unwrap_or(10),
            classifier: self.classifier.unwrap_or_default(),
            forest: self.forest.unwrap_or_default(),
            logistic: self.logistic.unwrap_or_default(),
            threshold: self.threshold.unwrap_or(0.5),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.seed, 1234);
        assert_eq!(config.realizations, 5);
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.classifier, ClassifierFamily::RandomForest);
        assert!(config.n_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_custom_values() {
        let config = ExperimentConfig::builder()
            .seed(7)
            .n_workers(3)
            .realizations(2)
            .classifier(ClassifierFamily::Logistic)
            .build()
            .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.n_workers, 3);
        assert_eq!(config.realizations, 2);
        assert_eq!(config.classifier, ClassifierFamily::Logistic);
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = ExperimentConfig::builder().n_workers(0).build();
        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::InvalidCount { .. }
        ));
    }

    #[test]
    fn test_validation_threshold_bounds() {
        assert!(matches!(
            ExperimentConfig::builder().threshold(1.0).build().unwrap_err(),
            ConfigValidationError::InvalidThreshold(_)
        ));
        assert!(ExperimentConfig::builder().threshold(0.3).build().is_ok());
    }

    #[test]
    fn test_validation_zero_mtry_candidate() {
        let forest = ForestSettings {
            mtry_candidates: vec![2, 0],
            ..ForestSettings::default()
        };
        assert!(ExperimentConfig::builder().forest(forest).build().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "seed": 99,
            "n_workers": 2,
            "realizations": 3,
            "max_rounds": 5,
            "classifier": "logistic",
            "forest": {
                "n_trees": 50,
                "mtry_candidates": [1, 2],
                "min_samples_leaf": 2,
                "max_depth": 8
            },
            "logistic": {"max_iter": 30, "tolerance": 1e-9, "ridge": 0.0},
            "threshold": 0.5
        }"#;

        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, 99);
        assert_eq!(config.classifier, ClassifierFamily::Logistic);
        assert_eq!(config.forest.mtry_candidates, vec![1, 2]);
        assert_eq!(config.forest.max_depth, Some(8));
        assert_eq!(config.logistic.max_iter, 30);
    }
}
