//! Imputation method adapters.
//!
//! Every method family implements [`ImputationMethod`]. An adapter turns a
//! dataset and one [`Configuration`] into an ordered list of [`Completion`]
//! slots, one per realization. A slot that failed holds an `Err`; the engine
//! nulls that leaf and carries on with its siblings.
//!
//! Methods are resolved by name once, through a [`MethodRegistry`], before any
//! work is scheduled:
//! - `mice`: chained equations with predictive mean matching
//! - `svd`: iterative low-rank completion
//! - `knn`: inverse-distance weighted nearest rows of a reference matrix
//! - `min`, `max`, `mean`, `median`, `zero`, `outlier`: stored per-feature constants
//! - `indicator`: missingness indicator augmentation

mod chained;
mod indicator;
mod knn;
mod low_rank;
mod statistical;

pub use chained::ChainedImputer;
pub use indicator::IndicatorAugmenter;
pub use knn::NeighborImputer;
pub use low_rank::LowRankImputer;
pub use statistical::{FillStatistic, SingleValueImputer};

use crate::error::{Result, VimputeError};
use crate::grid::Configuration;
use crate::matrix::FeatureMatrix;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Capability variant of an imputation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Multiple stochastic realizations per configuration
    Stochastic,
    /// One deterministic matrix completion per configuration
    MatrixCompletion,
    /// Fills from nearest rows of a reference matrix
    Neighbor,
    /// One stored constant per feature
    SingleValue,
    /// Appends missingness indicators
    Indicator,
}

impl MethodKind {
    /// Whether replay must be given the estimate captured at train time.
    pub fn requires_estimate(&self) -> bool {
        matches!(self, Self::Neighbor | Self::SingleValue | Self::Indicator)
    }
}

/// State captured from the training data that replays a transform on new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Estimate {
    /// One fill constant per feature.
    FillValues { names: Vec<String>, values: Vec<f64> },
    /// The training matrix used as the neighbor pool, missing cells included.
    Reference {
        names: Vec<String>,
        #[serde(with = "crate::utils::nan_matrix_as_null")]
        rows: Array2<f64>,
    },
    /// Fill constant for original missing cells and the indicator columns kept.
    Indicators { fill: f64, kept: Vec<String> },
}

impl Estimate {
    /// Feature names the estimate was captured on.
    pub fn feature_names(&self) -> Option<&[String]> {
        match self {
            Self::FillValues { names, .. } | Self::Reference { names, .. } => Some(names),
            Self::Indicators { .. } => None,
        }
    }
}

/// One missing-free dataset for a (method, configuration, realization).
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub data: FeatureMatrix,
    pub estimate: Option<Estimate>,
}

/// Per-unit inputs that do not come from the configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitContext {
    /// Seed derived for this (method, configuration).
    pub seed: u64,
    /// Default realization count for stochastic methods.
    pub realizations: usize,
    /// Iteration cap for iterative procedures.
    pub max_rounds: usize,
}

/// A pluggable imputation method family.
pub trait ImputationMethod: Send + Sync {
    fn kind(&self) -> MethodKind;

    /// Number of completions produced for `config`.
    fn realizations(&self, _config: &Configuration, _default_m: usize) -> Result<usize> {
        Ok(1)
    }

    /// Complete `data` under `config`. With `estimate` set the adapter runs in
    /// replay mode and must not derive statistics from `data`.
    ///
    /// Returns exactly [`realizations`](Self::realizations) slots.
    fn impute(
        &self,
        data: &FeatureMatrix,
        config: &Configuration,
        estimate: Option<&Estimate>,
        ctx: &UnitContext,
    ) -> Vec<Result<Completion>>;
}

/// Name -> method lookup, resolved once per method per run.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Vec<(String, Arc<dyn ImputationMethod>)>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl MethodRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in method.
    pub fn standard() -> Self {
        let mut registry = Self::new()
            .register("mice", ChainedImputer)
            .register("svd", LowRankImputer)
            .register("knn", NeighborImputer);
        for statistic in FillStatistic::ALL {
            registry = registry.register(statistic.name(), SingleValueImputer::new(statistic));
        }
        registry.register("indicator", IndicatorAugmenter)
    }

    /// Register a method under `name`, replacing any previous entry.
    pub fn register(
        mut self,
        name: impl Into<String>,
        method: impl ImputationMethod + 'static,
    ) -> Self {
        let name = name.into();
        let method: Arc<dyn ImputationMethod> = Arc::new(method);
        match self.methods.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = method,
            None => self.methods.push((name, method)),
        }
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ImputationMethod>> {
        self.methods
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| Arc::clone(m))
            .ok_or_else(|| VimputeError::UnknownMethod(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(n, _)| n.as_str())
    }
}

/// Check that a replay estimate was captured on the same feature set.
pub(crate) fn check_feature_names(
    method: &str,
    expected: &[String],
    data: &FeatureMatrix,
) -> Result<()> {
    if expected != data.names() {
        return Err(VimputeError::InvalidData(format!(
            "estimate for '{method}' was captured on features {expected:?}, data has {:?}",
            data.names()
        )));
    }
    Ok(())
}

pub(crate) fn wrong_estimate(method: &str, estimate: &Estimate) -> VimputeError {
    VimputeError::InvalidData(format!(
        "method '{method}' cannot replay a {} estimate",
        match estimate {
            Estimate::FillValues { .. } => "fill-values",
            Estimate::Reference { .. } => "reference",
            Estimate::Indicators { .. } => "indicators",
        }
    ))
}
