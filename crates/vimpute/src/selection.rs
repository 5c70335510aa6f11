//! Per-method model selection.
//!
//! Selection runs entirely on the tree engine:
//! 1. `map_leaves` turns the model tree into a tree of optional signals.
//! 2. `map_branches` averages each configuration's non-null signals, falling
//!    back to the direction's sentinel when all of them are null.
//! 3. The best configuration per method is picked, lowest index first on
//!    ties. [`best_configurations`] does this for every method with
//!    `map_branches`; [`select`] reads one method's aggregates only.
//!
//! A method whose every configuration sits at the sentinel is exhausted and
//! produces no [`SelectionResult`].

use crate::config::ClassifierFamily;
use crate::error::Result;
use crate::grid::Configuration;
use crate::imputers::{Completion, Estimate};
use crate::models::TrainedModel;
use crate::tree::{ExperimentTree, TreeKey, any_leaf};
use crate::utils::mean;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Leaf type of the model tree; `None` marks a failed fit.
pub type ModelTree = ExperimentTree<Option<TrainedModel>>;

/// Leaf type of the completion tree; `None` marks a failed imputation.
pub type CompletionTree = ExperimentTree<Option<Completion>>;

/// Whether lower or higher signals are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Direction {
    /// Worst possible aggregate in this direction.
    pub fn sentinel(&self) -> f64 {
        match self {
            Self::Minimize => f64::INFINITY,
            Self::Maximize => f64::NEG_INFINITY,
        }
    }

    /// Direction of the selection signal each classifier family reports.
    pub fn for_family(family: ClassifierFamily) -> Self {
        match family {
            ClassifierFamily::RandomForest => Self::Minimize,
            ClassifierFamily::Logistic => Self::Maximize,
        }
    }

    /// Whether `candidate` strictly beats `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }
}

/// Winning configuration of one method and everything replay needs from it.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    pub method: String,
    pub configuration: Configuration,
    /// Aggregate signal of the winner
    pub score: f64,
    /// Aggregate per configuration, in configuration order
    pub aggregates: Vec<f64>,
    /// Realizations generated for the winner at train time
    pub realizations: usize,
    /// Non-null models of the winner, by realization index
    pub models: Vec<(usize, TrainedModel)>,
    pub estimate: Option<Estimate>,
    /// Unit seed of the winner
    pub seed: u64,
    /// Iteration cap the winner was imputed under
    pub max_rounds: usize,
}

/// Inputs shared by every method in one selection pass.
#[derive(Clone, Copy)]
pub struct SelectionContext<'a> {
    pub models: &'a ModelTree,
    /// Per-configuration aggregates of every method, from [`aggregate_signals`]
    pub aggregates: &'a ExperimentTree<f64>,
    pub completions: &'a CompletionTree,
    /// Unit seed for a (method, configuration index)
    pub seed_of: &'a dyn Fn(&str, usize) -> u64,
    pub max_rounds: usize,
}

/// Per-leaf selection signals.
pub fn signal_tree(models: &ModelTree) -> Result<ExperimentTree<Option<f64>>> {
    models.map_leaves(any_leaf, |model| {
        model.as_ref().and_then(TrainedModel::selection_signal)
    })
}

/// Mean of the non-null signals per configuration; the sentinel when none
/// survive. `direction_of` maps a method name to its direction.
pub fn aggregate_signals<D>(
    signals: &ExperimentTree<Option<f64>>,
    direction_of: D,
) -> Result<ExperimentTree<f64>>
where
    D: Fn(&str) -> Direction,
{
    signals.map_branches(|path, realizations| {
        let observed: Vec<f64> = realizations
            .iter()
            .filter_map(|(_, signal)| signal.filter(|s| s.is_finite()))
            .collect();
        let direction = direction_of(path.first().and_then(TreeKey::as_name).unwrap_or_default());
        mean(&observed).unwrap_or_else(|| direction.sentinel())
    })
}

/// Best `(configuration index, aggregate)` per method, or `None` when every
/// configuration sits at the sentinel.
pub fn best_configurations<D>(
    aggregates: &ExperimentTree<f64>,
    direction_of: D,
) -> Result<ExperimentTree<Option<(usize, f64)>>>
where
    D: Fn(&str) -> Direction,
{
    aggregates.map_branches(|path, configurations| {
        let direction = direction_of(path.first().and_then(TreeKey::as_name).unwrap_or_default());
        pick_best(
            configurations
                .iter()
                .filter_map(|&(key, &aggregate)| Some((key.as_index()?, aggregate))),
            direction,
        )
    })
}

/// Best `(index, aggregate)` among candidates, skipping sentinel and NaN
/// aggregates. Ties go to the lowest index.
fn pick_best(
    candidates: impl IntoIterator<Item = (usize, f64)>,
    direction: Direction,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, aggregate) in candidates {
        if aggregate == direction.sentinel() || aggregate.is_nan() {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_index, best_score)) => {
                direction.improves(aggregate, best_score)
                    || (aggregate == best_score && index < best_index)
            }
        };
        if better {
            best = Some((index, aggregate));
        }
    }
    best
}

/// Select the winning configuration of one method.
///
/// Only the method's own aggregates in `ctx` are read. Returns `Ok(None)` when
/// the method is exhausted; a method absent from the aggregates is treated as
/// exhausted as well.
pub fn select(
    method: &str,
    configurations: &[Configuration],
    direction: Direction,
    ctx: &SelectionContext<'_>,
) -> Result<Option<SelectionResult>> {
    let method_key = TreeKey::name(method);
    let mut per_configuration = vec![direction.sentinel(); configurations.len()];
    for (path, aggregate) in ctx.aggregates.leaves_under(std::slice::from_ref(&method_key))? {
        if let Some(slot) = path
            .get(1)
            .and_then(TreeKey::as_index)
            .and_then(|i| per_configuration.get_mut(i))
        {
            *slot = *aggregate;
        }
    }

    let best = pick_best(per_configuration.iter().copied().enumerate(), direction);
    let Some((index, score)) = best else {
        warn!(
            "Method '{}' exhausted: all {} configurations failed",
            method,
            configurations.len()
        );
        return Ok(None);
    };
    let Some(configuration) = configurations.iter().find(|c| c.index == index) else {
        warn!("Method '{}' selected unknown configuration {}", method, index);
        return Ok(None);
    };

    let prefix = [method_key, TreeKey::Index(index)];
    let model_leaves = ctx.models.leaves_under(&prefix)?;
    let models: Vec<(usize, TrainedModel)> = model_leaves
        .iter()
        .filter_map(|(path, model)| {
            let realization = path.last().and_then(TreeKey::as_index)?;
            (*model).as_ref().map(|m| (realization, m.clone()))
        })
        .collect();
    let estimate = ctx
        .completions
        .leaves_under(&prefix)?
        .into_iter()
        .find_map(|(_, completion)| completion.as_ref().and_then(|c| c.estimate.clone()));

    debug!(
        "Selected {} with aggregate {:.4} ({} of {} realizations usable)",
        configuration,
        score,
        models.len(),
        model_leaves.len()
    );

    Ok(Some(SelectionResult {
        method: method.to_string(),
        configuration: configuration.clone(),
        score,
        aggregates: per_configuration,
        realizations: model_leaves.len(),
        models,
        estimate,
        seed: (ctx.seed_of)(method, index),
        max_rounds: ctx.max_rounds,
    }))
}
