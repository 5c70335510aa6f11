//! Performance aggregation over prediction trees.
//!
//! Probabilities are thresholded into class decisions, scored per leaf, and
//! flattened into a [`PerformanceTable`] keyed by method, configuration and
//! realization with one column per [`Metric`].

use crate::error::{Result, VimputeError};
use crate::replay::PredictionTree;
use crate::tree::{ExperimentTree, FlatRow, KeyPath, TreeKey, display_path, flatten};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Classification metrics reported per leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Mcc,
    Auc,
    Sensitivity,
    Specificity,
    F1,
    Precision,
    Recall,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Self::Mcc,
        Self::Auc,
        Self::Sensitivity,
        Self::Specificity,
        Self::F1,
        Self::Precision,
        Self::Recall,
    ];

    /// Column name in performance tables.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mcc => "mcc",
            Self::Auc => "auc",
            Self::Sensitivity => "sensitivity",
            Self::Specificity => "specificity",
            Self::F1 => "f1",
            Self::Precision => "precision",
            Self::Recall => "recall",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 2x2 confusion counts with `true` as the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

#[inline]
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        f64::NAN
    } else {
        numerator / denominator
    }
}

impl ConfusionMatrix {
    /// Threshold probabilities (`p >= threshold` is positive) and count.
    pub fn from_probabilities(
        probabilities: &[f64],
        outcome: &[bool],
        threshold: f64,
    ) -> Result<Self> {
        if probabilities.len() != outcome.len() {
            return Err(VimputeError::StructuralMismatch(format!(
                "{} predictions for {} outcomes",
                probabilities.len(),
                outcome.len()
            )));
        }

        let mut matrix = Self::default();
        for (&p, &actual) in probabilities.iter().zip(outcome) {
            match (p >= threshold, actual) {
                (true, true) => matrix.true_positives += 1,
                (true, false) => matrix.false_positives += 1,
                (false, false) => matrix.true_negatives += 1,
                (false, true) => matrix.false_negatives += 1,
            }
        }
        Ok(matrix)
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn sensitivity(&self) -> f64 {
        ratio(
            self.true_positives as f64,
            (self.true_positives + self.false_negatives) as f64,
        )
    }

    pub fn specificity(&self) -> f64 {
        ratio(
            self.true_negatives as f64,
            (self.true_negatives + self.false_positives) as f64,
        )
    }

    pub fn precision(&self) -> f64 {
        ratio(
            self.true_positives as f64,
            (self.true_positives + self.false_positives) as f64,
        )
    }

    pub fn recall(&self) -> f64 {
        self.sensitivity()
    }

    pub fn f1(&self) -> f64 {
        ratio(
            2.0 * self.true_positives as f64,
            (2 * self.true_positives + self.false_positives + self.false_negatives) as f64,
        )
    }

    /// Matthews correlation coefficient; NaN when any margin is empty.
    pub fn mcc(&self) -> f64 {
        let (tp, fp, tn, fn_) = (
            self.true_positives as f64,
            self.false_positives as f64,
            self.true_negatives as f64,
            self.false_negatives as f64,
        );
        let denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        ratio(tp * tn - fp * fn_, denominator)
    }
}

/// Area under the ROC curve via the Mann-Whitney statistic, midranks for ties.
pub fn auc(probabilities: &[f64], outcome: &[bool]) -> f64 {
    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|&a, &b| probabilities[a].total_cmp(&probabilities[b]));

    let mut ranks = vec![0.0; probabilities.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len()
            && probabilities[order[end + 1]] == probabilities[order[start]]
        {
            end += 1;
        }
        // ranks are 1-based
        let midrank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = midrank;
        }
        start = end + 1;
    }

    let n_pos = outcome.iter().filter(|&&y| y).count() as f64;
    let n_neg = outcome.len() as f64 - n_pos;
    let rank_sum: f64 = ranks
        .iter()
        .zip(outcome)
        .filter(|(_, y)| **y)
        .map(|(r, _)| r)
        .sum();
    ratio(rank_sum - n_pos * (n_pos + 1.0) / 2.0, n_pos * n_neg)
}

/// Reject outcome sets in which only one class is present.
pub fn check_outcome(metric: &str, outcome: &[bool]) -> Result<()> {
    let positives = outcome.iter().filter(|&&y| y).count();
    if positives == 0 || positives == outcome.len() {
        return Err(VimputeError::DegenerateMetric {
            metric: metric.to_string(),
            reason: format!(
                "outcome has {} cases of a single class; both classes are required",
                outcome.len()
            ),
        });
    }
    Ok(())
}

/// Compute one metric for one prediction vector.
pub fn compute_metric(
    metric: Metric,
    probabilities: &[f64],
    outcome: &[bool],
    threshold: f64,
) -> Result<f64> {
    check_outcome(metric.name(), outcome)?;
    if metric == Metric::Auc {
        if probabilities.len() != outcome.len() {
            return Err(VimputeError::StructuralMismatch(format!(
                "{} predictions for {} outcomes",
                probabilities.len(),
                outcome.len()
            )));
        }
        return Ok(auc(probabilities, outcome));
    }

    let matrix = ConfusionMatrix::from_probabilities(probabilities, outcome, threshold)?;
    Ok(match metric {
        Metric::Mcc => matrix.mcc(),
        Metric::Sensitivity => matrix.sensitivity(),
        Metric::Specificity => matrix.specificity(),
        Metric::F1 => matrix.f1(),
        Metric::Precision => matrix.precision(),
        Metric::Recall => matrix.recall(),
        Metric::Auc => auc(probabilities, outcome),
    })
}

/// One flattened row of a performance table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceRecord {
    pub method: String,
    pub configuration: usize,
    pub realization: usize,
    /// Values in the table's metric order
    pub values: Vec<f64>,
}

/// Per-leaf metrics keyed by (method, configuration, realization).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceTable {
    metrics: Vec<Metric>,
    rows: Vec<PerformanceRecord>,
}

fn record_key(keys: &[TreeKey]) -> Result<(String, usize, usize)> {
    match keys {
        [TreeKey::Name(method), TreeKey::Index(configuration), TreeKey::Index(realization)] => {
            Ok((method.clone(), *configuration, *realization))
        }
        _ => Err(VimputeError::StructuralMismatch(format!(
            "'{}' is not a method/configuration/realization path",
            display_path(keys)
        ))),
    }
}

impl PerformanceTable {
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn rows(&self) -> &[PerformanceRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `metric` at one key.
    pub fn value(
        &self,
        method: &str,
        configuration: usize,
        realization: usize,
        metric: Metric,
    ) -> Option<f64> {
        let column = self.metrics.iter().position(|m| *m == metric)?;
        self.rows
            .iter()
            .find(|r| {
                r.method == method
                    && r.configuration == configuration
                    && r.realization == realization
            })
            .map(|r| r.values[column])
    }

    /// Merge per-metric flattened tables on their shared key.
    fn merge(metrics: Vec<Metric>, tables: Vec<Vec<FlatRow<f64>>>) -> Result<Self> {
        let mut tables = tables.into_iter();
        let Some(first) = tables.next() else {
            return Ok(Self {
                metrics,
                rows: Vec::new(),
            });
        };

        let mut rows = first
            .iter()
            .map(|row| {
                let (method, configuration, realization) = record_key(&row.keys)?;
                Ok(PerformanceRecord {
                    method,
                    configuration,
                    realization,
                    values: vec![row.value],
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for (offset, table) in tables.enumerate() {
            let metric = metrics[offset + 1];
            let by_key: BTreeMap<&KeyPath, f64> =
                table.iter().map(|r| (&r.keys, r.value)).collect();
            if by_key.len() != first.len() {
                return Err(VimputeError::StructuralMismatch(format!(
                    "metric '{metric}' has {} rows, expected {}",
                    by_key.len(),
                    first.len()
                )));
            }
            for (record, flat) in rows.iter_mut().zip(&first) {
                let value = by_key.get(&flat.keys).ok_or_else(|| {
                    VimputeError::StructuralMismatch(format!(
                        "metric '{metric}' has no row for '{}'",
                        display_path(&flat.keys)
                    ))
                })?;
                record.values.push(*value);
            }
        }

        Ok(Self { metrics, rows })
    }

    /// Render as a DataFrame: `method`, `configuration`, `realization`, then one
    /// Float64 column per metric. NaN metric values become nulls.
    pub fn to_frame(&self) -> Result<DataFrame> {
        let mut columns: Vec<Column> = vec![
            Column::new(
                "method".into(),
                self.rows.iter().map(|r| r.method.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "configuration".into(),
                self.rows.iter().map(|r| r.configuration as u64).collect::<Vec<_>>(),
            ),
            Column::new(
                "realization".into(),
                self.rows.iter().map(|r| r.realization as u64).collect::<Vec<_>>(),
            ),
        ];
        for (k, metric) in self.metrics.iter().enumerate() {
            let values: Vec<Option<f64>> = self
                .rows
                .iter()
                .map(|r| Some(r.values[k]).filter(|v| !v.is_nan()))
                .collect();
            columns.push(Column::new(metric.name().into(), values));
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Mean and sample standard deviation of every metric, grouped by `by`
    /// (for example `["method"]` or `["method", "configuration"]`).
    pub fn summarize(&self, by: &[&str]) -> Result<DataFrame> {
        let aggregations: Vec<Expr> = self
            .metrics
            .iter()
            .flat_map(|m| {
                [
                    col(m.name()).mean().alias(format!("{}_mean", m.name())),
                    col(m.name()).std(1).alias(format!("{}_sd", m.name())),
                ]
            })
            .collect();
        let keys: Vec<Expr> = by.iter().map(|c| col(*c)).collect();

        Ok(self
            .to_frame()?
            .lazy()
            .group_by_stable(keys)
            .agg(aggregations)
            .collect()?)
    }
}

/// Score every prediction leaf against `outcome`.
///
/// A single-class outcome is a [`VimputeError::DegenerateMetric`]; a leaf
/// whose length differs from the outcome is a structural mismatch.
pub fn score(
    predictions: &PredictionTree,
    outcome: &[bool],
    threshold: f64,
) -> Result<PerformanceTable> {
    check_outcome("all", outcome)?;
    let paths = predictions.path_tree()?;
    let n = outcome.len();

    let mut tables = Vec::with_capacity(Metric::ALL.len());
    for metric in Metric::ALL {
        let values = predictions.try_map_leaves_with_path(
            |p: &Vec<f64>| p.len() == n,
            |_, probabilities| compute_metric(metric, probabilities, outcome, threshold),
        )?;
        tables.push(flatten(&values, &paths)?);
    }

    PerformanceTable::merge(Metric::ALL.to_vec(), tables)
}

/// Per-leaf confusion matrices.
pub fn confusion_tree(
    predictions: &PredictionTree,
    outcome: &[bool],
    threshold: f64,
) -> Result<ExperimentTree<ConfusionMatrix>> {
    check_outcome("confusion", outcome)?;
    predictions.try_map_leaves_with_path(
        |p: &Vec<f64>| p.len() == outcome.len(),
        |_, probabilities| ConfusionMatrix::from_probabilities(probabilities, outcome, threshold),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{EXPERIMENT_DEPTH, experiment_path};

    fn outcome() -> Vec<bool> {
        vec![true, true, false, false, true, false]
    }

    fn predictions() -> PredictionTree {
        ExperimentTree::from_leaves(
            EXPERIMENT_DEPTH,
            vec![
                (experiment_path("knn", 0, 0), vec![0.9, 0.8, 0.2, 0.1, 0.7, 0.3]),
                (experiment_path("knn", 1, 0), vec![0.9, 0.4, 0.6, 0.1, 0.7, 0.3]),
                (experiment_path("mean", 0, 0), vec![0.5, 0.5, 0.5, 0.5, 0.5, 0.5]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_confusion_counts_and_ratios() {
        let m = ConfusionMatrix::from_probabilities(
            &[0.9, 0.4, 0.6, 0.1],
            &[true, true, false, false],
            0.5,
        )
        .unwrap();
        assert_eq!(m.true_positives, 1);
        assert_eq!(m.false_negatives, 1);
        assert_eq!(m.false_positives, 1);
        assert_eq!(m.true_negatives, 1);
        assert_eq!(m.total(), 4);
        assert_eq!(m.sensitivity(), 0.5);
        assert_eq!(m.specificity(), 0.5);
        assert_eq!(m.precision(), 0.5);
        assert_eq!(m.f1(), 0.5);
        assert_eq!(m.mcc(), 0.0);
    }

    #[test]
    fn test_perfect_separation() {
        let m = ConfusionMatrix::from_probabilities(&[0.9, 0.8, 0.1], &[true, true, false], 0.5)
            .unwrap();
        assert_eq!(m.mcc(), 1.0);
        assert_eq!(auc(&[0.9, 0.8, 0.1], &[true, true, false]), 1.0);
    }

    #[test]
    fn test_zero_denominator_is_nan() {
        let m = ConfusionMatrix::from_probabilities(&[0.1, 0.2], &[true, false], 0.5).unwrap();
        assert!(m.precision().is_nan());
        assert!(m.mcc().is_nan());
    }

    #[test]
    fn test_auc_midranks_for_ties() {
        assert_eq!(auc(&[0.5, 0.5, 0.5, 0.5], &[true, false, true, false]), 0.5);
        // one positive tied with one negative: (1 + 0.5) / 2
        assert_eq!(auc(&[0.9, 0.4, 0.4], &[true, true, false]), 0.75);
    }

    #[test]
    fn test_single_class_outcome_is_degenerate() {
        let err = compute_metric(Metric::Auc, &[0.1, 0.9], &[true, true], 0.5).unwrap_err();
        assert_eq!(err.error_code(), "DEGENERATE_METRIC");
        let err = score(&predictions(), &[false; 6], 0.5).unwrap_err();
        assert_eq!(err.error_code(), "DEGENERATE_METRIC");
    }

    #[test]
    fn test_score_builds_one_row_per_leaf() {
        let table = score(&predictions(), &outcome(), 0.5).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.metrics().len(), 7);
        assert_eq!(table.value("knn", 0, 0, Metric::Mcc), Some(1.0));
        assert_eq!(table.value("knn", 0, 0, Metric::Auc), Some(1.0));
        assert!(table.value("mean", 0, 0, Metric::Specificity).unwrap() == 0.0);

        let frame = table.to_frame().unwrap();
        assert_eq!(frame.height(), 3);
        assert_eq!(frame.width(), 10);
    }

    #[test]
    fn test_length_mismatch_is_structural() {
        let err = score(&predictions(), &[true, false], 0.5).unwrap_err();
        assert_eq!(err.error_code(), "STRUCTURAL_MISMATCH");
    }

    #[test]
    fn test_summarize_by_method() {
        let table = score(&predictions(), &outcome(), 0.5).unwrap();
        let summary = table.summarize(&["method"]).unwrap();
        assert_eq!(summary.height(), 2);
        assert!(summary.column("mcc_mean").is_ok());
        assert!(summary.column("auc_sd").is_ok());
    }

    #[test]
    fn test_confusion_tree_sums_to_rows() {
        let tree = confusion_tree(&predictions(), &outcome(), 0.5).unwrap();
        for (_, matrix) in tree.leaves().unwrap() {
            assert_eq!(matrix.total(), 6);
        }
    }
}
