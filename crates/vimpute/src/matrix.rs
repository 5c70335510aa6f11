//! Dense feature matrix used by every adapter and classifier.
//!
//! The public API accepts a Polars [`DataFrame`]; internally all numeric work
//! runs on an `ndarray` matrix where a missing cell is `NaN`.

use crate::error::{Result, ResultExt, VimputeError};
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Named column-major view of a feature-engineered dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    names: Vec<String>,
    values: Array2<f64>,
}

fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
    )
}

impl FeatureMatrix {
    /// Build a matrix from column names and values. Shapes must agree.
    pub fn new(names: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if names.len() != values.ncols() {
            return Err(VimputeError::InvalidData(format!(
                "{} column names for a matrix with {} columns",
                names.len(),
                values.ncols()
            )));
        }
        Ok(Self { names, values })
    }

    /// Convert a DataFrame into a feature matrix. Nulls and NaNs become missing cells.
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        let n_rows = df.height();
        let n_cols = df.width();
        let mut values = Array2::from_elem((n_rows, n_cols), f64::NAN);
        let mut names = Vec::with_capacity(n_cols);

        for (col_idx, column) in df.get_columns().iter().enumerate() {
            let name = column.name().to_string();
            if !is_numeric_dtype(column.dtype()) {
                return Err(VimputeError::InvalidData(format!(
                    "column '{}' has non-numeric type {}",
                    name,
                    column.dtype()
                )));
            }

            let series = column
                .as_materialized_series()
                .cast(&DataType::Float64)
                .context(format!("casting column '{name}'"))?;
            let chunked = series.f64()?;
            for (row_idx, value) in chunked.iter().enumerate() {
                if let Some(v) = value {
                    values[[row_idx, col_idx]] = v;
                }
            }
            names.push(name);
        }

        Ok(Self { names, values })
    }

    /// Convert only `columns` of a DataFrame, in the given order. Other columns
    /// are never read, so they may hold any type.
    pub fn from_frame_columns(df: &DataFrame, columns: &[String]) -> Result<Self> {
        let selected = columns
            .iter()
            .map(|name| {
                df.column(name)
                    .cloned()
                    .map_err(|_| VimputeError::ColumnNotFound(name.clone()))
            })
            .collect::<Result<Vec<Column>>>()?;
        Self::from_frame(&DataFrame::new(selected)?)
    }

    /// Render the matrix as a DataFrame; missing cells become nulls.
    pub fn to_frame(&self) -> Result<DataFrame> {
        let columns: Vec<Column> = self
            .names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let col: Vec<Option<f64>> = self
                    .values
                    .column(j)
                    .iter()
                    .map(|&v| if v.is_nan() { None } else { Some(v) })
                    .collect();
                Column::from(Series::new(name.as_str().into(), col))
            })
            .collect();
        Ok(DataFrame::new(columns)?)
    }

    /// Restrict to the given columns, in the given order.
    pub fn select(&self, columns: &[String]) -> Result<Self> {
        let indices = columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            names: columns.to_vec(),
            values: self.values.select(Axis(1), &indices),
        })
    }

    /// Position of a named column.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| VimputeError::ColumnNotFound(name.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// `true` where the cell is missing.
    pub fn missing_mask(&self) -> Array2<bool> {
        self.values.mapv(f64::is_nan)
    }

    /// Number of missing cells in a column.
    pub fn missing_in_column(&self, col: usize) -> usize {
        self.values.column(col).iter().filter(|v| v.is_nan()).count()
    }

    /// `true` when no cell is missing.
    pub fn is_complete(&self) -> bool {
        !self.values.iter().any(|v| v.is_nan())
    }

    /// Observed (non-missing) values of a column, in row order.
    pub fn observed(&self, col: usize) -> Vec<f64> {
        self.values
            .column(col)
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .collect()
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Array2<f64>) {
        (self.names, self.values)
    }
}

/// Convert a boolean outcome into the 0/1 vector the classifiers fit against.
pub fn outcome_vector(outcome: &[bool]) -> Array1<f64> {
    outcome.iter().map(|&y| if y { 1.0 } else { 0.0 }).collect()
}
