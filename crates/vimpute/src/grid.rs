//! Hyperparameter grid expansion.
//!
//! Each imputation method declares an ordered list of parameters, each with an
//! ordered list of candidate values. Expansion produces the full cartesian
//! product as [`Configuration`] rows. Row `i` always denotes the same
//! combination for the same input lists: the first declared parameter varies
//! fastest, the last slowest.

use crate::error::{Result, VimputeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Ordered parameter name -> candidate list mapping for one method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    params: Vec<(String, Vec<ParamValue>)>,
}

impl ParamGrid {
    /// An empty grid; expands to a single empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter with its candidate values. Re-declaring a name replaces
    /// its candidates in place.
    pub fn param<V: Into<ParamValue>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let name = name.into();
        let values: Vec<ParamValue> = values.into_iter().map(Into::into).collect();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = values,
            None => self.params.push((name, values)),
        }
        self
    }

    /// Number of configurations the grid expands to.
    pub fn size(&self) -> usize {
        self.params.iter().map(|(_, v)| v.len()).product()
    }

    /// Expand into ordered configuration rows for `method`.
    pub fn expand(&self, method: &str) -> Result<Vec<Configuration>> {
        if let Some((name, _)) = self.params.iter().find(|(_, v)| v.is_empty()) {
            return Err(VimputeError::InvalidConfig(format!(
                "parameter '{name}' of method '{method}' has no candidate values"
            )));
        }

        let total = self.size();
        let mut rows = Vec::with_capacity(total);
        let mut digits = vec![0usize; self.params.len()];

        for index in 0..total {
            let params = self
                .params
                .iter()
                .zip(&digits)
                .map(|((name, values), &d)| (name.clone(), values[d].clone()))
                .collect();
            rows.push(Configuration {
                method: method.to_string(),
                index,
                params,
            });

            // odometer increment, first parameter fastest
            for (digit, (_, values)) in digits.iter_mut().zip(&self.params) {
                *digit += 1;
                if *digit < values.len() {
                    break;
                }
                *digit = 0;
            }
        }

        Ok(rows)
    }
}

/// One row of a method's expanded grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub method: String,
    pub index: usize,
    pub params: Vec<(String, ParamValue)>,
}

impl Configuration {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Integer parameter as `usize`. Absent parameters yield `Ok(None)`.
    pub fn get_usize(&self, name: &str) -> Result<Option<usize>> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Int(v)) if *v >= 0 => Ok(Some(*v as usize)),
            Some(ParamValue::Float(v)) if *v >= 0.0 && v.fract() == 0.0 => Ok(Some(*v as usize)),
            Some(other) => Err(self.type_error(name, "a non-negative integer", other)),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Int(v)) => Ok(Some(*v as f64)),
            Some(ParamValue::Float(v)) => Ok(Some(*v)),
            Some(other) => Err(self.type_error(name, "a number", other)),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Text(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(self.type_error(name, "text", other)),
        }
    }

    fn type_error(&self, name: &str, expected: &str, got: &ParamValue) -> VimputeError {
        VimputeError::InvalidConfig(format!(
            "parameter '{name}' of method '{}' must be {expected}, got {got}",
            self.method
        ))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.method, self.index)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

/// Ordered method -> grid registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridRegistry {
    grids: Vec<(String, ParamGrid)>,
}

impl GridRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a grid for a method. Registering a method twice replaces its grid
    /// without changing its position.
    pub fn method(mut self, name: impl Into<String>, grid: ParamGrid) -> Self {
        let name = name.into();
        match self.grids.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = grid,
            None => self.grids.push((name, grid)),
        }
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.grids.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    /// Expand every grid, keeping registration order.
    pub fn expand_all(&self) -> Result<Vec<(String, Vec<Configuration>)>> {
        self.grids
            .iter()
            .map(|(name, grid)| Ok((name.clone(), grid.expand(name)?)))
            .collect()
    }
}
