//! Error types for the nested imputation experiment engine.
//!
//! This module provides the error hierarchy using `thiserror`. Leaf-level
//! failures ([`VimputeError::ConvergenceFailure`]) are recovered locally by the
//! engine and reported as warnings; every other variant propagates to the caller.
//!
//! Errors are serializable so that they can be stored next to persisted
//! experiment state or forwarded to a reporting layer.

use serde::Serialize;
use serde::ser::SerializeStruct;
use thiserror::Error;

/// The main error type for the experiment engine.
#[derive(Error, Debug)]
pub enum VimputeError {
    /// An imputation or classifier fit did not complete.
    #[error("Convergence failure for method '{method}' (configuration {configuration}): {reason}")]
    ConvergenceFailure {
        method: String,
        configuration: usize,
        reason: String,
    },

    /// Every configuration of a method failed.
    #[error("Method '{0}' exhausted: every configuration failed")]
    MethodExhausted(String),

    /// A performance metric was requested against a degenerate outcome set.
    #[error("Degenerate metric '{metric}': {reason}")]
    DegenerateMetric { metric: String, reason: String },

    /// Parallel experiment trees diverge in path shape.
    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid data provided for training, replay or scoring.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// No imputation method is registered under this name.
    #[error("Unknown imputation method '{0}'")]
    UnknownMethod(String),

    /// Column was not found in the dataset.
    #[error("Column '{0}' not found in dataset")]
    ColumnNotFound(String),

    /// Internal error (e.g., worker pool construction failure).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Polars error wrapper.
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<VimputeError>,
    },
}

impl VimputeError {
    /// Shorthand for a [`VimputeError::ConvergenceFailure`].
    pub fn convergence(method: &str, configuration: usize, reason: impl Into<String>) -> Self {
        Self::ConvergenceFailure {
            method: method.to_string(),
            configuration,
            reason: reason.into(),
        }
    }

    /// Add context to an error.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        VimputeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Get a stable error code for downstream handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConvergenceFailure { .. } => "CONVERGENCE_FAILURE",
            Self::MethodExhausted(_) => "METHOD_EXHAUSTED",
            Self::DegenerateMetric { .. } => "DEGENERATE_METRIC",
            Self::StructuralMismatch(_) => "STRUCTURAL_MISMATCH",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidData(_) => "INVALID_DATA",
            Self::UnknownMethod(_) => "UNKNOWN_METHOD",
            Self::ColumnNotFound(_) => "COLUMN_NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Polars(_) => "POLARS_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    /// Check if this error is a leaf-level failure that the engine isolates
    /// (nulls the leaf and continues) instead of propagating.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConvergenceFailure { .. } => true,
            Self::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

impl Serialize for VimputeError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("VimputeError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias for experiment operations.
pub type Result<T> = std::result::Result<T, VimputeError>;

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, polars::error::PolarsError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| VimputeError::Polars(e).with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(
            VimputeError::MethodExhausted("svd".to_string()).error_code(),
            "METHOD_EXHAUSTED"
        );
        assert_eq!(
            VimputeError::convergence("mice", 2, "singular").error_code(),
            "CONVERGENCE_FAILURE"
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(VimputeError::convergence("knn", 0, "x").is_recoverable());
        assert!(
            VimputeError::convergence("knn", 0, "x")
                .with_context("training")
                .is_recoverable()
        );
        assert!(!VimputeError::StructuralMismatch("x".to_string()).is_recoverable());
        assert!(
            !VimputeError::DegenerateMetric {
                metric: "auc".to_string(),
                reason: "one class".to_string()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_error_serialization() {
        let error = VimputeError::ColumnNotFound("cadd_phred".to_string());
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("COLUMN_NOT_FOUND"));
        assert!(json.contains("cadd_phred"));
    }

    #[test]
    fn test_with_context() {
        let error =
            VimputeError::UnknownMethod("amelia".to_string()).with_context("During training");
        assert!(error.to_string().contains("During training"));
        assert_eq!(error.error_code(), "UNKNOWN_METHOD");
    }
}
