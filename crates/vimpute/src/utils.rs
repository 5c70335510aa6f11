//! Shared utilities for the experiment engine.
//!
//! Seed derivation, small numeric reductions, the dense linear solver used
//! across adapters and classifiers, and serde helpers for missing values.

use ndarray::{Array1, Array2};

// =============================================================================
// Seed Derivation
// =============================================================================

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn absorb(state: u64, word: u64) -> u64 {
    splitmix64(state.wrapping_add(GOLDEN_GAMMA) ^ word)
}

/// Derive a unit seed from the global seed, a method name and a sequence of
/// indices (configuration, then realization or tree).
///
/// The fold depends only on its inputs, never on scheduling, so each parallel
/// unit draws from its own stream.
pub fn derive_seed(global: u64, method: &str, indices: &[usize]) -> u64 {
    let mut state = splitmix64(global);
    for byte in method.as_bytes() {
        state = absorb(state, u64::from(*byte));
    }
    // separator so ("ab", [1]) and ("a", [b, 1]) cannot collide
    state = absorb(state, u64::MAX);
    for &index in indices {
        state = absorb(state, index as u64);
    }
    state
}

/// Derive a child seed from a unit seed and an index.
#[inline]
pub fn child_seed(seed: u64, index: usize) -> u64 {
    absorb(seed, index as u64)
}

// =============================================================================
// Numeric Reductions
// =============================================================================

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Median, averaging the two middle values for even lengths.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Minimum and maximum; `None` for an empty slice.
pub fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    let first = *values.first()?;
    Some(
        values
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
    )
}

// =============================================================================
// Linear Algebra
// =============================================================================

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when `a` is not square or is singular to working precision.
pub fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return None;
    }
    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let eps = scale * 1e-12;

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() < eps {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
            }
            b.swap(pivot, col);
        }
        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    x.iter().all(|v: &f64| v.is_finite()).then_some(x)
}

// =============================================================================
// Serde Helpers
// =============================================================================

/// JSON has no NaN; missing values are written as `null` and read back as NaN.
pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        (!value.is_nan()).then_some(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// [`nan_as_null`] applied cell by cell to a matrix.
pub mod nan_matrix_as_null {
    use ndarray::Array2;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(rows: &Array2<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        rows.mapv(|v| (!v.is_nan()).then_some(v)).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Array2<f64>, D::Error> {
        let cells = Array2::<Option<f64>>::deserialize(deserializer)?;
        Ok(cells.mapv(|v| v.unwrap_or(f64::NAN)))
    }
}
