//! Binomial logistic regression fit by iteratively reweighted least squares.

use crate::config::LogisticSettings;
use crate::utils::solve_linear_system;
use ndarray::{Array1, Array2, Axis, concatenate};
use serde::{Deserialize, Serialize};

const PROB_FLOOR: f64 = 1e-10;

/// Logistic regression for binary classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Fitted intercept
    pub intercept: f64,
    /// Fitted coefficients, one per feature
    pub coefficients: Array1<f64>,
    /// IRLS iterations used
    pub iterations: usize,
}

/// Sigmoid function
fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn deviance(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    -2.0 * y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            let m = mi.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
            yi * m.ln() + (1.0 - yi) * (1.0 - m).ln()
        })
        .sum::<f64>()
}

impl LogisticRegression {
    /// Fit by Newton-Raphson (IRLS). Converges when the relative deviance change
    /// drops below `settings.tolerance`; fails on a singular Hessian, non-finite
    /// coefficients or when `settings.max_iter` is reached.
    pub fn fit(
        x: &Array2<f64>,
        y: &Array1<f64>,
        settings: &LogisticSettings,
    ) -> std::result::Result<Self, String> {
        let n_samples = x.nrows();
        let width = x.ncols() + 1;
        let design = concatenate(Axis(1), &[Array2::ones((n_samples, 1)).view(), x.view()])
            .map_err(|e| format!("design matrix: {e}"))?;

        let mut beta: Array1<f64> = Array1::zeros(width);
        let mut mu = design.dot(&beta).mapv(sigmoid);
        let mut dev_old = deviance(y, &mu);

        for iteration in 1..=settings.max_iter {
            let weights = mu.mapv(|m| (m * (1.0 - m)).max(PROB_FLOOR));
            let weighted = &design * &weights.view().insert_axis(Axis(1));

            let mut hessian = design.t().dot(&weighted);
            let mut gradient = design.t().dot(&(y - &mu));
            for c in 1..width {
                hessian[[c, c]] += settings.ridge;
                gradient[c] -= settings.ridge * beta[c];
            }

            let step = solve_linear_system(hessian, gradient)
                .ok_or_else(|| format!("singular Hessian at iteration {iteration}"))?;
            beta += &step;
            if beta.iter().any(|b| !b.is_finite()) {
                return Err(format!("non-finite coefficients at iteration {iteration}"));
            }

            mu = design.dot(&beta).mapv(sigmoid);
            let dev = deviance(y, &mu);
            if (dev - dev_old).abs() / (dev.abs() + 0.1) < settings.tolerance {
                return Ok(Self {
                    intercept: beta[0],
                    coefficients: beta.slice(ndarray::s![1..]).to_owned(),
                    iterations: iteration,
                });
            }
            dev_old = dev;
        }

        Err(format!(
            "no convergence after {} iterations",
            settings.max_iter
        ))
    }

    /// Predict probabilities
    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        (x.dot(&self.coefficients) + self.intercept).mapv(sigmoid)
    }
}
