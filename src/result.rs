//! Immutable output of an estimation.

use ndarray::{Array1, Array2};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf::erfc;

use crate::error::FitWarning;
use crate::fixef::FixedEffectTable;
use crate::iv::IvDiagnostics;

/// Goodness-of-fit summary.
#[derive(Debug, Clone, PartialEq)]
pub struct FitStatistics {
    pub n_obs: usize,
    /// Kept coefficients plus absorbed fixed-effect parameters.
    pub n_params: usize,
    pub deviance: f64,
    /// Deviance of the intercept-only model (with offset).
    pub null_deviance: f64,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    /// McFadden: `1 − ℓ/ℓ₀`.
    pub pseudo_r2: f64,
    /// Gaussian fits only.
    pub r2: Option<f64>,
    /// Share of the variation left after the fixed effects that the
    /// regressors explain; Gaussian fits with groupings only.
    pub within_r2: Option<f64>,
    /// `Σ w (y − μ)²`.
    pub rss: f64,
    pub dof_residual: usize,
    pub dispersion: f64,
    /// Negative-binomial θ.
    pub theta: Option<f64>,
}

impl FitStatistics {
    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.n_params as f64
    }

    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + (self.n_obs as f64).ln() * self.n_params as f64
    }
}

/// How the outer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceInfo {
    pub converged: bool,
    /// Outer iterations (1 for linear fits).
    pub iterations: usize,
    /// Largest centering iteration count of the final pass.
    pub centering_iterations: usize,
}

/// Result of [`estimate`](crate::estimate).
#[derive(Debug, Clone)]
pub struct FitResult {
    pub family: String,
    pub coef_names: Vec<String>,
    /// One entry per regressor (then per endogenous regressor or non-linear
    /// parameter); collinear columns are NaN.
    pub coefficients: Array1<f64>,
    /// Collinear columns, and non-linear parameters held at a bound (these
    /// keep their value in `coefficients`).
    pub dropped: Vec<usize>,
    /// Aligned with `coefficients`; rows and columns of dropped entries are NaN.
    pub vcov: Array2<f64>,
    pub vcov_type: &'static str,
    /// Degrees of freedom of t statistics; infinite for normal inference.
    pub df_t: f64,
    pub fixed_effects: Vec<FixedEffectTable>,
    pub statistics: FitStatistics,
    pub convergence: ConvergenceInfo,
    pub warnings: Vec<FitWarning>,
    /// Mean response μ.
    pub fitted: Array1<f64>,
    /// Response residuals `y − μ`.
    pub residuals: Array1<f64>,
    /// η, offset included.
    pub linear_predictor: Array1<f64>,
    pub iv: Option<IvDiagnostics>,
    /// Observations used, relative to the design passed in; `None` when all
    /// were used.
    pub obs_mask: Option<Vec<bool>>,
}

impl FitResult {
    pub fn coef(&self, name: &str) -> Option<f64> {
        self.coef_names
            .iter()
            .position(|n| n == name)
            .map(|j| self.coefficients[j])
    }

    pub fn fixed_effect(&self, name: &str) -> Option<&FixedEffectTable> {
        self.fixed_effects.iter().find(|t| t.name == name)
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.vcov.diag().mapv(f64::sqrt)
    }

    pub fn t_stats(&self) -> Array1<f64> {
        &self.coefficients / &self.standard_errors()
    }

    /// Two-sided p-values: Student t with `df_t` degrees of freedom, normal
    /// when `df_t` is infinite.
    pub fn p_values(&self) -> Array1<f64> {
        let t = self.t_stats();
        if self.df_t.is_finite() {
            match StudentsT::new(0.0, 1.0, self.df_t) {
                Ok(dist) => t.mapv(|v| 2.0 * dist.sf(v.abs())),
                Err(_) => Array1::from_elem(t.len(), f64::NAN),
            }
        } else {
            t.mapv(|v| erfc(v.abs() / std::f64::consts::SQRT_2))
        }
    }

    pub fn has_warning(&self, predicate: impl Fn(&FitWarning) -> bool) -> bool {
        self.warnings.iter().any(predicate)
    }
}
