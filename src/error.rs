//! Error and warning types shared by the engine.
//!
//! Fatal conditions are [`EngineError`] values: they make the coefficient
//! vector meaningless and abort the estimation. Recoverable conditions are
//! [`FitWarning`] values accumulated next to a valid [`FitResult`](crate::FitResult).

use std::fmt;
use thiserror::Error;

use crate::collinear::CollinearityError;

/// Crate-wide result alias.
pub type EngineResult<T> = Result<T, EngineError>;

/// Why an iterative fit was declared divergent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceReason {
    /// The deviance did not decrease for too many consecutive iterations.
    DevianceNotDecreasing,
    /// The iteration cap was reached before convergence.
    IterationCap,
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DivergenceReason::DevianceNotDecreasing => {
                write!(f, "deviance failed to decrease")
            }
            DivergenceReason::IterationCap => write!(f, "iteration cap reached"),
        }
    }
}

/// State of the optimizer at the last completed iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationDiagnostics {
    pub iterations: usize,
    pub last_deviance: f64,
    pub last_coefficients: Vec<f64>,
}

/// Fatal estimation errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid design: {0}")]
    InvalidDesign(String),

    #[error("grouping '{name}' has a single level and carries no information")]
    DegenerateGrouping { name: String },

    #[error("all {n_columns} regressors are collinear")]
    AllCollinear { n_columns: usize },

    #[error("non-finite {quantity} at iteration {iteration}")]
    NonFiniteValue {
        quantity: &'static str,
        iteration: usize,
    },

    #[error(
        "estimation diverged after {iterations} iterations: {reason}",
        iterations = .diagnostics.iterations
    )]
    Diverged {
        reason: DivergenceReason,
        diagnostics: IterationDiagnostics,
    },

    #[error("optimization failed: {reason}")]
    OptimizationFailed {
        reason: String,
        diagnostics: IterationDiagnostics,
    },

    #[error("matrix is not positive definite")]
    NotPositiveDefinite,

    #[error(transparent)]
    Collinearity(#[from] CollinearityError),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Recoverable conditions reported alongside a valid result.
#[derive(Debug, Clone, PartialEq)]
pub enum FitWarning {
    /// A regressor was linearly dependent on others (or on the fixed effects)
    /// and has been dropped.
    CollinearRegressor { name: String, column: usize },
    /// Centering hit its iteration cap for some columns.
    SlowConvergence {
        stage: &'static str,
        unconverged_columns: usize,
        max_iterations: usize,
    },
    /// Fixed-effect levels are not comparable across groupings.
    UnderidentifiedFixedEffects {
        groupings: Vec<String>,
        components: usize,
    },
    /// A grouping with a single level was dropped before centering.
    DegenerateGrouping { name: String },
    /// Observations alone in their level were removed.
    SingletonsRemoved { count: usize },
    /// Multi-way clustering produced a covariance with a negative variance.
    NonPsdCovariance,
    /// A non-linear parameter ended on one of its bounds; it is held fixed
    /// there and carries no covariance.
    ParameterAtBound { name: String, value: f64 },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::CollinearRegressor { name, column } => {
                write!(f, "regressor '{name}' (column {column}) is collinear and was dropped")
            }
            FitWarning::SlowConvergence {
                stage,
                unconverged_columns,
                max_iterations,
            } => write!(
                f,
                "{stage}: centering of {unconverged_columns} column(s) did not converge within {max_iterations} iterations"
            ),
            FitWarning::UnderidentifiedFixedEffects {
                groupings,
                components,
            } => write!(
                f,
                "fixed effects [{}] are not identified by one reference per grouping ({components} connected components)",
                groupings.join(", ")
            ),
            FitWarning::DegenerateGrouping { name } => {
                write!(f, "grouping '{name}' has a single level and was dropped")
            }
            FitWarning::SingletonsRemoved { count } => {
                write!(f, "{count} singleton observation(s) removed")
            }
            FitWarning::NonPsdCovariance => {
                write!(f, "covariance matrix is not positive semi-definite")
            }
            FitWarning::ParameterAtBound { name, value } => {
                write!(f, "parameter '{name}' is held at its bound {value}")
            }
        }
    }
}
