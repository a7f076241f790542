//! Explicit engine configuration; there is no process-wide state.

use crate::demean::CenteringConfig;
use crate::error::EngineResult;
use crate::vcov::SmallSampleCorrection;

/// IRLS / Newton loop settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IrlsConfig {
    /// Relative deviance change below which the fit converged.
    pub tol: f64,
    /// Largest relative coefficient change accepted at convergence.
    pub coef_tol: f64,
    pub max_iter: usize,
    /// Halvings tried when a step increases the deviance.
    pub max_step_halving: usize,
    /// Consecutive non-decreasing iterations before giving up.
    pub max_non_decreasing: usize,
}

impl Default for IrlsConfig {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            coef_tol: 1e-6,
            max_iter: 300,
            max_step_halving: 9,
            max_non_decreasing: 5,
        }
    }
}

/// Gauss-Newton settings for right-hand sides non-linear in parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NonLinearConfig {
    pub tol: f64,
    pub max_iter: usize,
    /// Smallest step fraction tried before the optimization fails.
    pub min_step: f64,
    /// Relative step of the central-difference Jacobian.
    pub jac_step: f64,
}

impl Default for NonLinearConfig {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            max_iter: 100,
            min_step: 1e-8,
            jac_step: 1e-6,
        }
    }
}

/// Everything an estimation needs besides the data and the model.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Worker threads; `None` uses half of the available cores (at least 1).
    pub n_threads: Option<usize>,
    pub centering: CenteringConfig,
    pub irls: IrlsConfig,
    pub nonlinear: NonLinearConfig,
    /// Relative pivot threshold of the collinearity check.
    pub collinearity_tol: f64,
    /// Remove observations alone in their level before estimating.
    pub drop_singletons: bool,
    pub ssc: SmallSampleCorrection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_threads: None,
            centering: CenteringConfig::default(),
            irls: IrlsConfig::default(),
            nonlinear: NonLinearConfig::default(),
            collinearity_tol: 1e-10,
            drop_singletons: false,
            ssc: SmallSampleCorrection::default(),
        }
    }
}

impl EngineConfig {
    pub fn resolved_threads(&self) -> usize {
        self.n_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() / 2)
                .unwrap_or(1)
        })
        .max(1)
    }

    /// Pool every parallel region of one estimation runs in.
    pub fn thread_pool(&self) -> EngineResult<rayon::ThreadPool> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.resolved_threads())
            .build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count_is_at_least_one() {
        let config = EngineConfig {
            n_threads: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(config.resolved_threads(), 1);
        assert!(EngineConfig::default().resolved_threads() >= 1);
        assert_eq!(config.thread_pool().unwrap().current_num_threads(), 1);
    }
}
