//! Iteratively reweighted least squares around the centering engine.
//!
//! Each iteration moves through the stages
//! `Reweight → Center → Solve → CheckConvergence`:
//!
//! - working response `z = η − offset + (y − μ)/μ'(η)`, working weights
//!   `w = prior · μ'(η)² / V(μ)`
//! - `[z | X]` is centered under `w` and solved by weighted least squares
//! - the new linear predictor is `η = z − r + offset`, `r` the centered
//!   working residual
//! - a step that raises the deviance is halved up to `max_step_halving` times

use ndarray::{Array1, Axis};

use super::{
    center_block, ensure_finite, reference_scale, report_collinear, report_slow_convergence,
    split_leading, with_leading_column, Centered, CoreFit,
};
use crate::config::EngineConfig;
use crate::design::Design;
use crate::error::{DivergenceReason, EngineError, EngineResult, FitWarning, IterationDiagnostics};
use crate::family::Family;
use crate::wls::{self, WlsSolution};

/// Outcome of the `CheckConvergence` stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Reweight,
    Converged,
    Diverged(DivergenceReason),
}

/// Values carried from one iteration to the next.
struct FitState {
    eta: Array1<f64>,
    mu: Array1<f64>,
    deviance: f64,
    coefficients: Array1<f64>,
}

impl FitState {
    fn diagnostics(&self, iterations: usize) -> IterationDiagnostics {
        IterationDiagnostics {
            iterations,
            last_deviance: self.deviance,
            last_coefficients: self.coefficients.to_vec(),
        }
    }
}

pub(crate) fn fit(
    design: &Design,
    family: &Family,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    run(design, family, config, None, warnings)
}

/// IRLS from `start_eta`, or from the family's starting means.
pub(crate) fn run(
    design: &Design,
    family: &Family,
    config: &EngineConfig,
    start_eta: Option<&Array1<f64>>,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    let settings = &config.irls;
    let y = design.y().to_vec();
    let prior = design.weight_slice();

    // Init
    let eta = match start_eta {
        Some(eta) => eta.clone(),
        None => design.y().mapv(|yi| family.link(family.initial_mu(yi))),
    };
    ensure_finite("linear predictor", eta.iter(), 0)?;
    let mu = eta.mapv(|e| family.link_inverse(e));
    let deviance = family.deviance(&y, &mu.to_vec(), prior);
    ensure_finite("deviance", std::iter::once(&deviance), 0)?;

    let mut state = FitState {
        eta,
        mu,
        deviance,
        coefficients: Array1::from_elem(design.n_regressors(), f64::NAN),
    };
    let mut non_decreasing = 0usize;

    for iteration in 1..=settings.max_iter {
        // Reweight
        let (z, w) = working_values(design, family, &state);
        ensure_finite("working response", z.iter(), iteration)?;
        ensure_finite("working weights", w.iter(), iteration)?;

        // Center
        let block = with_leading_column(&z, design.x().view());
        let centered = center_block(design, block.view(), Some(&w), config)?;

        // Solve
        let (z_tilde, x_tilde) = split_leading(&centered.values);
        let scale = reference_scale(design.x().view(), Some(&w));
        let solution = wls::solve(x_tilde, z_tilde.view(), Some(&w), Some(&scale), config.collinearity_tol)?;

        let offset = Array1::from_shape_fn(design.n_obs(), |i| design.offset_at(i));
        let mut eta_new = &z - &solution.residuals + &offset;
        let mut coef_new = solution.coefficients.clone();
        ensure_finite("linear predictor", eta_new.iter(), iteration)?;
        let mut mu_new = eta_new.mapv(|e| family.link_inverse(e));
        let mut dev_new = family.deviance(&y, &mu_new.to_vec(), prior);
        ensure_finite("deviance", std::iter::once(&dev_new), iteration)?;

        // The starting means sit close to the data, so the first fitted
        // deviance is not comparable to the starting one.
        let mut halvings = 0;
        while iteration > 1
            && increased(dev_new, state.deviance, settings.tol)
            && halvings < settings.max_step_halving
        {
            eta_new = (&eta_new + &state.eta) * 0.5;
            coef_new = (&coef_new + &state.coefficients) * 0.5;
            mu_new = eta_new.mapv(|e| family.link_inverse(e));
            dev_new = family.deviance(&y, &mu_new.to_vec(), prior);
            ensure_finite("deviance", std::iter::once(&dev_new), iteration)?;
            halvings += 1;
        }
        if halvings > 0 {
            log::debug!("irls iteration {iteration}: step halved {halvings} time(s)");
        }

        // CheckConvergence
        let dev_change = (dev_new - state.deviance).abs() / (0.1 + dev_new.abs());
        let coef_change = max_relative_change(&coef_new, &state.coefficients);
        if iteration > 1 && increased(dev_new, state.deviance, settings.tol) {
            non_decreasing += 1;
        } else {
            non_decreasing = 0;
        }
        log::debug!(
            "irls iteration {iteration}: deviance {dev_new:.10e}, relative change {dev_change:.3e}, coefficient change {coef_change:.3e}"
        );

        let step = if iteration > 1 && dev_change < settings.tol && coef_change < settings.coef_tol {
            Step::Converged
        } else if non_decreasing >= settings.max_non_decreasing {
            Step::Diverged(DivergenceReason::DevianceNotDecreasing)
        } else {
            Step::Reweight
        };

        state = FitState {
            eta: eta_new,
            mu: mu_new,
            deviance: dev_new,
            coefficients: coef_new,
        };

        match step {
            Step::Reweight => continue,
            Step::Converged => {
                report_slow_convergence("irls", &centered, config, warnings);
                report_collinear(design.x_names(), &solution.dropped, warnings);
                return Ok(into_core(design, family, state, solution, centered, w, iteration));
            }
            Step::Diverged(reason) => {
                log::warn!("irls diverged after {iteration} iterations: {reason}");
                return Err(EngineError::Diverged {
                    reason,
                    diagnostics: state.diagnostics(iteration),
                });
            }
        }
    }

    log::warn!("irls reached the iteration cap ({})", settings.max_iter);
    Err(EngineError::Diverged {
        reason: DivergenceReason::IterationCap,
        diagnostics: state.diagnostics(settings.max_iter),
    })
}

fn working_values(design: &Design, family: &Family, state: &FitState) -> (Array1<f64>, Vec<f64>) {
    let y = design.y();
    let n = design.n_obs();
    let mut z = Array1::<f64>::zeros(n);
    let mut w = vec![0.0; n];
    for i in 0..n {
        let eta = state.eta[i];
        let mu = state.mu[i];
        let d = family.mu_eta(eta);
        let prior = design.weights().map_or(1.0, |p| p[i]);
        z[i] = eta - design.offset_at(i) + (y[i] - mu) / d;
        w[i] = prior * d * d / family.variance(mu);
    }
    (z, w)
}

#[inline]
fn increased(new: f64, old: f64, tol: f64) -> bool {
    new - old > tol * (0.1 + new.abs())
}

/// Largest `|a − b| / (0.1 + |b|)` over entries present in both; infinite
/// before the first solve.
fn max_relative_change(new: &Array1<f64>, old: &Array1<f64>) -> f64 {
    new.iter()
        .zip(old)
        .filter(|(a, _)| !a.is_nan())
        .map(|(&a, &b)| {
            if b.is_nan() {
                f64::INFINITY
            } else {
                (a - b).abs() / (0.1 + b.abs())
            }
        })
        .fold(0.0, f64::max)
}

fn into_core(
    design: &Design,
    family: &Family,
    state: FitState,
    solution: WlsSolution,
    centered: Centered,
    weights: Vec<f64>,
    iterations: usize,
) -> CoreFit {
    let x_centered = centered.values.slice(ndarray::s![.., 1..]).select(Axis(1), &solution.kept);
    CoreFit {
        names: design.x_names().to_vec(),
        coefficients: state.coefficients,
        dropped: solution.dropped,
        regressors: design.x().clone(),
        x_centered,
        bread: solution.xtwx_inv,
        working_residuals: solution.residuals,
        working_weights: Some(weights),
        eta: state.eta,
        mu: state.mu,
        deviance: state.deviance,
        family: family.clone(),
        ctx: centered.ctx,
        converged: true,
        iterations,
        centering_iterations: centered.max_iterations,
        within_ss: None,
        extra_offset: None,
        iv: None,
    }
}
