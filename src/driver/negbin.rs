//! Negative binomial with θ estimated by maximum likelihood.
//!
//! IRLS for the coefficients at fixed θ alternates with Newton steps on the
//! profile log-likelihood of θ at fixed μ until θ stops moving.

use ndarray::Array1;
use statrs::function::gamma::digamma;

use super::{irls, CoreFit};
use crate::config::EngineConfig;
use crate::design::Design;
use crate::error::{DivergenceReason, EngineError, EngineResult, FitWarning, IterationDiagnostics};
use crate::family::Family;

const MAX_ALTERNATIONS: usize = 50;
const MAX_NEWTON_STEPS: usize = 25;
const THETA_MIN: f64 = 0.01;
const THETA_MAX: f64 = 1e8;

pub(crate) fn fit(
    design: &Design,
    family: &Family,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    let y = design.y().to_vec();
    let prior = design.weight_slice();
    let tol = config.irls.coef_tol;

    let mut round_warnings = Vec::new();
    let poisson = irls::run(design, &Family::Poisson, config, None, &mut round_warnings)?;
    let mut theta = theta_moments(&y, &poisson.mu.to_vec()).clamp(0.1, 1e6);
    let mut eta: Array1<f64> = poisson.eta;
    let mut iterations = poisson.iterations;

    for round in 1..=MAX_ALTERNATIONS {
        round_warnings.clear();
        let pinned = family.with_theta(theta);
        let mut core = irls::run(design, &pinned, config, Some(&eta), &mut round_warnings)?;
        iterations += core.iterations;

        let next = theta_newton(&y, &core.mu.to_vec(), prior, theta, tol);
        log::debug!("negbin round {round}: theta {theta:.6} -> {next:.6}, deviance {:.10e}", core.deviance);

        if (next - theta).abs() < tol * theta.max(1.0) {
            warnings.append(&mut round_warnings);
            core.iterations = iterations;
            return Ok(core);
        }
        theta = next;
        eta = core.eta;
    }

    log::warn!("negbin: theta did not settle within {MAX_ALTERNATIONS} rounds");
    Err(EngineError::Diverged {
        reason: DivergenceReason::IterationCap,
        diagnostics: IterationDiagnostics {
            iterations,
            last_deviance: f64::NAN,
            last_coefficients: vec![theta],
        },
    })
}

/// Method-of-moments θ from `Var(y) = μ + μ²/θ`.
fn theta_moments(y: &[f64], mu: &[f64]) -> f64 {
    let (num, den) = y.iter().zip(mu).fold((0.0, 0.0), |(num, den), (&yi, &mi)| {
        (num + mi * mi, den + (yi - mi).powi(2) - mi)
    });
    if den > 0.0 {
        num / den
    } else {
        THETA_MAX
    }
}

/// Profile score `∂ℓ/∂θ` and its derivative at fixed μ.
fn theta_score(y: &[f64], mu: &[f64], weights: Option<&[f64]>, theta: f64) -> (f64, f64) {
    let mut score = 0.0;
    let mut slope = 0.0;
    for (i, (&yi, &mi)) in y.iter().zip(mu).enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        let t_mu = theta + mi;
        score += w
            * (digamma(yi + theta) - digamma(theta) + theta.ln() + 1.0 - t_mu.ln() - (yi + theta) / t_mu);
        slope += w
            * (trigamma(yi + theta) - trigamma(theta) + 1.0 / theta - 2.0 / t_mu
                + (yi + theta) / (t_mu * t_mu));
    }
    (score, slope)
}

fn theta_newton(y: &[f64], mu: &[f64], weights: Option<&[f64]>, start: f64, tol: f64) -> f64 {
    let mut theta = start;
    for _ in 0..MAX_NEWTON_STEPS {
        let (score, slope) = theta_score(y, mu, weights, theta);
        let step = if slope < 0.0 {
            -score / slope
        } else if score > 0.0 {
            theta
        } else {
            -0.5 * theta
        };
        let next = (theta + step).clamp(THETA_MIN, THETA_MAX);
        if (next - theta).abs() < tol * theta.max(1.0) {
            return next;
        }
        theta = next;
    }
    theta
}

/// ψ'(x) for x > 0: recurrence up to 6, then the asymptotic series.
fn trigamma(mut x: f64) -> f64 {
    let mut acc = 0.0;
    while x < 10.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    acc + inv + 0.5 * inv2
        + inv * inv2 * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 / 30.0)))
}
