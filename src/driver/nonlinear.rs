//! Right-hand sides with a part non-linear in its parameters.
//!
//! The model is `g(μ) = Xβ + f(θ) + fixed effects + offset`. Each outer step
//! linearizes `f` around the current θ, fits the linear/GLM core with the
//! Jacobian columns appended (and `f(θ) − Jθ` folded into the offset), and
//! moves θ along the resulting Gauss-Newton direction. Trial points are
//! projected onto the bounds, and the step is halved while it fails to lower
//! the profile deviance. Parameters that end on a bound are held fixed there
//! in the final fit.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};

use super::{irls, linear, CoreFit};
use crate::config::EngineConfig;
use crate::demean::hstack;
use crate::design::Design;
use crate::error::{DivergenceReason, EngineError, EngineResult, FitWarning, IterationDiagnostics};
use crate::family::Family;

/// Non-linear component `f(θ)` of the linear predictor.
pub trait NonLinearPart: Send + Sync {
    fn n_params(&self) -> usize;

    fn names(&self) -> Vec<String>;

    /// `f(θ)` for every observation of the design passed to
    /// [`estimate`](crate::estimate), before any singleton removal.
    fn evaluate(&self, params: &[f64], out: &mut [f64]);

    /// Fill `out` (observations × parameters) with `∂f/∂θ` and return `true`,
    /// or return `false` to use central differences.
    fn jacobian(&self, _params: &[f64], _out: &mut Array2<f64>) -> bool {
        false
    }
}

/// Non-linear part with start values and box constraints.
#[derive(Clone)]
pub struct NonLinearSpec {
    pub part: Arc<dyn NonLinearPart>,
    pub start: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl fmt::Debug for NonLinearSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonLinearSpec")
            .field("params", &self.part.names())
            .field("start", &self.start)
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .finish()
    }
}

impl NonLinearSpec {
    /// Unbounded parameters.
    pub fn new(part: Arc<dyn NonLinearPart>, start: Vec<f64>) -> Self {
        let p = start.len();
        Self {
            part,
            start,
            lower: vec![f64::NEG_INFINITY; p],
            upper: vec![f64::INFINITY; p],
        }
    }

    pub fn with_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    fn validate(&self) -> EngineResult<()> {
        let p = self.part.n_params();
        if self.start.len() != p || self.lower.len() != p || self.upper.len() != p {
            return Err(EngineError::InvalidDesign(format!(
                "non-linear part has {p} parameters; start/lower/upper have {}/{}/{}",
                self.start.len(),
                self.lower.len(),
                self.upper.len()
            )));
        }
        let infeasible = self
            .start
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .any(|(&s, (&lo, &hi))| !(lo <= s && s <= hi));
        if infeasible {
            return Err(EngineError::InvalidDesign(
                "non-linear start values lie outside their bounds".into(),
            ));
        }
        Ok(())
    }
}

/// Evaluates `f` and its Jacobian on the observations in use.
struct Linearization<'a> {
    spec: &'a NonLinearSpec,
    rows: Option<Vec<usize>>,
    n_full: usize,
    jac_step: f64,
}

impl<'a> Linearization<'a> {
    fn new(spec: &'a NonLinearSpec, mask: Option<&[bool]>, n_obs: usize, jac_step: f64) -> Self {
        let rows = mask.map(|m| {
            m.iter()
                .enumerate()
                .filter_map(|(i, &keep)| keep.then_some(i))
                .collect()
        });
        Self {
            spec,
            rows,
            n_full: mask.map_or(n_obs, |m| m.len()),
            jac_step,
        }
    }

    fn values(&self, params: &[f64]) -> Array1<f64> {
        let mut full = vec![0.0; self.n_full];
        self.spec.part.evaluate(params, &mut full);
        match &self.rows {
            Some(rows) => rows.iter().map(|&i| full[i]).collect(),
            None => Array1::from_vec(full),
        }
    }

    fn jacobian(&self, params: &[f64]) -> Array2<f64> {
        let p = params.len();
        let mut full = Array2::<f64>::zeros((self.n_full, p));
        if !self.spec.part.jacobian(params, &mut full) {
            let mut shifted = params.to_vec();
            for j in 0..p {
                let h = self.jac_step * params[j].abs().max(1.0);
                let mut plus = vec![0.0; self.n_full];
                let mut minus = vec![0.0; self.n_full];
                shifted[j] = params[j] + h;
                self.spec.part.evaluate(&shifted, &mut plus);
                shifted[j] = params[j] - h;
                self.spec.part.evaluate(&shifted, &mut minus);
                shifted[j] = params[j];
                for (i, (a, b)) in plus.iter().zip(&minus).enumerate() {
                    full[(i, j)] = (a - b) / (2.0 * h);
                }
            }
        }
        match &self.rows {
            Some(rows) => full.select(Axis(0), rows),
            None => full,
        }
    }
}

fn fit_core(
    design: &Design,
    family: &Family,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    match family {
        Family::Gaussian => linear::fit(design, config, warnings),
        other => irls::fit(design, other, config, warnings),
    }
}

fn base_offset(design: &Design) -> Array1<f64> {
    Array1::from_shape_fn(design.n_obs(), |i| design.offset_at(i))
}

/// Deviance of the model with θ held fixed (β and the fixed effects profiled
/// out).
fn profile_deviance(
    design: &Design,
    family: &Family,
    lin: &Linearization,
    params: &[f64],
    config: &EngineConfig,
) -> EngineResult<f64> {
    let offset = base_offset(design) + lin.values(params);
    let mut scratch = Vec::new();
    Ok(fit_core(&design.with_offset_values(offset), family, config, &mut scratch)?.deviance)
}

/// True when `params[j]` sits on a bound and `d` pushes past it.
fn pushes_out(spec: &NonLinearSpec, j: usize, value: f64, d: f64) -> bool {
    (d > 0.0 && value >= spec.upper[j]) || (d < 0.0 && value <= spec.lower[j])
}

/// Gauss-Newton direction with the components blocked by an active bound
/// zeroed.
fn projected_direction(spec: &NonLinearSpec, params: &[f64], direction: &[f64]) -> Vec<f64> {
    params
        .iter()
        .zip(direction)
        .enumerate()
        .map(|(j, (&p, &d))| if pushes_out(spec, j, p, d) { 0.0 } else { d })
        .collect()
}

/// `params + fraction · direction`, clamped into the box.
fn projected_point(spec: &NonLinearSpec, params: &[f64], direction: &[f64], fraction: f64) -> Vec<f64> {
    params
        .iter()
        .zip(direction)
        .enumerate()
        .map(|(j, (&p, &d))| (p + fraction * d).clamp(spec.lower[j], spec.upper[j]))
        .collect()
}

fn relative_step(from: &[f64], to: &[f64]) -> f64 {
    to.iter()
        .zip(from)
        .map(|(a, b)| (a - b).abs() / (0.1 + b.abs()))
        .fold(0.0, f64::max)
}

pub(crate) fn fit(
    design: &Design,
    family: &Family,
    spec: &NonLinearSpec,
    mask: Option<&[bool]>,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    spec.validate()?;
    let settings = &config.nonlinear;
    let lin = Linearization::new(spec, mask, design.n_obs(), settings.jac_step);
    let k = design.n_regressors();
    let p = spec.part.n_params();

    let mut names = design.x_names().to_vec();
    names.extend(spec.part.names());

    let mut params = spec.start.clone();
    let mut deviance = profile_deviance(design, family, &lin, &params, config)?;

    for iteration in 1..=settings.max_iter {
        let f = lin.values(&params);
        let jac = lin.jacobian(&params);
        if f.iter().chain(jac.iter()).any(|v| !v.is_finite()) {
            return Err(EngineError::NonFiniteValue {
                quantity: "non-linear part",
                iteration,
            });
        }

        // Linearized core: offset + f(θ) − Jθ, regressors [X | J]
        let theta = Array1::from_vec(params.clone());
        let offset = base_offset(design) + &f - &jac.dot(&theta);
        let augmented = design
            .with_regressors(hstack(&[design.x().view(), jac.view()]), names.clone())
            .with_offset_values(offset);
        let mut scratch = Vec::new();
        let linearized = fit_core(&augmented, family, config, &mut scratch)?;

        let direction: Vec<f64> = (0..p)
            .map(|j| {
                let proposal = linearized.coefficients[k + j];
                if proposal.is_nan() {
                    0.0
                } else {
                    proposal - params[j]
                }
            })
            .collect();

        let direction = projected_direction(spec, &params, &direction);
        let target = projected_point(spec, &params, &direction, 1.0);
        if relative_step(&params, &target) < settings.tol {
            log::debug!("non-linear iteration {iteration}: projected step vanished");
            return finalize(design, family, &lin, spec, &params, names, config, warnings, iteration);
        }

        let mut fraction = 1.0;
        let (trial, trial_deviance) = loop {
            if fraction < settings.min_step {
                log::warn!("non-linear step fell below {} at iteration {iteration}", settings.min_step);
                return Err(EngineError::OptimizationFailed {
                    reason: format!(
                        "no improving feasible step after {iteration} iteration(s)"
                    ),
                    diagnostics: IterationDiagnostics {
                        iterations: iteration,
                        last_deviance: deviance,
                        last_coefficients: params,
                    },
                });
            }
            let trial = projected_point(spec, &params, &direction, fraction);
            let trial_deviance = profile_deviance(design, family, &lin, &trial, config)?;
            if trial_deviance <= deviance * (1.0 + settings.tol) + f64::MIN_POSITIVE {
                break (trial, trial_deviance);
            }
            fraction *= 0.5;
        };

        let dev_change = (deviance - trial_deviance).abs() / (0.1 + trial_deviance.abs());
        let step_size = relative_step(&params, &trial);
        log::debug!(
            "non-linear iteration {iteration}: deviance {trial_deviance:.10e}, step {step_size:.3e}"
        );
        params = trial;
        deviance = trial_deviance;

        if dev_change < settings.tol || step_size < settings.tol {
            return finalize(design, family, &lin, spec, &params, names, config, warnings, iteration);
        }
    }

    Err(EngineError::Diverged {
        reason: DivergenceReason::IterationCap,
        diagnostics: IterationDiagnostics {
            iterations: settings.max_iter,
            last_deviance: deviance,
            last_coefficients: params,
        },
    })
}

/// Core fit linearized at the final θ; its Jacobian columns carry the
/// covariance of θ. Parameters on a bound enter through the offset only and
/// are reported as dropped with their bound value.
#[allow(clippy::too_many_arguments)]
fn finalize(
    design: &Design,
    family: &Family,
    lin: &Linearization,
    spec: &NonLinearSpec,
    params: &[f64],
    names: Vec<String>,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
    iterations: usize,
) -> EngineResult<CoreFit> {
    let k = design.n_regressors();
    let p = params.len();
    let pinned: Vec<bool> = params
        .iter()
        .enumerate()
        .map(|(j, &v)| v <= spec.lower[j] || v >= spec.upper[j])
        .collect();
    let free: Vec<usize> = (0..p).filter(|&j| !pinned[j]).collect();

    let f = lin.values(params);
    let jac = lin.jacobian(params);
    let theta = Array1::from_vec(params.to_vec());
    let jac_free = jac.select(Axis(1), &free);
    let theta_free = theta.select(Axis(0), &free);

    // Offset f(θ) − J_free θ_free: the fitted linear predictor is unchanged
    // while the free Jacobian columns estimate θ itself.
    let fit_offset = &f - &jac_free.dot(&theta_free);
    let mut fit_names = design.x_names().to_vec();
    fit_names.extend(free.iter().map(|&j| names[k + j].clone()));
    let augmented = design
        .with_regressors(hstack(&[design.x().view(), jac_free.view()]), fit_names)
        .with_offset_values(base_offset(design) + &fit_offset);
    let mut local = Vec::new();
    let mut core = fit_core(&augmented, family, config, &mut local)?;

    // Back to one column per parameter.
    let position = |c: usize| if c < k { c } else { k + free[c - k] };
    for warning in &mut local {
        if let FitWarning::CollinearRegressor { column, .. } = warning {
            *column = position(*column);
        }
    }
    warnings.append(&mut local);

    let mut coefficients = Array1::from_elem(k + p, f64::NAN);
    for c in 0..core.coefficients.len() {
        coefficients[position(c)] = core.coefficients[c];
    }
    let mut dropped: Vec<usize> = core.dropped.iter().map(|&c| position(c)).collect();
    for (j, &value) in params.iter().enumerate() {
        if pinned[j] {
            log::warn!("non-linear parameter '{}' is held at its bound {value}", names[k + j]);
            warnings.push(FitWarning::ParameterAtBound {
                name: names[k + j].clone(),
                value,
            });
            coefficients[k + j] = value;
            dropped.push(k + j);
        } else if !coefficients[k + j].is_nan() {
            coefficients[k + j] = value;
        }
    }
    dropped.sort_unstable();

    core.extra_offset = Some(&f - &jac.dot(&theta));
    core.regressors = hstack(&[design.x().view(), jac.view()]);
    core.coefficients = coefficients;
    core.dropped = dropped;
    core.names = names;
    core.iterations = iterations;
    Ok(core)
}
