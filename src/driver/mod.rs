//! Estimation entry point.
//!
//! [`estimate`] prepares the design (degenerate groupings, singletons),
//! dispatches to the outer loop matching the model and assembles the
//! [`FitResult`]:
//!
//! - [`linear`]: Gaussian with identity link, one centering pass and one solve
//! - [`irls`]: GLM families
//! - [`negbin`]: negative binomial with estimated θ
//! - [`nonlinear`]: right-hand sides non-linear in some parameters
//! - [`crate::iv`]: instrumented regressors

pub mod irls;
pub mod linear;
pub mod negbin;
pub mod nonlinear;

use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use crate::config::EngineConfig;
use crate::demean::{center, DemeanContext};
use crate::design::Design;
use crate::error::{EngineError, EngineResult, FitWarning};
use crate::family::Family;
use crate::fixef;
use crate::group_index::detect_singletons;
use crate::iv::{self, IvDiagnostics, IvSpec};
use crate::reduce;
use crate::result::{ConvergenceInfo, FitResult, FitStatistics};
use crate::vcov::{self, FixefK, VcovInput, VcovSpec};

pub use nonlinear::{NonLinearPart, NonLinearSpec};

/// What to estimate on a [`Design`].
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub family: Family,
    pub vcov: VcovSpec,
    pub instruments: Option<IvSpec>,
    pub nonlinear: Option<NonLinearSpec>,
}

impl ModelSpec {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            vcov: VcovSpec::default(),
            instruments: None,
            nonlinear: None,
        }
    }

    pub fn with_vcov(mut self, vcov: VcovSpec) -> Self {
        self.vcov = vcov;
        self
    }

    pub fn with_instruments(mut self, instruments: IvSpec) -> Self {
        self.instruments = Some(instruments);
        self
    }

    pub fn with_nonlinear(mut self, nonlinear: NonLinearSpec) -> Self {
        self.nonlinear = Some(nonlinear);
        self
    }
}

/// Fit `model` on `design`. Every parallel region runs on a pool sized by
/// `config`.
pub fn estimate(design: &Design, model: &ModelSpec, config: &EngineConfig) -> EngineResult<FitResult> {
    let pool = config.thread_pool()?;
    pool.install(|| estimate_in_pool(design, model, config))
}

fn estimate_in_pool(design: &Design, model: &ModelSpec, config: &EngineConfig) -> EngineResult<FitResult> {
    let mut prepared = prepare(design, model, config)?;
    let warnings = &mut prepared.warnings;

    let core = match (&prepared.instruments, &model.nonlinear) {
        (Some(_), _) if !model.family.is_linear() => {
            return Err(EngineError::InvalidDesign(format!(
                "instrumental variables require the gaussian family, got '{}'",
                model.family.name()
            )));
        }
        (Some(_), Some(_)) => {
            return Err(EngineError::InvalidDesign(
                "instrumental variables cannot be combined with a non-linear part".into(),
            ));
        }
        (Some(instruments), None) => iv::fit(&prepared.design, instruments, config, warnings)?,
        (None, Some(spec)) => nonlinear::fit(
            &prepared.design,
            &model.family,
            spec,
            prepared.mask.as_deref(),
            config,
            warnings,
        )?,
        (None, None) => match &model.family {
            Family::Gaussian => linear::fit(&prepared.design, config, warnings)?,
            Family::NegativeBinomial { theta: None } => {
                negbin::fit(&prepared.design, &model.family, config, warnings)?
            }
            family => irls::fit(&prepared.design, family, config, warnings)?,
        },
    };

    finish(prepared, core, config)
}

/// Design after dropping degenerate groupings and (optionally) singletons.
pub(crate) struct Prepared {
    pub design: Design,
    pub vcov: VcovSpec,
    pub instruments: Option<IvSpec>,
    pub mask: Option<Vec<bool>>,
    pub warnings: Vec<FitWarning>,
}

fn prepare(design: &Design, model: &ModelSpec, config: &EngineConfig) -> EngineResult<Prepared> {
    let mut warnings = Vec::new();
    let mut design = drop_degenerate(design.clone(), &mut warnings);
    let mut vcov = model.vcov.clone();
    let mut instruments = model.instruments.clone();
    let mut mask = None;

    if config.drop_singletons && !design.groupings().is_empty() {
        let ids: Vec<&[usize]> = design.groupings().iter().map(|g| g.index.ids()).collect();
        let singletons = detect_singletons(&ids);
        let count = singletons.iter().filter(|&&s| s).count();
        if count == design.n_obs() {
            return Err(EngineError::InvalidDesign(
                "every observation is a singleton".into(),
            ));
        }
        if count > 0 {
            log::warn!("removed {count} singleton observation(s)");
            warnings.push(FitWarning::SingletonsRemoved { count });
            let keep: Vec<bool> = singletons.iter().map(|&s| !s).collect();
            design = drop_degenerate(design.subset(&keep), &mut warnings);
            vcov = vcov.subset(&keep);
            instruments = instruments.map(|iv| iv.subset(&keep));
            mask = Some(keep);
        }
    }

    if let VcovSpec::Cluster(c) = &vcov {
        if c.len() != design.n_obs() {
            return Err(EngineError::InvalidDesign(format!(
                "cluster variables have length {}, expected {}",
                c.len(),
                design.n_obs()
            )));
        }
    }
    if let Some(iv) = &instruments {
        iv.check_rows(design.n_obs())?;
    }

    Ok(Prepared {
        design,
        vcov,
        instruments,
        mask,
        warnings,
    })
}

fn drop_degenerate(mut design: Design, warnings: &mut Vec<FitWarning>) -> Design {
    let degenerate: Vec<usize> = design
        .groupings()
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_slope() && g.index.ensure_not_degenerate(&g.name).is_err())
        .map(|(position, _)| position)
        .collect();
    for &position in &degenerate {
        let name = design.groupings()[position].name.clone();
        log::warn!("grouping '{name}' has a single level and is dropped");
        warnings.push(FitWarning::DegenerateGrouping { name });
    }
    // Back to front so earlier positions stay valid.
    for &position in degenerate.iter().rev() {
        design = design.without_grouping(position);
    }
    design
}

/// Columns centered on the design's groupings.
pub(crate) struct Centered {
    pub values: Array2<f64>,
    /// `None` when the design has no groupings (centering is the identity).
    pub ctx: Option<DemeanContext>,
    pub unconverged: usize,
    pub max_iterations: usize,
}

pub(crate) fn center_block(
    design: &Design,
    block: ArrayView2<f64>,
    weights: Option<&[f64]>,
    config: &EngineConfig,
) -> EngineResult<Centered> {
    if design.groupings().is_empty() {
        return Ok(Centered {
            values: block.to_owned(),
            ctx: None,
            unconverged: 0,
            max_iterations: 0,
        });
    }
    let ctx = DemeanContext::new(design.groupings(), weights, config.centering.reorder_fe)?;
    let centered = center(block, &ctx, &config.centering);
    Ok(Centered {
        unconverged: centered.n_unconverged(),
        max_iterations: centered.max_iterations(),
        values: centered.demeaned,
        ctx: Some(ctx),
    })
}

pub(crate) fn report_slow_convergence(
    stage: &'static str,
    centered: &Centered,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) {
    if centered.unconverged == 0 {
        return;
    }
    log::warn!(
        "{stage}: centering of {} column(s) stopped at the iteration cap",
        centered.unconverged
    );
    warnings.push(FitWarning::SlowConvergence {
        stage,
        unconverged_columns: centered.unconverged,
        max_iterations: config.centering.maxiter,
    });
}

pub(crate) fn report_collinear(names: &[String], dropped: &[usize], warnings: &mut Vec<FitWarning>) {
    for &column in dropped {
        let name = names.get(column).cloned().unwrap_or_else(|| format!("x{column}"));
        log::warn!("regressor '{name}' is collinear and was dropped");
        warnings.push(FitWarning::CollinearRegressor { name, column });
    }
}

/// Weighted sum of squares of each column before centering; the collinearity
/// check compares centered pivots against it.
pub(crate) fn reference_scale(x: ArrayView2<f64>, weights: Option<&[f64]>) -> Vec<f64> {
    x.axis_iter(Axis(1))
        .map(|col| {
            let col = col.to_vec();
            reduce::weighted_dot(&col, &col, weights)
        })
        .collect()
}

/// `[v | x]` as one block.
pub(crate) fn with_leading_column<'a>(v: &'a Array1<f64>, x: ArrayView2<'a, f64>) -> Array2<f64> {
    let lead = v.view().insert_axis(Axis(1));
    crate::demean::hstack(&[lead, x])
}

pub(crate) fn ensure_finite<'a>(
    quantity: &'static str,
    mut values: impl Iterator<Item = &'a f64>,
    iteration: usize,
) -> EngineResult<()> {
    if values.any(|v| !v.is_finite()) {
        return Err(EngineError::NonFiniteValue {
            quantity,
            iteration,
        });
    }
    Ok(())
}

/// Output of one of the outer loops, before fixed-effect recovery, covariance
/// and statistics.
#[derive(Debug)]
pub(crate) struct CoreFit {
    pub names: Vec<String>,
    /// One entry per column of `regressors`; collinear columns are NaN.
    pub coefficients: Array1<f64>,
    pub dropped: Vec<usize>,
    /// Regressors before centering.
    pub regressors: Array2<f64>,
    /// Centered regressors of the kept columns as they entered the final solve.
    pub x_centered: Array2<f64>,
    pub bread: Array2<f64>,
    pub working_residuals: Array1<f64>,
    /// `None` means the prior weights.
    pub working_weights: Option<Vec<f64>>,
    pub eta: Array1<f64>,
    pub mu: Array1<f64>,
    pub deviance: f64,
    /// Family with θ pinned to its final value.
    pub family: Family,
    pub ctx: Option<DemeanContext>,
    pub converged: bool,
    pub iterations: usize,
    pub centering_iterations: usize,
    /// `Σ w ỹ²` of the centered response (linear fits with groupings).
    pub within_ss: Option<f64>,
    /// Part of `eta` carried in the offset on top of the design's own, such
    /// that `regressors · coefficients + extra_offset` is the non-fixed-effect
    /// predictor.
    pub extra_offset: Option<Array1<f64>>,
    pub iv: Option<IvDiagnostics>,
}

impl CoreFit {
    fn coefficients_or_zero(&self) -> Array1<f64> {
        self.coefficients.mapv(|b| if b.is_nan() { 0.0 } else { b })
    }
}

fn finish(prepared: Prepared, core: CoreFit, config: &EngineConfig) -> EngineResult<FitResult> {
    let Prepared {
        design,
        vcov: vcov_spec,
        mask,
        mut warnings,
        ..
    } = prepared;
    let n = design.n_obs();
    let prior = design.weight_slice();
    let y = design.y().to_vec();
    let mu = core.mu.to_vec();

    let fixed_effects = match &core.ctx {
        Some(ctx) => {
            let xb = core.regressors.dot(&core.coefficients_or_zero());
            let extra = |i: usize| core.extra_offset.as_ref().map_or(0.0, |e| e[i]);
            let fe_sum: Vec<f64> = (0..n)
                .map(|i| core.eta[i] - design.offset_at(i) - extra(i) - xb[i])
                .collect();
            warnings.extend(fixef::identification_warning(design.groupings()));
            fixef::recover(design.groupings(), ctx, &fe_sum, &config.centering)
        }
        None => Vec::new(),
    };

    let n_kept = core.coefficients.len() - core.dropped.len();
    let n_params = n_kept + vcov::fixef_dof(design.groupings(), None, FixefK::Full);
    let dof_residual = n.saturating_sub(n_params);
    let dof = dof_residual.max(1) as f64;

    let rss: f64 = (0..n)
        .map(|i| prior.map_or(1.0, |w| w[i]) * (y[i] - mu[i]).powi(2))
        .sum();
    let dispersion = match core.family.fixed_dispersion() {
        Some(d) => d,
        None => {
            let pearson: f64 = (0..n)
                .map(|i| {
                    let w = prior.map_or(1.0, |w| w[i]);
                    w * (y[i] - mu[i]).powi(2) / core.family.variance(mu[i])
                })
                .sum();
            pearson / dof
        }
    };

    let covariance = vcov::compute(
        &vcov_spec,
        &VcovInput {
            x: core.x_centered.view(),
            residuals: core.working_residuals.as_slice().unwrap_or(&[]),
            weights: core.working_weights.as_deref().or(prior),
            bread: &core.bread,
            dispersion,
            groupings: design.groupings(),
        },
        &config.ssc,
    )?;
    if covariance.non_psd {
        warnings.push(FitWarning::NonPsdCovariance);
    }

    let k_total = core.coefficients.len();
    let kept: Vec<usize> = (0..k_total).filter(|j| !core.dropped.contains(j)).collect();
    let mut full_vcov = Array2::from_elem((k_total, k_total), f64::NAN);
    for (a, &ja) in kept.iter().enumerate() {
        for (b, &jb) in kept.iter().enumerate() {
            full_vcov[(ja, jb)] = covariance.matrix[(a, b)];
        }
    }

    let statistics = statistics(&design, &core, rss, dispersion, n_params, dof_residual);
    let df_t = if core.family.is_linear() {
        covariance.df_t
    } else {
        f64::INFINITY
    };

    Ok(FitResult {
        family: core.family.name().to_string(),
        coef_names: core.names,
        coefficients: core.coefficients,
        dropped: core.dropped,
        vcov: full_vcov,
        vcov_type: vcov_spec.name(),
        df_t,
        fixed_effects,
        statistics,
        convergence: ConvergenceInfo {
            converged: core.converged,
            iterations: core.iterations,
            centering_iterations: core.centering_iterations,
        },
        warnings,
        residuals: design.y() - &core.mu,
        fitted: core.mu,
        linear_predictor: core.eta,
        iv: core.iv,
        obs_mask: mask,
    })
}

fn statistics(
    design: &Design,
    core: &CoreFit,
    rss: f64,
    dispersion: f64,
    n_params: usize,
    dof_residual: usize,
) -> FitStatistics {
    let n = design.n_obs();
    let prior = design.weight_slice();
    let y = design.y().to_vec();
    let family = &core.family;

    let null_mu = null_mean(design, family);
    let null_deviance = family.deviance(&y, &null_mu, prior);

    let (ll_scale, null_scale) = match family {
        Family::Gaussian => (core.deviance / n as f64, null_deviance / n as f64),
        _ => (dispersion, dispersion),
    };
    let log_likelihood = family.log_likelihood(&y, &core.mu.to_vec(), prior, ll_scale);
    let null_log_likelihood = family.log_likelihood(&y, &null_mu, prior, null_scale);

    let gaussian = family.is_linear();
    FitStatistics {
        n_obs: n,
        n_params,
        deviance: core.deviance,
        null_deviance,
        log_likelihood,
        null_log_likelihood,
        pseudo_r2: 1.0 - log_likelihood / null_log_likelihood,
        r2: gaussian.then(|| 1.0 - rss / null_deviance),
        within_r2: if gaussian { core.within_ss.map(|ss| 1.0 - rss / ss) } else { None },
        rss,
        dof_residual,
        dispersion,
        theta: family.theta(),
    }
}

/// Fitted mean of the intercept-only model (offset kept), by a short scalar
/// IRLS.
fn null_mean(design: &Design, family: &Family) -> Vec<f64> {
    let n = design.n_obs();
    let y = design.y();
    let prior = design.weight_slice();
    let w_at = |i: usize| prior.map_or(1.0, |w| w[i]);

    let total_w: f64 = (0..n).map(w_at).sum();
    let y_bar = (0..n).map(|i| w_at(i) * y[i]).sum::<f64>() / total_w;
    let mut c = family.link(y_bar);
    if !c.is_finite() {
        c = 0.0;
    }

    for _ in 0..50 {
        let (mut num, mut den) = (0.0, 0.0);
        for i in 0..n {
            let eta = c + design.offset_at(i);
            let mu = family.link_inverse(eta);
            let d = family.mu_eta(eta);
            let w = w_at(i) * d * d / family.variance(mu);
            num += w * (c + (y[i] - mu) / d);
            den += w;
        }
        let next = num / den;
        if !next.is_finite() {
            break;
        }
        let done = (next - c).abs() <= 1e-12 * (1.0 + c.abs());
        c = next;
        if done {
            break;
        }
    }

    (0..n)
        .map(|i| family.link_inverse(c + design.offset_at(i)))
        .collect()
}

/// Split the centered block `[v | x]`.
pub(crate) fn split_leading(values: &Array2<f64>) -> (Array1<f64>, ArrayView2<'_, f64>) {
    (values.column(0).to_owned(), values.slice(s![.., 1..]))
}
