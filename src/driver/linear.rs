//! Gaussian / identity fits: one centering pass, one solve.

use super::{
    center_block, reference_scale, report_collinear, report_slow_convergence, split_leading,
    with_leading_column, CoreFit,
};
use crate::config::EngineConfig;
use crate::design::Design;
use crate::error::{EngineResult, FitWarning};
use crate::family::Family;
use crate::reduce;
use crate::wls;

use ndarray::Axis;

pub(crate) fn fit(
    design: &Design,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    let weights = design.weight_slice();
    let y_adj = design.adjusted_response();

    let block = with_leading_column(&y_adj, design.x().view());
    let centered = center_block(design, block.view(), weights, config)?;
    report_slow_convergence("linear", &centered, config, warnings);

    let (y_tilde, x_tilde) = split_leading(&centered.values);
    let scale = reference_scale(design.x().view(), weights);
    let solution = wls::solve(x_tilde, y_tilde.view(), weights, Some(&scale), config.collinearity_tol)?;
    report_collinear(design.x_names(), &solution.dropped, warnings);

    let residuals = solution.residuals;
    let eta = design.y() - &residuals;
    let deviance = reduce::weighted_dot(&residuals.to_vec(), &residuals.to_vec(), weights);
    let within_ss = centered
        .ctx
        .is_some()
        .then(|| reduce::weighted_dot(&y_tilde.to_vec(), &y_tilde.to_vec(), weights));

    Ok(CoreFit {
        names: design.x_names().to_vec(),
        coefficients: solution.coefficients,
        dropped: solution.dropped,
        regressors: design.x().clone(),
        x_centered: x_tilde.select(Axis(1), &solution.kept),
        bread: solution.xtwx_inv,
        working_residuals: residuals,
        working_weights: None,
        mu: eta.clone(),
        eta,
        deviance,
        family: Family::Gaussian,
        ctx: centered.ctx,
        converged: centered.unconverged == 0,
        iterations: 1,
        centering_iterations: centered.max_iterations,
        within_ss,
        extra_offset: None,
        iv: None,
    })
}
