//! Centering strategies by grouping count.
//!
//! Each strategy owns its working buffers and is reused across the columns a
//! worker thread handles.

use crate::demean::accelerator::IronsTuckGrand;
use crate::demean::projection::GaussSeidelProjector;
use crate::demean::types::{CenteringConfig, ConvergenceState, DemeanContext, DemeanResult};

/// Centers one column at a time.
pub(crate) trait Demeaner {
    fn solve(&mut self, input: &[f64]) -> DemeanResult;
}

/// `input − fitted`.
fn subtract(input: &[f64], fitted: &[f64]) -> Vec<f64> {
    input.iter().zip(fitted).map(|(&y, &f)| y - f).collect()
}

/// One grouping: each level coefficient is `Σ w z y / Σ w z²` over the level.
pub(crate) struct OneWay<'a> {
    ctx: &'a DemeanContext,
    coef: Vec<f64>,
    fitted: Vec<f64>,
}

impl<'a> OneWay<'a> {
    pub fn new(ctx: &'a DemeanContext) -> Self {
        Self {
            ctx,
            coef: vec![0.0; ctx.n_coef()],
            fitted: vec![0.0; ctx.n_obs()],
        }
    }
}

impl Demeaner for OneWay<'_> {
    fn solve(&mut self, input: &[f64]) -> DemeanResult {
        self.ctx.apply_design_matrix_t(input, &mut self.coef);
        let level_scale = &self.ctx.fe_infos[0].inv_group_weights;
        self.coef.iter_mut().zip(level_scale).for_each(|(c, &s)| *c *= s);

        self.fitted.fill(0.0);
        self.ctx.apply_design_matrix(&self.coef, &mut self.fitted);
        DemeanResult {
            demeaned: subtract(input, &self.fitted),
            fe_coefficients: self.coef.clone(),
            convergence: ConvergenceState::Converged,
            iterations: 0,
        }
    }
}

/// Two groupings: one accelerated run in coefficient space.
pub(crate) struct TwoWay<'a> {
    ctx: &'a DemeanContext,
    maxiter: usize,
    sums: Vec<f64>,
    coef: Vec<f64>,
    fitted: Vec<f64>,
    accelerator: IronsTuckGrand,
}

impl<'a> TwoWay<'a> {
    pub fn new(ctx: &'a DemeanContext, config: &CenteringConfig) -> Self {
        let n_coef = ctx.n_coef();
        Self {
            ctx,
            maxiter: config.maxiter,
            sums: vec![0.0; n_coef],
            coef: vec![0.0; n_coef],
            fitted: vec![0.0; ctx.n_obs()],
            accelerator: IronsTuckGrand::new(*config, n_coef),
        }
    }
}

impl Demeaner for TwoWay<'_> {
    fn solve(&mut self, input: &[f64]) -> DemeanResult {
        self.ctx.apply_design_matrix_t(input, &mut self.sums);
        self.coef.fill(0.0);

        let mut projector = GaussSeidelProjector::new(self.ctx, &self.sums, input, 2);
        let (iterations, convergence) = self.accelerator.run(&mut projector, &mut self.coef, self.maxiter);

        self.fitted.fill(0.0);
        self.ctx.apply_design_matrix(&self.coef, &mut self.fitted);
        DemeanResult {
            demeaned: subtract(input, &self.fitted),
            fe_coefficients: self.ctx.reorder_coef_to_original(&self.coef),
            convergence,
            iterations,
        }
    }
}

/// Three or more groupings, in up to three phases that each work on what the
/// previous ones left over:
///
/// 1. `iter_warmup` accelerated iterations over all groupings;
/// 2. the first two groupings alone, to convergence (at most `maxiter / 2`);
/// 3. all groupings again with the iterations left.
pub(crate) struct MultiWay<'a> {
    ctx: &'a DemeanContext,
    config: &'a CenteringConfig,
    /// Effects absorbed so far, per observation.
    fitted: Vec<f64>,
    /// Coefficients absorbed so far, internal order.
    total: Vec<f64>,
    /// `input − fitted` entering the current phase.
    target: Vec<f64>,
    sums: Vec<f64>,
    coef: Vec<f64>,
    pair_coef: Vec<f64>,
    full_acc: IronsTuckGrand,
    pair_acc: IronsTuckGrand,
}

impl<'a> MultiWay<'a> {
    pub fn new(ctx: &'a DemeanContext, config: &'a CenteringConfig) -> Self {
        let n_coef = ctx.n_coef();
        let n_pair = ctx.n_coef_leading(2);
        Self {
            ctx,
            config,
            fitted: vec![0.0; ctx.n_obs()],
            total: vec![0.0; n_coef],
            target: vec![0.0; ctx.n_obs()],
            sums: vec![0.0; n_coef],
            coef: vec![0.0; n_coef],
            pair_coef: vec![0.0; n_pair],
            full_acc: IronsTuckGrand::new(*config, n_coef),
            pair_acc: IronsTuckGrand::new(*config, n_pair),
        }
    }

    /// Center what is left of `input` on all groupings (or the leading pair)
    /// and fold the result into `fitted` and `total`.
    fn phase(&mut self, input: &[f64], pair_only: bool, max_iter: usize) -> (usize, ConvergenceState) {
        let ctx = self.ctx;
        let n_dims = if pair_only { 2 } else { ctx.n_fe() };

        for ((t, &y), &f) in self.target.iter_mut().zip(input).zip(&self.fitted) {
            *t = y - f;
        }
        ctx.apply_design_matrix_t_leading(&self.target, &mut self.sums, n_dims);

        let (coef, accelerator) = if pair_only {
            (&mut self.pair_coef, &mut self.pair_acc)
        } else {
            (&mut self.coef, &mut self.full_acc)
        };
        coef.fill(0.0);
        let mut projector = GaussSeidelProjector::new(ctx, &self.sums, &self.target, n_dims);
        let outcome = accelerator.run(&mut projector, coef, max_iter);

        ctx.apply_design_matrix_leading(coef, &mut self.fitted, n_dims);
        self.total.iter_mut().zip(coef.iter()).for_each(|(t, &c)| *t += c);
        outcome
    }

    fn result(&self, input: &[f64], iterations: usize, convergence: ConvergenceState) -> DemeanResult {
        DemeanResult {
            demeaned: subtract(input, &self.fitted),
            fe_coefficients: self.ctx.reorder_coef_to_original(&self.total),
            convergence,
            iterations,
        }
    }
}

impl Demeaner for MultiWay<'_> {
    fn solve(&mut self, input: &[f64]) -> DemeanResult {
        self.fitted.fill(0.0);
        self.total.fill(0.0);

        let (warmup, state) = self.phase(input, false, self.config.iter_warmup);
        if state == ConvergenceState::Converged {
            return self.result(input, warmup, state);
        }

        // The pair phase leaves the other groupings untouched; never stop on it.
        let (pair, _) = self.phase(input, true, self.config.maxiter / 2);
        let used = warmup + pair;

        let remaining = self.config.maxiter.saturating_sub(used);
        if remaining == 0 {
            return self.result(input, used, ConvergenceState::NotConverged);
        }
        let (last, state) = self.phase(input, false, remaining);
        self.result(input, used + last, state)
    }
}
