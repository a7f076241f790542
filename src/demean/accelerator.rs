//! Acceleration of the centering fixed-point iteration.
//!
//! Every iteration extrapolates from `x`, `G(x)` and `G(G(x))` (Irons-Tuck).
//! Every `iter_grand_acc` iterations the current iterate is also recorded;
//! once three records exist they are extrapolated the same way ("grand"
//! acceleration). The SSR is compared every `ssr_check_interval` iterations as
//! a second stopping rule.

use crate::demean::projection::Projector;
use crate::demean::types::{CenteringConfig, ConvergenceState};

const RELATIVE_OFFSET: f64 = 0.1;

/// `|a − b| ≤ tol` or `|a − b| ≤ tol·(0.1 + |a|)`.
#[inline]
pub(crate) fn within_tol(a: f64, b: f64, tol: f64) -> bool {
    let diff = (a - b).abs();
    diff <= tol || diff <= tol * (RELATIVE_OFFSET + a.abs())
}

#[inline]
fn all_within_tol(old: &[f64], new: &[f64], tol: f64) -> bool {
    old.iter().zip(new).all(|(&a, &b)| within_tol(a, b, tol))
}

/// Overwrite `x` with the Irons-Tuck extrapolation of `x, gx, ggx`.
///
/// Returns `false` (leaving `x` untouched) when the second differences vanish,
/// i.e. `x` already is the fixed point.
#[inline]
fn irons_tuck(x: &mut [f64], gx: &[f64], ggx: &[f64]) -> bool {
    let mut num = 0.0;
    let mut den = 0.0;
    for ((&xi, &gi), &ggi) in x.iter().zip(gx).zip(ggx) {
        let step = ggi - gi;
        let curvature = step - gi + xi;
        num += step * curvature;
        den += curvature * curvature;
    }
    if den == 0.0 {
        return false;
    }
    let ratio = num / den;
    for ((xi, &gi), &ggi) in x.iter_mut().zip(gx).zip(ggx) {
        *xi = ggi - ratio * (ggi - gi);
    }
    true
}

/// Three iterates recorded `iter_grand_acc` iterations apart.
struct Snapshots {
    slots: [Vec<f64>; 3],
    filled: usize,
}

impl Snapshots {
    fn new(len: usize) -> Self {
        Self {
            slots: [vec![0.0; len], vec![0.0; len], vec![0.0; len]],
            filled: 0,
        }
    }

    /// Record `values`; true once all three slots are filled.
    fn record(&mut self, values: &[f64]) -> bool {
        self.slots[self.filled][..values.len()].copy_from_slice(values);
        self.filled += 1;
        self.filled == 3
    }

    /// Extrapolate into the first slot and start over.
    fn extrapolate(&mut self, len: usize) -> Option<&[f64]> {
        self.filled = 0;
        let [first, second, third] = &mut self.slots;
        irons_tuck(&mut first[..len], &second[..len], &third[..len]).then_some(&first[..])
    }
}

/// Irons-Tuck iteration with grand acceleration.
pub struct IronsTuckGrand {
    config: CenteringConfig,
    gx: Vec<f64>,
    ggx: Vec<f64>,
    scratch: Vec<f64>,
    snapshots: Snapshots,
}

impl IronsTuckGrand {
    pub fn new(config: CenteringConfig, n_coef: usize) -> Self {
        Self {
            config,
            gx: vec![0.0; n_coef],
            ggx: vec![0.0; n_coef],
            scratch: vec![0.0; n_coef],
            snapshots: Snapshots::new(n_coef),
        }
    }

    /// Iterate from `coef` for at most `max_iter` iterations.
    ///
    /// On return `coef` holds `G` of the last iterate. Returns the iteration
    /// count and whether a stopping rule fired.
    pub fn run<P: Projector>(
        &mut self,
        projector: &mut P,
        coef: &mut [f64],
        max_iter: usize,
    ) -> (usize, ConvergenceState) {
        debug_assert_eq!(self.gx.len(), projector.coef_len());
        self.snapshots.filled = 0;

        let (iterations, state) = if self.config.accelerate {
            self.iterate_accelerated(projector, coef, max_iter)
        } else {
            self.iterate_plain(projector, coef, max_iter)
        };
        coef.copy_from_slice(&self.gx);
        (iterations, state)
    }

    fn iterate_plain<P: Projector>(
        &mut self,
        projector: &mut P,
        coef: &mut [f64],
        max_iter: usize,
    ) -> (usize, ConvergenceState) {
        for iter in 0..=max_iter {
            if self.step_settled(projector, coef) {
                return (iter, ConvergenceState::Converged);
            }
            coef.copy_from_slice(&self.gx);
        }
        (max_iter, ConvergenceState::NotConverged)
    }

    fn iterate_accelerated<P: Projector>(
        &mut self,
        projector: &mut P,
        coef: &mut [f64],
        max_iter: usize,
    ) -> (usize, ConvergenceState) {
        if self.step_settled(projector, coef) {
            return (0, ConvergenceState::Converged);
        }
        let tol = self.config.tol;
        let live = projector.convergence_len();
        let mut last_ssr = f64::NAN;

        for iter in 1..=max_iter {
            // x ← IT(x, G(x), G(G(x))), then optionally one more projection.
            projector.project(&self.gx, &mut self.ggx);
            if !irons_tuck(&mut coef[..live], &self.gx[..live], &self.ggx[..live]) {
                return (iter, ConvergenceState::Converged);
            }
            if iter >= self.config.iter_proj_after_acc {
                self.scratch[..live].copy_from_slice(&coef[..live]);
                projector.project(&self.scratch, coef);
            }
            if self.step_settled(projector, coef) {
                return (iter, ConvergenceState::Converged);
            }

            if iter % self.config.iter_grand_acc == 0 && self.snapshots.record(&self.gx[..live]) {
                match self.snapshots.extrapolate(live) {
                    Some(jump) => projector.project(jump, &mut self.gx),
                    None => return (iter, ConvergenceState::Converged),
                }
            }

            if iter % self.config.ssr_check_interval == 0 {
                let ssr = projector.compute_ssr(&self.gx);
                if last_ssr.is_finite() && within_tol(last_ssr, ssr, tol) {
                    return (iter, ConvergenceState::Converged);
                }
                last_ssr = ssr;
            }
        }
        (max_iter, ConvergenceState::NotConverged)
    }

    /// `gx ← G(coef)`; true when no live coefficient moved beyond `tol`.
    #[inline]
    fn step_settled<P: Projector>(&mut self, projector: &mut P, coef: &[f64]) -> bool {
        projector.project(coef, &mut self.gx);
        let live = projector.convergence_len();
        all_within_tol(&coef[..live], &self.gx[..live], self.config.tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demean::projection::GaussSeidelProjector;
    use crate::demean::types::DemeanContext;
    use crate::design::GroupingSpec;
    use crate::group_index::GroupIndex;

    /// Unbalanced two-way problem: 10 levels crossed with 7, with gaps.
    fn crossed_problem(n_obs: usize) -> (DemeanContext, Vec<f64>) {
        let g0: Vec<usize> = (0..n_obs).map(|i| i % 10).collect();
        let g1: Vec<usize> = (0..n_obs).map(|i| (i * i + i / 3) % 7).collect();
        let specs = vec![
            GroupingSpec::new("g0", GroupIndex::from_codes(&g0)),
            GroupingSpec::new("g1", GroupIndex::from_codes(&g1)),
        ];
        let ctx = DemeanContext::new(&specs, None, false).unwrap();
        let input: Vec<f64> = (0..n_obs).map(|i| (i as f64) * 0.1 + ((i % 5) as f64).sin()).collect();
        (ctx, input)
    }

    fn solve(ctx: &DemeanContext, input: &[f64], config: CenteringConfig) -> (Vec<f64>, usize, ConvergenceState) {
        let n_coef = ctx.n_coef();
        let mut sums = vec![0.0; n_coef];
        ctx.apply_design_matrix_t(input, &mut sums);
        let mut coef = vec![0.0; n_coef];
        let mut accelerator = IronsTuckGrand::new(config, n_coef);
        let mut projector = GaussSeidelProjector::new(ctx, &sums, input, 2);
        let (iter, conv) = accelerator.run(&mut projector, &mut coef, config.maxiter);
        (coef, iter, conv)
    }

    #[test]
    fn test_accelerated_iteration_converges_quickly() {
        let (ctx, input) = crossed_problem(200);
        let (_, iter, convergence) = solve(&ctx, &input, CenteringConfig::default());
        assert_eq!(convergence, ConvergenceState::Converged);
        assert!(iter < 200, "took {iter} iterations");
    }

    #[test]
    fn test_plain_and_accelerated_agree() {
        let (ctx, input) = crossed_problem(200);
        let accelerated = CenteringConfig::default();
        let plain = CenteringConfig {
            accelerate: false,
            ..accelerated
        };

        let (coef_a, _, conv_a) = solve(&ctx, &input, accelerated);
        let (coef_p, _, conv_p) = solve(&ctx, &input, plain);
        assert_eq!(conv_a, ConvergenceState::Converged);
        assert_eq!(conv_p, ConvergenceState::Converged);

        // Coefficients are identified up to a shift between groupings.
        let mut fit_a = vec![0.0; ctx.n_obs()];
        let mut fit_p = vec![0.0; ctx.n_obs()];
        ctx.apply_design_matrix(&coef_a, &mut fit_a);
        ctx.apply_design_matrix(&coef_p, &mut fit_p);
        for (a, p) in fit_a.iter().zip(&fit_p) {
            assert!((a - p).abs() < 1e-5, "{a} vs {p}");
        }
    }

    #[test]
    fn test_iteration_cap_reports_not_converged() {
        let (ctx, input) = crossed_problem(200);
        let config = CenteringConfig {
            maxiter: 1,
            accelerate: false,
            ..CenteringConfig::default()
        };
        let (_, iter, conv) = solve(&ctx, &input, config);
        assert_eq!(conv, ConvergenceState::NotConverged);
        assert_eq!(iter, 1);
    }

    #[test]
    fn test_irons_tuck_solves_linear_map_in_one_step() {
        // G(x) = 0.5 x + 1 has fixed point 2; one extrapolation lands on it.
        let mut x = [0.0];
        let gx = [1.0];
        let ggx = [1.5];
        assert!(irons_tuck(&mut x, &gx, &ggx));
        assert!((x[0] - 2.0).abs() < 1e-12);

        let mut fixed = [2.0];
        assert!(!irons_tuck(&mut fixed, &[2.0], &[2.0]));
    }

    #[test]
    fn test_within_tol() {
        assert!(within_tol(1.0, 1.0 + 1e-9, 1e-8));
        assert!(within_tol(1000.0, 1000.0 + 1e-6, 1e-8));
        assert!(!within_tol(0.0, 1e-6, 1e-8));
    }
}
