//! Projection operator of the centering iteration.
//!
//! A projection `G: coef_in -> coef_out` performs one full Gauss-Seidel sweep
//! over the groupings. Repeated application converges to the least-squares
//! fixed-effect coefficients; [`IronsTuckGrand`](super::accelerator::IronsTuckGrand)
//! drives the iteration.
//!
//! # Sweep order
//!
//! Groupings are swept from the last to the first (in internal order, which is
//! input order unless `reorder_fe` is set). The last grouping is recomputed
//! from the others at the start of every sweep, so its entries in `coef_in`
//! are never read and are left out of convergence checks and extrapolation.

use smallvec::SmallVec;

use super::sweep::BlockSweeper;
use crate::demean::types::DemeanContext;

/// A projection step of the centering iteration.
pub trait Projector {
    /// Total number of coefficients this projector operates on.
    fn coef_len(&self) -> usize;

    /// Project coefficients: `coef_in → coef_out`.
    fn project(&mut self, coef_in: &[f64], coef_out: &mut [f64]);

    /// Sum of squared residuals of the input given `coef`.
    fn compute_ssr(&mut self, coef: &[f64]) -> f64;

    /// Length of the coefficient prefix that carries the iteration state.
    fn convergence_len(&self) -> usize;
}

/// Gauss-Seidel projector over the first `n_dims` internal groupings.
///
/// `n_dims` is the full grouping count for ordinary iterations and 2 for the
/// sub-convergence phase of the multi-grouping strategy.
pub struct GaussSeidelProjector<'a> {
    ctx: &'a DemeanContext,
    input: &'a [f64],
    n_dims: usize,
    coef_len: usize,
    /// Sweepers in processing order (last grouping first).
    sweepers: SmallVec<[BlockSweeper<'a>; 4]>,
    scratch: Vec<f64>,
}

impl<'a> GaussSeidelProjector<'a> {
    #[inline]
    pub fn new(ctx: &'a DemeanContext, coef_sums: &'a [f64], input: &'a [f64], n_dims: usize) -> Self {
        debug_assert!(n_dims >= 2 && n_dims <= ctx.n_fe());
        let coef_len = ctx.n_coef_leading(n_dims);
        debug_assert!(coef_sums.len() >= coef_len);

        let sweepers = (0..n_dims)
            .rev()
            .map(|q| BlockSweeper::new(ctx, coef_sums, q, n_dims))
            .collect();

        Self {
            ctx,
            input,
            n_dims,
            coef_len,
            sweepers,
            scratch: vec![0.0; coef_len],
        }
    }
}

impl Projector for GaussSeidelProjector<'_> {
    #[inline(always)]
    fn coef_len(&self) -> usize {
        self.coef_len
    }

    #[inline(always)]
    fn project(&mut self, coef_in: &[f64], coef_out: &mut [f64]) {
        for sweeper in &self.sweepers {
            sweeper.sweep(coef_in, coef_out);
        }
    }

    fn compute_ssr(&mut self, coef: &[f64]) -> f64 {
        // Make the last grouping consistent with the others first.
        self.scratch.copy_from_slice(&coef[..self.coef_len]);
        self.sweepers[0].sweep(coef, &mut self.scratch);

        let mut fitted = vec![0.0; self.input.len()];
        self.ctx
            .apply_design_matrix_leading(&self.scratch, &mut fitted, self.n_dims);
        self.input
            .iter()
            .zip(&fitted)
            .map(|(&y, &f)| (y - f) * (y - f))
            .sum()
    }

    #[inline(always)]
    fn convergence_len(&self) -> usize {
        self.ctx.fe_infos[self.n_dims - 1].coef_start
    }
}
