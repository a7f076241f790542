//! Fixed-effect centering by accelerated alternating projections.
//!
//! Removes every grouping (intercepts and level-specific slopes) from a set of
//! columns by weighted least squares, iterating in coefficient space.
//!
//! # Module structure
//!
//! - `types`: [`DemeanContext`] (grouping structure, scatter/gather),
//!   [`CenteringConfig`], [`CenteredColumns`]
//! - `projection`: the `Projector` trait and the Gauss-Seidel projector
//! - `accelerator`: Irons-Tuck + grand acceleration
//! - `demeaner`: strategies by grouping count
//!
//! # Dispatch on the number of groupings
//! - 1: closed form in one pass
//! - 2: coefficient-space iteration with Irons-Tuck and grand acceleration
//! - 3+: warmup, 2-grouping sub-convergence, re-acceleration

pub(crate) mod accelerator;
pub(crate) mod demeaner;
pub(crate) mod projection;
mod sweep;
pub(crate) mod types;

use demeaner::{Demeaner, MultiWay, OneWay, TwoWay};
pub use types::{CenteredColumns, CenteringConfig, DemeanContext};
use types::{ConvergenceState, DemeanResult};

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Strategy for the grouping count of a context. `map_init` builds one per
/// worker so its buffers are reused for every column that worker centers.
enum Strategy<'a> {
    One(OneWay<'a>),
    Two(TwoWay<'a>),
    Multi(MultiWay<'a>),
}

impl<'a> Strategy<'a> {
    fn for_context(ctx: &'a DemeanContext, config: &'a CenteringConfig) -> Self {
        match ctx.n_fe() {
            1 => Strategy::One(OneWay::new(ctx)),
            2 => Strategy::Two(TwoWay::new(ctx, config)),
            _ => Strategy::Multi(MultiWay::new(ctx, config)),
        }
    }

    fn solve(&mut self, column: &[f64]) -> DemeanResult {
        match self {
            Strategy::One(d) => d.solve(column),
            Strategy::Two(d) => d.solve(column),
            Strategy::Multi(d) => d.solve(column),
        }
    }
}

/// Center every column of `x` on the groupings of `ctx`, columns in parallel.
///
/// Columns that hit the iteration cap keep their last iterate and are marked
/// in [`CenteredColumns::converged`].
pub fn center(x: ArrayView2<f64>, ctx: &DemeanContext, config: &CenteringConfig) -> CenteredColumns {
    let (n_obs, n_cols) = x.dim();
    debug_assert_eq!(n_obs, ctx.n_obs());

    let per_column: Vec<DemeanResult> = (0..n_cols)
        .into_par_iter()
        .map_init(
            || Strategy::for_context(ctx, config),
            |strategy, j| {
                let column = x.column(j);
                match column.as_slice() {
                    Some(values) => strategy.solve(values),
                    None => strategy.solve(&column.to_vec()),
                }
            },
        )
        .collect();

    let mut out = CenteredColumns {
        demeaned: Array2::zeros((n_obs, n_cols)),
        fe_coefficients: Array2::zeros((ctx.n_coef(), n_cols)),
        converged: Vec::with_capacity(n_cols),
        iterations: Vec::with_capacity(n_cols),
    };
    for (j, result) in per_column.into_iter().enumerate() {
        out.demeaned.column_mut(j).assign(&ndarray::aview1(&result.demeaned));
        out.fe_coefficients
            .column_mut(j)
            .assign(&ndarray::aview1(&result.fe_coefficients));
        out.converged.push(result.convergence == ConvergenceState::Converged);
        out.iterations.push(result.iterations);
    }

    let stalled = out.n_unconverged();
    if stalled > 0 {
        log::debug!(
            "centering: {stalled} of {n_cols} column(s) hit the iteration cap ({})",
            config.maxiter
        );
    }
    out
}

/// Center a single column.
pub fn center_column(values: &[f64], ctx: &DemeanContext, config: &CenteringConfig) -> CenteredColumns {
    let column = ndarray::aview1(values).insert_axis(Axis(1));
    center(column, ctx, config)
}

/// Stack columns side by side: `[a | b | ...]`.
pub(crate) fn hstack(blocks: &[ArrayView2<f64>]) -> Array2<f64> {
    let n = blocks.first().map_or(0, |b| b.nrows());
    let k: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = Array2::<f64>::zeros((n, k));
    let mut start = 0;
    for b in blocks {
        out.slice_mut(ndarray::s![.., start..start + b.ncols()]).assign(b);
        start += b.ncols();
    }
    out
}
