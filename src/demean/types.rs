//! Core data types for fixed-effect centering.
//!
//! # Two spaces
//!
//! - **Observation space**: length N, the input columns and the residuals.
//! - **Coefficient space**: one coefficient per level per grouping, stored flat
//!   as `[g0_level0, ..., g0_levelL0, g1_level0, ...]`.
//!
//! An intercept grouping maps level `g` to `c[g]`; a slope grouping maps it to
//! `c[g] * z_i`. Everything below is written for the general case, with the
//! covariate taken as 1 for intercept groupings.
//!
//! # Core operations
//!
//! 1. **Scatter** (obs → coef): `Dᵀ W v`, weighted per-level sums.
//! 2. **Gather** (coef → obs): `D c`, each observation's combined effect.

use ndarray::Array2;

use crate::design::GroupingSpec;
use crate::error::{EngineError, EngineResult};
use crate::reduce;

/// Problem shape.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Dimensions {
    pub n_obs: usize,
    /// Number of groupings.
    pub n_fe: usize,
    /// Sum of level counts over all groupings.
    pub n_coef: usize,
}

/// Per-grouping data used in the sweeps.
#[derive(Clone, Debug)]
pub(crate) struct FixedEffectInfo {
    pub n_groups: usize,
    /// Offset of this grouping in coefficient arrays.
    pub coef_start: usize,
    pub group_ids: Vec<usize>,
    /// Slope covariate `z`; `None` for an intercept grouping.
    pub covariate: Option<Vec<f64>>,
    /// `w_i z_i` per observation; `None` when every factor is 1.
    pub scatter_scale: Option<Vec<f64>>,
    /// `1 / Σ_{i∈g} w_i z_i²`, with empty levels set to 1.
    pub inv_group_weights: Vec<f64>,
}

impl FixedEffectInfo {
    #[inline(always)]
    pub fn covariate_at(&self, i: usize) -> f64 {
        match &self.covariate {
            None => 1.0,
            Some(z) => z[i],
        }
    }

    #[inline(always)]
    pub fn scale_at(&self, i: usize) -> f64 {
        match &self.scatter_scale {
            None => 1.0,
            Some(s) => s[i],
        }
    }

    #[inline]
    pub fn coef_range(&self) -> std::ops::Range<usize> {
        self.coef_start..self.coef_start + self.n_groups
    }
}

/// Grouping structure and weights shared by every column centered together.
///
/// Built once per set of weights; IRLS rebuilds it whenever the working
/// weights change.
#[derive(Debug)]
pub struct DemeanContext {
    pub(crate) dims: Dimensions,
    pub(crate) fe_infos: Vec<FixedEffectInfo>,
    /// `fe_order[q]` is the input position of internal grouping `q`.
    pub(crate) fe_order: Vec<usize>,
}

impl DemeanContext {
    /// Build the context from the groupings of a design.
    ///
    /// `reorder_fe` sorts groupings by level count (largest first) for the
    /// sweeps; coefficients are always returned in input order.
    pub fn new(
        groupings: &[GroupingSpec],
        weights: Option<&[f64]>,
        reorder_fe: bool,
    ) -> EngineResult<Self> {
        let n_fe = groupings.len();
        if n_fe == 0 {
            return Err(EngineError::InvalidDesign(
                "centering needs at least one grouping".into(),
            ));
        }
        let n_obs = groupings[0].index.len();
        if n_obs == 0 {
            return Err(EngineError::InvalidDesign("no observations to center".into()));
        }
        if let Some(g) = groupings.iter().find(|g| g.index.len() != n_obs) {
            return Err(EngineError::InvalidDesign(format!(
                "grouping '{}' has length {}, expected {n_obs}",
                g.name,
                g.index.len()
            )));
        }
        if let Some(w) = weights {
            if w.len() != n_obs {
                return Err(EngineError::InvalidDesign(format!(
                    "weights have length {}, expected {n_obs}",
                    w.len()
                )));
            }
        }

        let order: Vec<usize> = if reorder_fe && n_fe > 1 {
            let mut indices: Vec<usize> = (0..n_fe).collect();
            indices.sort_by_key(|&q| std::cmp::Reverse(groupings[q].n_levels()));
            indices
        } else {
            (0..n_fe).collect()
        };

        let mut fe_infos = Vec::with_capacity(n_fe);
        let mut coef_start = 0;
        for &original in &order {
            let spec = &groupings[original];
            let info = Self::build_info(spec, weights, coef_start);
            coef_start += info.n_groups;
            fe_infos.push(info);
        }

        Ok(Self {
            dims: Dimensions {
                n_obs,
                n_fe,
                n_coef: coef_start,
            },
            fe_infos,
            fe_order: order,
        })
    }

    fn build_info(spec: &GroupingSpec, weights: Option<&[f64]>, coef_start: usize) -> FixedEffectInfo {
        let n_groups = spec.n_levels();
        let group_ids = spec.index.ids().to_vec();
        let covariate = spec.slope.clone();

        let scatter_scale: Option<Vec<f64>> = match (weights, covariate.as_deref()) {
            (None, None) => None,
            (Some(w), None) => Some(w.to_vec()),
            (None, Some(z)) => Some(z.to_vec()),
            (Some(w), Some(z)) => Some(w.iter().zip(z).map(|(&wi, &zi)| wi * zi).collect()),
        };

        // Σ w z² per level = Σ (w z) · z
        let mut group_weights = vec![0.0; n_groups];
        for (i, &g) in group_ids.iter().enumerate() {
            let s = scatter_scale.as_ref().map_or(1.0, |s| s[i]);
            let z = covariate.as_ref().map_or(1.0, |z| z[i]);
            group_weights[g] += s * z;
        }

        // Levels without weight have no observation touching them
        let inv_group_weights = group_weights
            .iter()
            .map(|&w| if w > 0.0 { 1.0 / w } else { 1.0 })
            .collect();

        FixedEffectInfo {
            n_groups,
            coef_start,
            group_ids,
            covariate,
            scatter_scale,
            inv_group_weights,
        }
    }

    #[inline]
    pub fn n_obs(&self) -> usize {
        self.dims.n_obs
    }

    #[inline]
    pub fn n_fe(&self) -> usize {
        self.dims.n_fe
    }

    #[inline]
    pub fn n_coef(&self) -> usize {
        self.dims.n_coef
    }

    /// Coefficient-space length of the first `n_dims` internal groupings.
    #[inline]
    pub(crate) fn n_coef_leading(&self, n_dims: usize) -> usize {
        self.fe_infos[..n_dims].iter().map(|fe| fe.n_groups).sum()
    }

    /// Apply the transpose of the design: `out = Dᵀ W values`.
    ///
    /// With 4 observations, 2 firms and 2 years (unit weights):
    ///
    /// ```text
    /// values = [10, 20, 30, 40]
    /// firm   = [ 0,  0,  1,  1]
    /// year   = [ 0,  1,  0,  1]
    ///
    /// out = [30, 70, 40, 60]
    /// ```
    #[inline]
    pub fn apply_design_matrix_t(&self, values: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.dims.n_coef);
        self.apply_design_matrix_t_leading(values, out, self.dims.n_fe);
    }

    /// Scatter for the first `n_dims` internal groupings only.
    pub(crate) fn apply_design_matrix_t_leading(&self, values: &[f64], out: &mut [f64], n_dims: usize) {
        for fe in &self.fe_infos[..n_dims] {
            reduce::group_sums(
                values,
                fe.scatter_scale.as_deref(),
                &fe.group_ids,
                &mut out[fe.coef_range()],
            );
        }
    }

    /// Accumulate the design times `coef` into `output`: `output += D c`.
    #[inline]
    pub fn apply_design_matrix(&self, coef: &[f64], output: &mut [f64]) {
        self.apply_design_matrix_leading(coef, output, self.dims.n_fe);
    }

    /// Gather for the first `n_dims` internal groupings only.
    pub(crate) fn apply_design_matrix_leading(&self, coef: &[f64], output: &mut [f64], n_dims: usize) {
        for fe in &self.fe_infos[..n_dims] {
            let level_coef = &coef[fe.coef_range()];
            match &fe.covariate {
                None => {
                    for (o, &g) in output.iter_mut().zip(&fe.group_ids) {
                        *o += level_coef[g];
                    }
                }
                Some(z) => {
                    for ((o, &g), &zi) in output.iter_mut().zip(&fe.group_ids).zip(z) {
                        *o += level_coef[g] * zi;
                    }
                }
            }
        }
    }

    /// Reorder coefficients from internal order back to input order.
    #[must_use]
    pub fn reorder_coef_to_original(&self, coef: &[f64]) -> Vec<f64> {
        let n_fe = self.dims.n_fe;
        let mut internal_idx = vec![0usize; n_fe];
        for (q, &orig) in self.fe_order.iter().enumerate() {
            internal_idx[orig] = q;
        }

        let mut out = Vec::with_capacity(self.dims.n_coef);
        for &q in &internal_idx {
            out.extend_from_slice(&coef[self.fe_infos[q].coef_range()]);
        }
        out
    }

    /// `(coef_start, n_levels)` of each grouping in input order, matching the
    /// layout of [`reorder_coef_to_original`](Self::reorder_coef_to_original).
    pub fn original_layout(&self) -> Vec<(usize, usize)> {
        let mut n_groups = vec![0usize; self.dims.n_fe];
        for (q, &orig) in self.fe_order.iter().enumerate() {
            n_groups[orig] = self.fe_infos[q].n_groups;
        }
        let mut start = 0;
        n_groups
            .into_iter()
            .map(|n| {
                let entry = (start, n);
                start += n;
                entry
            })
            .collect()
    }
}

/// Centering parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CenteringConfig {
    /// Convergence tolerance on coefficient changes.
    pub tol: f64,
    /// Iteration cap.
    pub maxiter: usize,
    /// All-grouping iterations before 2-grouping sub-convergence (3+ groupings).
    pub iter_warmup: usize,
    /// Iteration from which an extra projection follows each extrapolation.
    pub iter_proj_after_acc: usize,
    /// Iterations between grand-acceleration snapshots.
    pub iter_grand_acc: usize,
    /// Iterations between SSR convergence checks.
    pub ssr_check_interval: usize,
    /// Sweep groupings by decreasing level count.
    pub reorder_fe: bool,
    /// Irons-Tuck extrapolation; plain Gauss-Seidel sweeps when false.
    pub accelerate: bool,
}

impl Default for CenteringConfig {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            maxiter: 10_000,
            iter_warmup: 15,
            iter_proj_after_acc: 40,
            iter_grand_acc: 4,
            ssr_check_interval: 40,
            reorder_fe: false,
            accelerate: true,
        }
    }
}

/// Whether an iteration has converged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum ConvergenceState {
    Converged,
    #[default]
    NotConverged,
}

/// Centering result for one column.
#[derive(Debug, Clone)]
pub(crate) struct DemeanResult {
    pub demeaned: Vec<f64>,
    /// Per-level coefficients in input grouping order.
    pub fe_coefficients: Vec<f64>,
    pub convergence: ConvergenceState,
    /// 0 for the closed-form single-grouping case.
    pub iterations: usize,
}

/// Result of centering several columns together.
#[derive(Debug, Clone)]
pub struct CenteredColumns {
    /// Centered columns, `(n_obs, n_columns)`.
    pub demeaned: Array2<f64>,
    /// Per-level coefficients, `(n_coef, n_columns)`, input grouping order.
    pub fe_coefficients: Array2<f64>,
    pub converged: Vec<bool>,
    pub iterations: Vec<usize>,
}

impl CenteredColumns {
    pub fn all_converged(&self) -> bool {
        self.converged.iter().all(|&c| c)
    }

    pub fn n_unconverged(&self) -> usize {
        self.converged.iter().filter(|&&c| !c).count()
    }

    pub fn max_iterations(&self) -> usize {
        self.iterations.iter().copied().max().unwrap_or(0)
    }
}
