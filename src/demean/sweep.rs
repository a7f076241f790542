//! Block update of one grouping inside a Gauss-Seidel sweep.

use smallvec::SmallVec;

use crate::demean::types::{DemeanContext, FixedEffectInfo};

/// Read access to another grouping's coefficients.
#[derive(Clone, Copy)]
struct OtherFe<'a> {
    coef_start: usize,
    group_ids: &'a [usize],
    covariate: Option<&'a [f64]>,
}

impl OtherFe<'_> {
    #[inline(always)]
    fn effect(&self, coef: &[f64], offset: usize, i: usize) -> f64 {
        let c = coef[self.coef_start - offset + self.group_ids[i]];
        match self.covariate {
            None => c,
            Some(z) => c * z[i],
        }
    }
}

/// Updates the coefficients of grouping `q` given all the others:
///
/// ```text
/// c_q[g] = (Σ_{i∈g} w_i z_qi y_i − Σ_{i∈g} w_i z_qi Σ_{h≠q} c_h[g_h(i)] z_hi) / Σ_{i∈g} w_i z_qi²
/// ```
///
/// Sweeps run from the last grouping to the first, so groupings before `q`
/// are read from `coef_in` and groupings after `q` (already updated in this
/// sweep) from `coef_out`.
pub(super) struct BlockSweeper<'a> {
    fe: &'a FixedEffectInfo,
    /// `Dᵀ W y` restricted to this grouping.
    coef_sums: &'a [f64],
    before: SmallVec<[OtherFe<'a>; 4]>,
    after: SmallVec<[OtherFe<'a>; 4]>,
}

impl<'a> BlockSweeper<'a> {
    /// Sweeper for internal grouping `q`, coupled to groupings `0..n_dims`.
    pub fn new(ctx: &'a DemeanContext, coef_sums: &'a [f64], q: usize, n_dims: usize) -> Self {
        let fe = &ctx.fe_infos[q];
        let other = |h: usize| {
            let fe_h = &ctx.fe_infos[h];
            OtherFe {
                coef_start: fe_h.coef_start,
                group_ids: &fe_h.group_ids,
                covariate: fe_h.covariate.as_deref(),
            }
        };
        Self {
            fe,
            coef_sums: &coef_sums[fe.coef_range()],
            before: (0..q).map(other).collect(),
            after: ((q + 1)..n_dims).map(other).collect(),
        }
    }

    #[inline]
    pub fn sweep(&self, coef_in: &[f64], coef_out: &mut [f64]) {
        let end = self.fe.coef_start + self.fe.n_groups;
        // Later groupings live strictly after this block.
        let (head, tail) = coef_out.split_at_mut(end);
        let out = &mut head[self.fe.coef_start..];
        out.copy_from_slice(self.coef_sums);

        for (i, &g) in self.fe.group_ids.iter().enumerate() {
            let mut other = 0.0;
            for fe in &self.before {
                other += fe.effect(coef_in, 0, i);
            }
            for fe in &self.after {
                other += fe.effect(tail, end, i);
            }
            out[g] -= self.fe.scale_at(i) * other;
        }

        for (o, &inv) in out.iter_mut().zip(&self.fe.inv_group_weights) {
            *o *= inv;
        }
    }
}
