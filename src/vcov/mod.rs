//! Covariance of the slope coefficients.
//!
//! All estimators share the bread `(X̃ᵗWX̃)⁻¹` of the final solve and the
//! scores `s_i = w_i x̃_i r_i` (working weights and working residuals for
//! iterative fits):
//!
//! - `Iid`: `φ · bread`
//! - `Hetero`: `n/(n−K) · bread (Σ s_i s_iᵗ) bread`
//! - `Cluster`: `(n−1)/(n−K) · Σ_S ±c_S · bread M_S bread`, summed over every
//!   non-empty set `S` of cluster dimensions with sign `(−1)^(|S|+1)`; `M_S`
//!   is the meat of the intersection of the dimensions in `S` and
//!   `c_S = G/(G−1)`.

pub mod crv;

use ndarray::{Array2, ArrayView2, Axis};

use crate::design::{ClusterSpec, GroupingSpec};
use crate::error::EngineResult;
use crate::group_index::{count_fixef_fully_nested, GroupIndex};

/// Requested covariance type.
#[derive(Debug, Clone, Default)]
pub enum VcovSpec {
    #[default]
    Iid,
    Hetero,
    Cluster(ClusterSpec),
}

impl VcovSpec {
    pub fn name(&self) -> &'static str {
        match self {
            VcovSpec::Iid => "iid",
            VcovSpec::Hetero => "hetero",
            VcovSpec::Cluster(c) if c.n_dims() == 1 => "CRV1",
            VcovSpec::Cluster(_) => "multiway CRV1",
        }
    }

    pub(crate) fn subset(&self, mask: &[bool]) -> Self {
        match self {
            VcovSpec::Cluster(c) => VcovSpec::Cluster(c.subset(mask)),
            other => other.clone(),
        }
    }
}

/// How absorbed fixed-effect levels enter the parameter count `K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixefK {
    /// Fixed effects are not counted.
    None,
    /// Fixed effects nested in a cluster variable are not counted.
    #[default]
    Nested,
    /// Every identified fixed-effect level is counted.
    Full,
}

/// Which `G` enters `G/(G−1)` for multi-way clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterDf {
    /// Each term uses its own number of clusters.
    Conventional,
    /// Every term uses the smallest number of clusters.
    #[default]
    Min,
}

/// Small-sample correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallSampleCorrection {
    /// Apply `(n−1)/(n−K)` (clustered) or `n/(n−K)` (hetero).
    pub adj: bool,
    pub fixef_k: FixefK,
    /// Apply `G/(G−1)`.
    pub cluster_adj: bool,
    pub cluster_df: ClusterDf,
}

impl Default for SmallSampleCorrection {
    fn default() -> Self {
        Self {
            adj: true,
            fixef_k: FixefK::default(),
            cluster_adj: true,
            cluster_df: ClusterDf::default(),
        }
    }
}

/// Inputs shared by all covariance types.
pub(crate) struct VcovInput<'a> {
    /// Centered regressors of the kept columns.
    pub x: ArrayView2<'a, f64>,
    pub residuals: &'a [f64],
    pub weights: Option<&'a [f64]>,
    /// `(X̃ᵗWX̃)⁻¹`.
    pub bread: &'a Array2<f64>,
    pub dispersion: f64,
    pub groupings: &'a [GroupingSpec],
}

/// Covariance over the kept coefficients.
#[derive(Debug, Clone)]
pub struct Covariance {
    pub matrix: Array2<f64>,
    /// Parameter count `K` used by the small-sample correction.
    pub df_k: usize,
    /// Clusters per dimension (empty unless clustered).
    pub n_clusters: Vec<usize>,
    /// Degrees of freedom of t statistics.
    pub df_t: f64,
    /// A variance came out negative.
    pub non_psd: bool,
}

/// Absorbed fixed-effect parameters: the levels of every counted grouping,
/// minus one reference per counted intercept grouping beyond the first.
pub(crate) fn fixef_dof(groupings: &[GroupingSpec], clusters: Option<&ClusterSpec>, mode: FixefK) -> usize {
    let nested: Vec<bool> = match (mode, clusters) {
        (FixefK::None, _) => return 0,
        (FixefK::Nested, Some(c)) => {
            let names: Vec<String> = groupings.iter().map(|g| g.name.clone()).collect();
            let ids: Vec<&[usize]> = groupings.iter().map(|g| g.index.ids()).collect();
            let cluster_ids: Vec<&[usize]> = c.indices().iter().map(|i| i.ids()).collect();
            count_fixef_fully_nested(&names, &ids, c.names(), &cluster_ids).0
        }
        _ => vec![false; groupings.len()],
    };

    let mut levels = 0usize;
    let mut intercepts = 0usize;
    for (g, &is_nested) in groupings.iter().zip(&nested) {
        if is_nested {
            continue;
        }
        levels += g.n_levels();
        if !g.is_slope() {
            intercepts += 1;
        }
    }
    levels - intercepts.saturating_sub(1)
}

fn scores(input: &VcovInput) -> Array2<f64> {
    let mut s = input.x.to_owned();
    for (i, mut row) in s.axis_iter_mut(Axis(0)).enumerate() {
        let w = input.weights.map_or(1.0, |w| w[i]);
        row *= w * input.residuals[i];
    }
    s
}

fn sandwich(bread: &Array2<f64>, meat: &Array2<f64>) -> Array2<f64> {
    bread.dot(meat).dot(bread)
}

/// Covariance of the kept coefficients.
pub(crate) fn compute(
    spec: &VcovSpec,
    input: &VcovInput,
    ssc: &SmallSampleCorrection,
) -> EngineResult<Covariance> {
    let n = input.x.nrows();
    let k = input.x.ncols();
    let clusters = match spec {
        VcovSpec::Cluster(c) => Some(c),
        _ => None,
    };
    let df_k = k + fixef_dof(input.groupings, clusters, ssc.fixef_k);
    let dof = n.saturating_sub(df_k).max(1) as f64;

    let (matrix, n_clusters, df_t) = match spec {
        VcovSpec::Iid => (input.bread * input.dispersion, Vec::new(), dof),
        VcovSpec::Hetero => {
            let s = scores(input);
            let meat = crate::reduce::cross_product(s.view(), None);
            let adj = if ssc.adj { n as f64 / dof } else { 1.0 };
            (sandwich(input.bread, &meat) * adj, Vec::new(), dof)
        }
        VcovSpec::Cluster(c) => {
            let s = scores(input);
            let n_clusters: Vec<usize> = c.indices().iter().map(|i| i.n_levels()).collect();
            let g_min = n_clusters.iter().copied().min().unwrap_or(1);
            let adj = if ssc.adj { (n as f64 - 1.0) / dof } else { 1.0 };

            let mut total = Array2::<f64>::zeros((k, k));
            for (members, index) in intersections(c.indices())? {
                let g = index.n_levels();
                let meat = crv::cluster_meat(s.view(), index.ids(), g);
                let g_adj = match ssc.cluster_df {
                    ClusterDf::Conventional => g,
                    ClusterDf::Min => g_min,
                };
                let factor = if ssc.cluster_adj && g_adj > 1 {
                    g_adj as f64 / (g_adj as f64 - 1.0)
                } else {
                    1.0
                };
                let sign = if members % 2 == 1 { 1.0 } else { -1.0 };
                total.scaled_add(sign * factor, &sandwich(input.bread, &meat));
            }
            (total * adj, n_clusters, (g_min.max(2) - 1) as f64)
        }
    };

    let non_psd = matrix.diag().iter().any(|&v| v < 0.0);
    if non_psd {
        log::warn!("{} covariance has a negative variance", spec.name());
    }

    Ok(Covariance {
        matrix,
        df_k,
        n_clusters,
        df_t,
        non_psd,
    })
}

/// Every non-empty intersection of the cluster dimensions, with the number of
/// dimensions it combines.
fn intersections(dims: &[GroupIndex]) -> EngineResult<Vec<(usize, GroupIndex)>> {
    let mut out = Vec::with_capacity((1 << dims.len()) - 1);
    for subset in 1usize..(1 << dims.len()) {
        let mut members = (0..dims.len()).filter(|d| subset & (1 << d) != 0);
        let first = match members.next() {
            Some(d) => d,
            None => continue,
        };
        let mut index = dims[first].clone();
        let mut count = 1;
        for d in members {
            index = GroupIndex::combine(&index, &dims[d])?;
            count += 1;
        }
        out.push((count, index));
    }
    Ok(out)
}
