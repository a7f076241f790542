//! Numeric model design handed to the engine.

use ndarray::{Array1, Array2, Axis};

use crate::error::{EngineError, EngineResult};
use crate::group_index::GroupIndex;

/// One categorical grouping of the observations.
///
/// Without a slope covariate the grouping contributes one intercept per level.
/// With a slope covariate `z` it contributes `c[g] * z_i` instead, i.e. a
/// level-specific slope on `z` (add the plain grouping as well to also get
/// level intercepts).
#[derive(Debug, Clone)]
pub struct GroupingSpec {
    pub name: String,
    pub index: GroupIndex,
    pub slope: Option<Vec<f64>>,
    /// Built by [`GroupingSpec::combine`].
    pub combined: bool,
}

impl GroupingSpec {
    pub fn new(name: impl Into<String>, index: GroupIndex) -> Self {
        Self {
            name: name.into(),
            index,
            slope: None,
            combined: false,
        }
    }

    pub fn with_slope(
        name: impl Into<String>,
        index: GroupIndex,
        covariate: Vec<f64>,
    ) -> EngineResult<Self> {
        let name = name.into();
        if covariate.len() != index.len() {
            return Err(EngineError::InvalidDesign(format!(
                "slope covariate of '{name}' has length {}, expected {}",
                covariate.len(),
                index.len()
            )));
        }
        if covariate.iter().any(|z| !z.is_finite()) {
            return Err(EngineError::InvalidDesign(format!(
                "slope covariate of '{name}' contains non-finite values"
            )));
        }
        Ok(Self {
            name,
            index,
            slope: Some(covariate),
            combined: false,
        })
    }

    /// Interaction of two intercept groupings, named `a^b`.
    pub fn combine(a: &GroupingSpec, b: &GroupingSpec) -> EngineResult<Self> {
        if a.is_slope() || b.is_slope() {
            return Err(EngineError::InvalidDesign(format!(
                "cannot combine slope grouping into '{}^{}'",
                a.name, b.name
            )));
        }
        Ok(Self {
            name: format!("{}^{}", a.name, b.name),
            index: GroupIndex::combine(&a.index, &b.index)?,
            slope: None,
            combined: true,
        })
    }

    #[inline]
    pub fn is_slope(&self) -> bool {
        self.slope.is_some()
    }

    #[inline]
    pub fn n_levels(&self) -> usize {
        self.index.n_levels()
    }

    fn subset(&self, mask: &[bool]) -> Self {
        Self {
            name: self.name.clone(),
            index: self.index.subset(mask),
            slope: self.slope.as_ref().map(|z| keep_rows(z, mask)),
            combined: self.combined,
        }
    }
}

/// Cluster variables used by the covariance estimator (1 to 4 dimensions).
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    names: Vec<String>,
    indices: Vec<GroupIndex>,
}

impl ClusterSpec {
    pub const MAX_DIMS: usize = 4;

    pub fn new(dims: Vec<(String, GroupIndex)>) -> EngineResult<Self> {
        if dims.is_empty() || dims.len() > Self::MAX_DIMS {
            return Err(EngineError::InvalidDesign(format!(
                "clustering supports 1 to {} dimensions, got {}",
                Self::MAX_DIMS,
                dims.len()
            )));
        }
        let n = dims[0].1.len();
        if let Some((name, _)) = dims.iter().find(|(_, idx)| idx.len() != n) {
            return Err(EngineError::InvalidDesign(format!(
                "cluster '{name}' length differs from the first cluster ({n})"
            )));
        }
        let (names, indices) = dims.into_iter().unzip();
        Ok(Self { names, indices })
    }

    /// One-way clustering.
    pub fn one_way(name: impl Into<String>, index: GroupIndex) -> Self {
        Self {
            names: vec![name.into()],
            indices: vec![index],
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn indices(&self) -> &[GroupIndex] {
        &self.indices
    }

    pub fn n_dims(&self) -> usize {
        self.indices.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.indices.first().map_or(0, |i| i.len())
    }

    pub(crate) fn subset(&self, mask: &[bool]) -> Self {
        Self {
            names: self.names.clone(),
            indices: self.indices.iter().map(|i| i.subset(mask)).collect(),
        }
    }
}

/// Response, regressors, groupings, weights and offset of one model.
#[derive(Debug, Clone)]
pub struct Design {
    y: Array1<f64>,
    x: Array2<f64>,
    x_names: Vec<String>,
    groupings: Vec<GroupingSpec>,
    weights: Option<Array1<f64>>,
    offset: Option<Array1<f64>>,
}

impl Design {
    pub fn new(y: Array1<f64>, x: Array2<f64>, x_names: Vec<String>) -> EngineResult<Self> {
        let n = y.len();
        if n == 0 {
            return Err(EngineError::InvalidDesign("no observations".into()));
        }
        if x.nrows() != n {
            return Err(EngineError::InvalidDesign(format!(
                "regressor matrix has {} rows, response has {n}",
                x.nrows()
            )));
        }
        if x_names.len() != x.ncols() {
            return Err(EngineError::InvalidDesign(format!(
                "{} regressor names for {} columns",
                x_names.len(),
                x.ncols()
            )));
        }
        check_finite("response", y.iter())?;
        check_finite("regressors", x.iter())?;
        Ok(Self {
            y,
            x,
            x_names,
            groupings: Vec::new(),
            weights: None,
            offset: None,
        })
    }

    pub fn with_groupings(mut self, groupings: Vec<GroupingSpec>) -> EngineResult<Self> {
        let n = self.n_obs();
        if let Some(g) = groupings.iter().find(|g| g.index.len() != n) {
            return Err(EngineError::InvalidDesign(format!(
                "grouping '{}' has length {}, expected {n}",
                g.name,
                g.index.len()
            )));
        }
        self.groupings = groupings;
        Ok(self)
    }

    pub fn with_weights(mut self, weights: Array1<f64>) -> EngineResult<Self> {
        if weights.len() != self.n_obs() {
            return Err(EngineError::InvalidDesign(format!(
                "weights have length {}, expected {}",
                weights.len(),
                self.n_obs()
            )));
        }
        if weights.iter().any(|&w| !w.is_finite() || w < 0.0) {
            return Err(EngineError::InvalidDesign(
                "weights must be finite and non-negative".into(),
            ));
        }
        // Contiguous storage, so `weight_slice` sees every weighting.
        self.weights = Some(weights.as_standard_layout().into_owned());
        Ok(self)
    }

    pub fn with_offset(mut self, offset: Array1<f64>) -> EngineResult<Self> {
        if offset.len() != self.n_obs() {
            return Err(EngineError::InvalidDesign(format!(
                "offset has length {}, expected {}",
                offset.len(),
                self.n_obs()
            )));
        }
        check_finite("offset", offset.iter())?;
        self.offset = Some(offset);
        Ok(self)
    }

    #[inline]
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    #[inline]
    pub fn n_regressors(&self) -> usize {
        self.x.ncols()
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn x_names(&self) -> &[String] {
        &self.x_names
    }

    pub fn groupings(&self) -> &[GroupingSpec] {
        &self.groupings
    }

    pub fn weights(&self) -> Option<&Array1<f64>> {
        self.weights.as_ref()
    }

    pub fn offset(&self) -> Option<&Array1<f64>> {
        self.offset.as_ref()
    }

    /// Prior weights as a slice, `None` when unweighted.
    pub(crate) fn weight_slice(&self) -> Option<&[f64]> {
        self.weights.as_ref().and_then(|w| w.as_slice())
    }

    /// Offset value of observation `i` (0 without offset).
    #[inline]
    pub(crate) fn offset_at(&self, i: usize) -> f64 {
        self.offset.as_ref().map_or(0.0, |o| o[i])
    }

    /// Response minus offset.
    pub(crate) fn adjusted_response(&self) -> Array1<f64> {
        match &self.offset {
            Some(o) => &self.y - o,
            None => self.y.clone(),
        }
    }

    /// Same observations and groupings with other regressors.
    pub(crate) fn with_regressors(&self, x: Array2<f64>, x_names: Vec<String>) -> Self {
        debug_assert_eq!(x.nrows(), self.n_obs());
        Self {
            x,
            x_names,
            ..self.clone()
        }
    }

    /// Same model with the offset replaced.
    pub(crate) fn with_offset_values(&self, offset: Array1<f64>) -> Self {
        debug_assert_eq!(offset.len(), self.n_obs());
        Self {
            offset: Some(offset),
            ..self.clone()
        }
    }

    /// Drop the grouping at `position`.
    pub(crate) fn without_grouping(&self, position: usize) -> Self {
        let mut out = self.clone();
        out.groupings.remove(position);
        out
    }

    /// Keep the rows flagged in `mask`; grouping levels are re-densified.
    pub(crate) fn subset(&self, mask: &[bool]) -> Self {
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        Self {
            y: self.y.select(Axis(0), &rows),
            x: self.x.select(Axis(0), &rows),
            x_names: self.x_names.clone(),
            groupings: self.groupings.iter().map(|g| g.subset(mask)).collect(),
            weights: self.weights.as_ref().map(|w| w.select(Axis(0), &rows)),
            offset: self.offset.as_ref().map(|o| o.select(Axis(0), &rows)),
        }
    }
}

fn check_finite<'a>(what: &str, mut values: impl Iterator<Item = &'a f64>) -> EngineResult<()> {
    if values.any(|v| !v.is_finite()) {
        return Err(EngineError::InvalidDesign(format!(
            "{what} contains non-finite values"
        )));
    }
    Ok(())
}

fn keep_rows(values: &[f64], mask: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(mask)
        .filter_map(|(&v, &keep)| keep.then_some(v))
        .collect()
}
