//! Python entry points, built with the `python` feature.

use ndarray::{Array1, ArrayView2, Axis};
use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::collinear::find_collinear_variables;
use crate::config::EngineConfig;
use crate::demean::{center, CenteringConfig, DemeanContext};
use crate::design::{ClusterSpec, Design, GroupingSpec};
use crate::driver::{estimate, ModelSpec};
use crate::error::EngineError;
use crate::family::Family;
use crate::group_index::{count_fixef_fully_nested, detect_singletons, GroupIndex};
use crate::vcov::{crv, VcovSpec};

impl From<EngineError> for PyErr {
    fn from(err: EngineError) -> PyErr {
        match err {
            EngineError::Diverged { .. }
            | EngineError::OptimizationFailed { .. }
            | EngineError::NonFiniteValue { .. }
            | EngineError::ThreadPool(_) => PyRuntimeError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

fn columns(data: ArrayView2<usize>) -> Vec<Vec<usize>> {
    data.axis_iter(Axis(1)).map(|c| c.to_vec()).collect()
}

fn groupings_from(flist: ArrayView2<usize>, names: Option<Vec<String>>) -> Vec<GroupingSpec> {
    columns(flist)
        .iter()
        .enumerate()
        .map(|(j, codes)| {
            let name = names
                .as_ref()
                .and_then(|n| n.get(j).cloned())
                .unwrap_or_else(|| format!("fe{j}"));
            GroupingSpec::new(name, GroupIndex::from_codes(codes))
        })
        .collect()
}

/// Center every column of `x` on the groupings in the columns of `flist`.
///
/// Returns the centered matrix and whether every column converged.
#[pyfunction]
#[pyo3(signature = (x, flist, weights, tol=1e-8, maxiter=100_000))]
pub fn _demean_rs(
    py: Python<'_>,
    x: PyReadonlyArray2<f64>,
    flist: PyReadonlyArray2<usize>,
    weights: PyReadonlyArray1<f64>,
    tol: f64,
    maxiter: usize,
) -> PyResult<(Py<PyArray2<f64>>, bool)> {
    let x_arr = x.as_array();
    let groupings = groupings_from(flist.as_array(), None);
    let weights = weights.as_array().to_vec();
    let config = CenteringConfig {
        tol,
        maxiter,
        ..CenteringConfig::default()
    };

    let centered = py.allow_threads(|| -> Result<_, EngineError> {
        let ctx = DemeanContext::new(&groupings, Some(&weights), false)?;
        Ok(center(x_arr, &ctx, &config))
    })?;

    let success = centered.all_converged();
    let pyarray = PyArray2::from_owned_array(py, centered.demeaned);
    Ok((pyarray.unbind(), success))
}

/// CRV1 meat `Σ_g s_g s_gᵗ` over the clusters in `clustid`.
#[pyfunction]
pub fn _crv1_meat_loop_rs(
    py: Python<'_>,
    scores: PyReadonlyArray2<f64>,
    clustid: PyReadonlyArray1<usize>,
    cluster_col: PyReadonlyArray1<usize>,
) -> PyResult<Py<PyArray2<f64>>> {
    let clustid = clustid.as_array().to_vec();
    let cluster_col = cluster_col.as_array().to_vec();
    let meat = crv::listed_cluster_meat(scores.as_array(), &clustid, &cluster_col);
    Ok(meat.into_pyarray(py).unbind())
}

/// Collinear columns of a cross-product matrix: (mask, count, all collinear).
#[pyfunction]
#[pyo3(signature = (x, tol=1e-10))]
pub fn _find_collinear_variables_rs(
    py: Python<'_>,
    x: PyReadonlyArray2<f64>,
    tol: f64,
) -> PyResult<(Py<PyArray1<bool>>, usize, bool)> {
    let result = find_collinear_variables(x.as_array(), tol, None)
        .map_err(|err| PyValueError::new_err(err.to_string()))?;
    Ok((
        result.excluded.into_pyarray(py).unbind(),
        result.n_excluded,
        result.all_collinear,
    ))
}

/// Which fixed effects are nested in a cluster variable: (mask, count).
#[pyfunction]
pub fn _count_fixef_fully_nested_all_rs(
    all_fixef_array: &Bound<'_, PyAny>,
    cluster_colnames: &Bound<'_, PyAny>,
    cluster_data: PyReadonlyArray2<usize>,
    fe_data: PyReadonlyArray2<usize>,
) -> PyResult<(Py<PyArray1<bool>>, usize)> {
    let py = all_fixef_array.py();
    let all_fe: Vec<String> = all_fixef_array.extract()?;
    let cluster_names: Vec<String> = cluster_colnames.extract()?;

    let fe_cols = columns(fe_data.as_array());
    let cluster_cols = columns(cluster_data.as_array());
    let fe_ids: Vec<&[usize]> = fe_cols.iter().map(Vec::as_slice).collect();
    let cluster_ids: Vec<&[usize]> = cluster_cols.iter().map(Vec::as_slice).collect();

    let (mask, count) = count_fixef_fully_nested(&all_fe, &fe_ids, &cluster_names, &cluster_ids);
    Ok((mask.into_pyarray(py).unbind(), count))
}

/// Observations alone in their level of some grouping, iterated to a fixed
/// point.
#[pyfunction]
pub fn _detect_singletons_rs(py: Python<'_>, ids: PyReadonlyArray2<u32>) -> Py<PyArray1<bool>> {
    let cols: Vec<Vec<usize>> = ids
        .as_array()
        .axis_iter(Axis(1))
        .map(|c| c.iter().map(|&v| v as usize).collect())
        .collect();
    let refs: Vec<&[usize]> = cols.iter().map(Vec::as_slice).collect();
    let mask = py.allow_threads(|| detect_singletons(&refs));
    mask.into_pyarray(py).unbind()
}

/// Fit a model and return its results as a dict.
#[pyfunction]
#[pyo3(signature = (
    y, x, x_names, flist=None, fe_names=None, weights=None, offset=None,
    family="gaussian", vcov="iid", clusters=None, tol=1e-8, maxiter=10_000,
    n_threads=None, drop_singletons=false
))]
#[allow(clippy::too_many_arguments)]
pub fn _fit_rs<'py>(
    py: Python<'py>,
    y: PyReadonlyArray1<f64>,
    x: PyReadonlyArray2<f64>,
    x_names: Vec<String>,
    flist: Option<PyReadonlyArray2<usize>>,
    fe_names: Option<Vec<String>>,
    weights: Option<PyReadonlyArray1<f64>>,
    offset: Option<PyReadonlyArray1<f64>>,
    family: &str,
    vcov: &str,
    clusters: Option<PyReadonlyArray2<usize>>,
    tol: f64,
    maxiter: usize,
    n_threads: Option<usize>,
    drop_singletons: bool,
) -> PyResult<Bound<'py, PyDict>> {
    let mut design = Design::new(y.as_array().to_owned(), x.as_array().to_owned(), x_names)?;
    if let Some(flist) = &flist {
        design = design.with_groupings(groupings_from(flist.as_array(), fe_names))?;
    }
    if let Some(w) = &weights {
        design = design.with_weights(w.as_array().to_owned())?;
    }
    if let Some(o) = &offset {
        design = design.with_offset(o.as_array().to_owned())?;
    }

    let vcov = match (vcov, &clusters) {
        ("iid", _) => VcovSpec::Iid,
        ("hetero" | "HC1", _) => VcovSpec::Hetero,
        ("cluster" | "CRV1", Some(c)) => {
            let dims = columns(c.as_array())
                .iter()
                .enumerate()
                .map(|(j, codes)| (format!("cluster{j}"), GroupIndex::from_codes(codes)))
                .collect();
            VcovSpec::Cluster(ClusterSpec::new(dims)?)
        }
        (other, _) => {
            return Err(PyValueError::new_err(format!(
                "unsupported vcov '{other}' (cluster variables required for 'cluster')"
            )))
        }
    };

    let model = ModelSpec::new(Family::from_name(family)?).with_vcov(vcov);
    let mut config = EngineConfig {
        n_threads,
        drop_singletons,
        ..EngineConfig::default()
    };
    config.centering.tol = tol;
    config.centering.maxiter = maxiter;

    let fit = py.allow_threads(|| estimate(&design, &model, &config))?;

    let out = PyDict::new(py);
    out.set_item("coef_names", fit.coef_names.clone())?;
    out.set_item("coefficients", fit.coefficients.clone().into_pyarray(py))?;
    out.set_item("vcov", fit.vcov.clone().into_pyarray(py))?;
    out.set_item("vcov_type", fit.vcov_type)?;
    out.set_item("fitted", fit.fitted.clone().into_pyarray(py))?;
    out.set_item("residuals", fit.residuals.clone().into_pyarray(py))?;
    out.set_item("converged", fit.convergence.converged)?;
    out.set_item("iterations", fit.convergence.iterations)?;
    out.set_item("deviance", fit.statistics.deviance)?;
    out.set_item("null_deviance", fit.statistics.null_deviance)?;
    out.set_item("log_likelihood", fit.statistics.log_likelihood)?;
    out.set_item("dispersion", fit.statistics.dispersion)?;
    out.set_item("theta", fit.statistics.theta)?;

    let fixef = PyDict::new(py);
    for table in &fit.fixed_effects {
        fixef.set_item(&table.name, Array1::from(table.levels.clone()).into_pyarray(py))?;
    }
    out.set_item("fixef", fixef)?;
    out.set_item(
        "warnings",
        fit.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
    )?;
    if let Some(mask) = &fit.obs_mask {
        out.set_item("obs_mask", mask.clone().into_pyarray(py))?;
    }
    Ok(out)
}

#[pymodule]
fn fixef_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_wrapped(wrap_pyfunction!(_demean_rs))?;
    m.add_wrapped(wrap_pyfunction!(_crv1_meat_loop_rs))?;
    m.add_wrapped(wrap_pyfunction!(_find_collinear_variables_rs))?;
    m.add_wrapped(wrap_pyfunction!(_count_fixef_fully_nested_all_rs))?;
    m.add_wrapped(wrap_pyfunction!(_detect_singletons_rs))?;
    m.add_wrapped(wrap_pyfunction!(_fit_rs))?;
    Ok(())
}
