//! Two-stage least squares with fixed effects.
//!
//! Response, exogenous regressors `X`, endogenous regressors `E` and excluded
//! instruments `Z` are centered together. Each endogenous column is regressed
//! on `[X̃ | Z̃]` (first stages, in parallel); the response is then regressed on
//! `[X̃ | Ê]`. Structural residuals use the observed `Ẽ`.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};

use crate::config::EngineConfig;
use crate::demean::hstack;
use crate::design::Design;
use crate::driver::{center_block, reference_scale, report_collinear, report_slow_convergence, CoreFit};
use crate::error::{EngineError, EngineResult, FitWarning};
use crate::family::Family;
use crate::reduce;
use crate::vcov::{self, FixefK};
use crate::wls::{self, WlsSolution};

/// Endogenous regressors and their excluded instruments.
#[derive(Debug, Clone)]
pub struct IvSpec {
    endogenous: Array2<f64>,
    endogenous_names: Vec<String>,
    instruments: Array2<f64>,
    instrument_names: Vec<String>,
}

impl IvSpec {
    pub fn new(
        endogenous: Array2<f64>,
        endogenous_names: Vec<String>,
        instruments: Array2<f64>,
        instrument_names: Vec<String>,
    ) -> EngineResult<Self> {
        if endogenous.ncols() == 0 {
            return Err(EngineError::InvalidDesign("no endogenous regressor".into()));
        }
        if endogenous_names.len() != endogenous.ncols() || instrument_names.len() != instruments.ncols() {
            return Err(EngineError::InvalidDesign(
                "instrumental variable names do not match their columns".into(),
            ));
        }
        if instruments.ncols() < endogenous.ncols() {
            return Err(EngineError::InvalidDesign(format!(
                "{} instrument(s) for {} endogenous regressor(s)",
                instruments.ncols(),
                endogenous.ncols()
            )));
        }
        if endogenous.nrows() != instruments.nrows() {
            return Err(EngineError::InvalidDesign(
                "endogenous regressors and instruments differ in length".into(),
            ));
        }
        if endogenous.iter().chain(instruments.iter()).any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidDesign(
                "instrumental variables contain non-finite values".into(),
            ));
        }
        Ok(Self {
            endogenous,
            endogenous_names,
            instruments,
            instrument_names,
        })
    }

    pub fn n_endogenous(&self) -> usize {
        self.endogenous.ncols()
    }

    pub fn n_instruments(&self) -> usize {
        self.instruments.ncols()
    }

    pub fn endogenous_names(&self) -> &[String] {
        &self.endogenous_names
    }

    pub fn instrument_names(&self) -> &[String] {
        &self.instrument_names
    }

    pub(crate) fn check_rows(&self, n_obs: usize) -> EngineResult<()> {
        if self.endogenous.nrows() != n_obs {
            return Err(EngineError::InvalidDesign(format!(
                "instrumental variables have {} rows, expected {n_obs}",
                self.endogenous.nrows()
            )));
        }
        Ok(())
    }

    pub(crate) fn subset(&self, mask: &[bool]) -> Self {
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        Self {
            endogenous: self.endogenous.select(Axis(0), &rows),
            endogenous_names: self.endogenous_names.clone(),
            instruments: self.instruments.select(Axis(0), &rows),
            instrument_names: self.instrument_names.clone(),
        }
    }
}

/// A test statistic with its reference distribution's degrees of freedom.
#[derive(Debug, Clone, PartialEq)]
pub struct TestStatistic {
    pub statistic: f64,
    pub p_value: f64,
    pub df1: f64,
    /// Denominator degrees of freedom of F tests.
    pub df2: Option<f64>,
}

/// First-stage regression of one endogenous regressor.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstStage {
    pub endogenous: String,
    /// On `[X | Z]`; collinear columns are NaN.
    pub coefficients: Array1<f64>,
    /// Joint F of the excluded instruments (weak-instrument check).
    pub partial_f: TestStatistic,
    pub partial_r2: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IvDiagnostics {
    pub first_stages: Vec<FirstStage>,
    /// Endogeneity test, control-function form.
    pub wu_hausman: TestStatistic,
    /// Overidentification test; only with more instruments than endogenous
    /// regressors.
    pub sargan: Option<TestStatistic>,
}

fn f_test(rss_restricted: f64, rss_unrestricted: f64, df1: usize, df2: usize) -> TestStatistic {
    let (d1, d2) = (df1.max(1) as f64, df2.max(1) as f64);
    let statistic = ((rss_restricted - rss_unrestricted) / d1) / (rss_unrestricted / d2);
    let p_value = FisherSnedecor::new(d1, d2)
        .map(|dist| dist.sf(statistic))
        .unwrap_or(f64::NAN);
    TestStatistic {
        statistic,
        p_value,
        df1: d1,
        df2: Some(d2),
    }
}

fn weighted_ss(values: ArrayView1<f64>, weights: Option<&[f64]>) -> f64 {
    let v = values.to_vec();
    reduce::weighted_dot(&v, &v, weights)
}

struct Regressors<'a> {
    x: ArrayView2<'a, f64>,
    x_scale: &'a [f64],
    weights: Option<&'a [f64]>,
    tol: f64,
}

impl Regressors<'_> {
    /// RSS of `v` on `x` alone (`Σ w v²` without regressors).
    fn restricted_rss(&self, v: ArrayView1<f64>) -> EngineResult<f64> {
        if self.x.ncols() == 0 {
            return Ok(weighted_ss(v, self.weights));
        }
        let sol = wls::solve(self.x, v, self.weights, Some(self.x_scale), self.tol)?;
        Ok(weighted_ss(sol.residuals.view(), self.weights))
    }
}

struct FirstStageFit {
    stage: FirstStage,
    fitted: Array1<f64>,
    residuals: Array1<f64>,
}

pub(crate) fn fit(
    design: &Design,
    iv: &IvSpec,
    config: &EngineConfig,
    warnings: &mut Vec<FitWarning>,
) -> EngineResult<CoreFit> {
    let weights = design.weight_slice();
    let tol = config.collinearity_tol;
    let n = design.n_obs();
    let (k, e, m) = (design.n_regressors(), iv.n_endogenous(), iv.n_instruments());
    let fe_dof = vcov::fixef_dof(design.groupings(), None, FixefK::Full);

    let y_adj = design.adjusted_response();
    let block = hstack(&[
        y_adj.view().insert_axis(Axis(1)),
        design.x().view(),
        iv.endogenous.view(),
        iv.instruments.view(),
    ]);
    let centered = center_block(design, block.view(), weights, config)?;
    report_slow_convergence("iv", &centered, config, warnings);

    let values = &centered.values;
    let y_t = values.column(0);
    let x_t = values.slice(s![.., 1..1 + k]);
    let e_t = values.slice(s![.., 1 + k..1 + k + e]);
    let z_t = values.slice(s![.., 1 + k + e..]);

    let x_scale = reference_scale(design.x().view(), weights);
    let exogenous = Regressors {
        x: x_t,
        x_scale: &x_scale,
        weights,
        tol,
    };

    // First stages
    let xz_t = hstack(&[x_t, z_t]);
    let xz_scale = reference_scale(hstack(&[design.x().view(), iv.instruments.view()]).view(), weights);
    let first_stages: Vec<FirstStageFit> = (0..e)
        .into_par_iter()
        .map(|j| -> EngineResult<FirstStageFit> {
            let target = e_t.column(j);
            let sol = wls::solve(xz_t.view(), target, weights, Some(&xz_scale), tol)?;
            let rss_u = weighted_ss(sol.residuals.view(), weights);
            let rss_r = exogenous.restricted_rss(target)?;
            let n_instruments = sol.kept.iter().filter(|&&c| c >= k).count();
            let df2 = n.saturating_sub(sol.kept.len() + fe_dof);
            Ok(FirstStageFit {
                stage: FirstStage {
                    endogenous: iv.endogenous_names[j].clone(),
                    partial_f: f_test(rss_r, rss_u, n_instruments, df2),
                    partial_r2: (rss_r - rss_u) / rss_r,
                    coefficients: sol.coefficients.clone(),
                },
                fitted: sol.fitted,
                residuals: sol.residuals,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;
    for fs in &first_stages {
        log::debug!(
            "first stage '{}': partial F {:.4}, partial R2 {:.4}",
            fs.stage.endogenous,
            fs.stage.partial_f.statistic,
            fs.stage.partial_r2
        );
    }

    let e_hat = stack_columns(first_stages.iter().map(|fs| &fs.fitted), n, e);
    let v_hat = stack_columns(first_stages.iter().map(|fs| &fs.residuals), n, e);

    // Second stage
    let mut names = design.x_names().to_vec();
    names.extend(iv.endogenous_names.iter().cloned());
    let regressors = hstack(&[design.x().view(), iv.endogenous.view()]);
    let xe_scale = reference_scale(regressors.view(), weights);
    let a_t = hstack(&[x_t, e_hat.view()]);
    let second = wls::solve(a_t.view(), y_t, weights, Some(&xe_scale), tol)?;
    report_collinear(&names, &second.dropped, warnings);

    let xe_t = hstack(&[x_t, e_t]);
    let structural = structural_residuals(y_t, xe_t.view(), &second);
    let deviance = weighted_ss(structural.view(), weights);

    // Wu-Hausman: joint significance of the first-stage residuals added to
    // the structural equation.
    let rss_r = {
        let sol = wls::solve(xe_t.view(), y_t, weights, Some(&xe_scale), tol)?;
        weighted_ss(sol.residuals.view(), weights)
    };
    let cf = hstack(&[xe_t.view(), v_hat.view()]);
    let mut cf_scale = xe_scale.clone();
    cf_scale.extend(reference_scale(v_hat.view(), weights));
    let cf_sol = wls::solve(cf.view(), y_t, weights, Some(&cf_scale), tol)?;
    let rss_u = weighted_ss(cf_sol.residuals.view(), weights);
    let wu_df1 = cf_sol.kept.iter().filter(|&&c| c >= k + e).count();
    let wu_hausman = f_test(rss_r, rss_u, wu_df1, n.saturating_sub(cf_sol.kept.len() + fe_dof));

    // Sargan: n R² of the structural residuals on all exogenous variables.
    let sargan = if m > e {
        let sol = wls::solve(xz_t.view(), structural.view(), weights, Some(&xz_scale), tol)?;
        let r2 = 1.0 - weighted_ss(sol.residuals.view(), weights) / weighted_ss(structural.view(), weights);
        let statistic = n as f64 * r2;
        let df = (m - e) as f64;
        Some(TestStatistic {
            statistic,
            p_value: ChiSquared::new(df).map(|d| d.sf(statistic)).unwrap_or(f64::NAN),
            df1: df,
            df2: None,
        })
    } else {
        None
    };

    let eta = design.y() - &structural;
    let within_ss = centered.ctx.is_some().then(|| weighted_ss(y_t, weights));
    let x_centered = a_t.select(Axis(1), &second.kept);

    Ok(CoreFit {
        names,
        coefficients: second.coefficients,
        dropped: second.dropped,
        regressors,
        x_centered,
        bread: second.xtwx_inv,
        working_residuals: structural,
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
        iv: Some(IvDiagnostics {
            first_stages: first_stages.into_iter().map(|fs| fs.stage).collect(),
            wu_hausman,
            sargan,
        }),
    })
}

fn stack_columns<'a>(columns: impl Iterator<Item = &'a Array1<f64>>, n: usize, k: usize) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((n, k));
    for (mut col, values) in out.axis_iter_mut(Axis(1)).zip(columns) {
        col.assign(values);
    }
    out
}

/// `ỹ − [X̃ | Ẽ] β` over the kept columns.
fn structural_residuals(y: ArrayView1<f64>, xe: ArrayView2<f64>, sol: &WlsSolution) -> Array1<f64> {
    let kept = xe.select(Axis(1), &sol.kept);
    &y - &kept.dot(&sol.kept_coefficients())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_spec_validation() {
        let e = Array2::<f64>::zeros((3, 2));
        let z = Array2::<f64>::zeros((3, 1));
        let err = IvSpec::new(e, vec!["a".into(), "b".into()], z, vec!["z".into()]);
        assert!(matches!(err, Err(EngineError::InvalidDesign(_))));
    }

    #[test]
    fn test_just_identified_matches_ratio_estimator() {
        // Without exogenous regressors, β = Σ z y / Σ z e.
        let z = array![1.0, -1.0, 2.0, 0.5, -2.0, 1.5];
        let e = array![0.8, -1.2, 2.5, 0.1, -1.7, 1.0];
        let y = array![2.0, -2.1, 5.3, 0.0, -3.2, 2.4];
        let design = Design::new(y.clone(), Array2::zeros((6, 0)), vec![]).unwrap();
        let spec = IvSpec::new(
            e.clone().insert_axis(Axis(1)),
            vec!["e".into()],
            z.clone().insert_axis(Axis(1)),
            vec!["z".into()],
        )
        .unwrap();

        let mut warnings = Vec::new();
        let core = fit(&design, &spec, &EngineConfig::default(), &mut warnings).unwrap();
        let expected = z.dot(&y) / z.dot(&e);
        assert_relative_eq!(core.coefficients[0], expected, epsilon = 1e-10);

        let diagnostics = core.iv.unwrap();
        assert!(diagnostics.sargan.is_none());
        assert_eq!(diagnostics.first_stages.len(), 1);
        assert!(diagnostics.first_stages[0].partial_f.statistic > 10.0);

        // Residuals use the observed endogenous regressor.
        for i in 0..6 {
            assert_relative_eq!(core.working_residuals[i], y[i] - expected * e[i], epsilon = 1e-10);
        }
    }
}
