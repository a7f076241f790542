use approx::assert_relative_eq;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal, Poisson};

use fixef_core::demean::{center, CenteringConfig, DemeanContext};
use fixef_core::{
    estimate, Design, EngineConfig, EngineError, Family, FitWarning, GroupIndex, GroupingSpec,
    ModelSpec,
};

fn grouping(name: &str, codes: &[usize]) -> GroupingSpec {
    GroupingSpec::new(name, GroupIndex::from_codes(codes))
}

fn names(k: usize) -> Vec<String> {
    (1..=k).map(|j| format!("x{j}")).collect()
}

fn tight_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.centering.tol = 1e-12;
    config
}

fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    cov / (va * vb).sqrt()
}

#[test]
fn test_two_way_panel_recovers_levels_up_to_normalization() {
    let (n_units, n_periods) = (6, 5);
    let unit_effect = [1.0, -2.0, 0.5, 3.0, -1.0, 2.5];
    let period_effect = [0.0, 0.7, -0.3, 1.1, 2.0];

    let mut units = Vec::new();
    let mut periods = Vec::new();
    let mut x = Vec::new();
    let mut y = Vec::new();
    for u in 0..n_units {
        for t in 0..n_periods {
            let xi = (u * t) as f64 + 0.1 * ((u + 2 * t) % 3) as f64;
            units.push(u);
            periods.push(t);
            x.push(xi);
            y.push(unit_effect[u] + period_effect[t] + 2.0 * xi);
        }
    }
    let n = y.len();
    let design = Design::new(Array1::from(y.clone()), Array2::from_shape_vec((n, 1), x.clone()).unwrap(), names(1))
        .unwrap()
        .with_groupings(vec![grouping("unit", &units), grouping("period", &periods)])
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &tight_config()).unwrap();
    assert_relative_eq!(fit.coefficients[0], 2.0, epsilon = 1e-8);
    assert!(fit.convergence.converged);

    let unit = fit.fixed_effect("unit").unwrap();
    let period = fit.fixed_effect("period").unwrap();
    assert_eq!(unit.levels.len(), n_units);
    assert_eq!(period.levels.len(), n_periods);
    assert_eq!(period.reference, Some(0));
    assert_eq!(period.levels[0], 0.0);

    for u in 0..n_units {
        assert_relative_eq!(unit.levels[u] - unit.levels[0], unit_effect[u] - unit_effect[0], epsilon = 1e-7);
    }
    for t in 0..n_periods {
        assert_relative_eq!(period.levels[t], period_effect[t] - period_effect[0], epsilon = 1e-7);
    }
    for i in 0..n {
        let rebuilt = unit.levels[units[i]] + period.levels[periods[i]] + 2.0 * x[i];
        assert_relative_eq!(rebuilt, y[i], epsilon = 1e-7);
        assert_relative_eq!(fit.fitted[i], y[i], epsilon = 1e-7);
    }
    assert!(fit.warnings.is_empty(), "{:?}", fit.warnings);
}

#[test]
fn test_linear_fit_equals_ols_on_centered_data() {
    let mut rng = StdRng::seed_from_u64(11);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let n = 400;
    let firms: Vec<usize> = (0..n).map(|i| i % 17).collect();
    let years: Vec<usize> = (0..n).map(|_| rng.random_range(0..9)).collect();
    let x = Array2::from_shape_fn((n, 2), |_| noise.sample(&mut rng));
    let y: Array1<f64> = (0..n)
        .map(|i| 0.8 * x[(i, 0)] - 1.5 * x[(i, 1)] + firms[i] as f64 * 0.2 + noise.sample(&mut rng))
        .collect();

    let groupings = vec![grouping("firm", &firms), grouping("year", &years)];
    let design = Design::new(y.clone(), x.clone(), names(2))
        .unwrap()
        .with_groupings(groupings.clone())
        .unwrap();
    let config = tight_config();
    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &config).unwrap();

    let ctx = DemeanContext::new(&groupings, None, false).unwrap();
    let centering = CenteringConfig {
        tol: 1e-12,
        ..CenteringConfig::default()
    };
    let y_tilde = center(y.view().insert_axis(Axis(1)), &ctx, &centering).demeaned;
    let x_tilde = center(x.view(), &ctx, &centering).demeaned;

    let xtx = x_tilde.t().dot(&x_tilde);
    let xty = x_tilde.t().dot(&y_tilde.column(0));
    let det = xtx[(0, 0)] * xtx[(1, 1)] - xtx[(0, 1)] * xtx[(1, 0)];
    let b0 = (xtx[(1, 1)] * xty[0] - xtx[(0, 1)] * xty[1]) / det;
    let b1 = (xtx[(0, 0)] * xty[1] - xtx[(1, 0)] * xty[0]) / det;

    assert_relative_eq!(fit.coefficients[0], b0, epsilon = 1e-8);
    assert_relative_eq!(fit.coefficients[1], b1, epsilon = 1e-8);

    let r2 = fit.statistics.r2.unwrap();
    let within = fit.statistics.within_r2.unwrap();
    assert!(within > 0.0 && within < r2 && r2 < 1.0);
    assert_eq!(fit.statistics.n_params, 2 + 17 + 9 - 1);
}

#[test]
fn test_poisson_recovers_twenty_levels() {
    let mut rng = StdRng::seed_from_u64(2024);
    let n_levels = 20;
    let per_level = 200;
    let truth: Vec<f64> = (0..n_levels).map(|g| -1.0 + 0.1 * g as f64).collect();

    let mut codes = Vec::new();
    let mut x = Vec::new();
    let mut y = Vec::new();
    for g in 0..n_levels {
        for _ in 0..per_level {
            let xi: f64 = rng.random_range(-1.0..1.0);
            let mu = (truth[g] + 0.3 * xi).exp();
            codes.push(g);
            x.push(xi);
            y.push(Poisson::new(mu).unwrap().sample(&mut rng));
        }
    }
    let n = y.len();
    let design = Design::new(Array1::from(y), Array2::from_shape_vec((n, 1), x).unwrap(), names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Poisson), &EngineConfig::default()).unwrap();
    assert!(fit.convergence.converged);
    assert!((fit.coefficients[0] - 0.3).abs() < 0.1, "beta = {}", fit.coefficients[0]);

    let levels = &fit.fixed_effect("g").unwrap().levels;
    assert_eq!(levels.len(), n_levels);
    let rho = correlation(levels, &truth);
    assert!(rho >= 0.95, "correlation = {rho}");

    assert!(fit.statistics.deviance < fit.statistics.null_deviance);
    assert!(fit.statistics.pseudo_r2 > 0.0);
    assert_eq!(fit.df_t, f64::INFINITY);
}

#[test]
fn test_collinear_and_absorbed_columns_are_dropped() {
    let n = 60;
    let codes: Vec<usize> = (0..n).map(|i| i % 6).collect();
    let x = Array2::from_shape_fn((n, 4), |(i, j)| match j {
        0 => ((i * 7) % 11) as f64,
        1 => ((i * 3) % 5) as f64 - 0.5 * i as f64 / n as f64,
        2 => ((i * 7) % 11) as f64 + ((i * 3) % 5) as f64 - 0.5 * i as f64 / n as f64,
        _ => (i % 6) as f64 * 1.5,
    });
    let y: Array1<f64> = (0..n)
        .map(|i| x[(i, 0)] - 2.0 * x[(i, 1)] + (i % 6) as f64 + 0.01 * ((i * 13) % 7) as f64)
        .collect();
    let design = Design::new(y, x, names(4))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap();
    assert_eq!(fit.dropped, vec![2, 3]);
    assert!(fit.coefficients[2].is_nan());
    assert!(fit.coefficients[3].is_nan());
    assert!(fit.coefficients[0].is_finite() && fit.coefficients[1].is_finite());
    assert!(fit.vcov[(2, 2)].is_nan());
    assert!(fit.vcov[(0, 0)] > 0.0);
    for column in [2, 3] {
        assert!(fit.has_warning(|w| matches!(w, FitWarning::CollinearRegressor { column: c, .. } if *c == column)));
    }
}

#[test]
fn test_all_collinear_is_fatal() {
    let n = 12;
    let codes: Vec<usize> = (0..n).map(|i| i % 3).collect();
    let x = Array2::from_shape_fn((n, 1), |(i, _)| (i % 3) as f64);
    let y = Array1::from_shape_fn(n, |i| i as f64);
    let design = Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let err = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap_err();
    assert!(matches!(err, EngineError::AllCollinear { .. }), "{err}");
}

#[test]
fn test_log_link_on_negative_response_fails() {
    let n = 30;
    let codes: Vec<usize> = (0..n).map(|i| i % 3).collect();
    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64);
    let y = Array1::from_shape_fn(n, |i| if i % 4 == 0 { -2.0 } else { 1.0 + (i % 5) as f64 });
    let design = Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let err = estimate(&design, &ModelSpec::new(Family::Poisson), &EngineConfig::default()).unwrap_err();
    assert!(
        matches!(err, EngineError::NonFiniteValue { .. } | EngineError::Diverged { .. }),
        "{err}"
    );
}

#[test]
fn test_integer_weights_match_replicated_rows() {
    let n = 40;
    let codes: Vec<usize> = (0..n).map(|i| i % 4).collect();
    let x: Vec<f64> = (0..n).map(|i| ((i * 5) % 9) as f64 - 4.0).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| 1.5 * x[i] + (i % 4) as f64 + ((i * 11) % 7) as f64 * 0.3)
        .collect();
    let w: Vec<f64> = (0..n).map(|i| 1.0 + (i % 3) as f64).collect();

    let weighted = Design::new(Array1::from(y.clone()), Array2::from_shape_vec((n, 1), x.clone()).unwrap(), names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap()
        .with_weights(Array1::from(w.clone()))
        .unwrap();

    let (mut ry, mut rx, mut rc) = (Vec::new(), Vec::new(), Vec::new());
    for i in 0..n {
        for _ in 0..(w[i] as usize) {
            ry.push(y[i]);
            rx.push(x[i]);
            rc.push(codes[i]);
        }
    }
    let m = ry.len();
    let replicated = Design::new(Array1::from(ry), Array2::from_shape_vec((m, 1), rx).unwrap(), names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &rc)])
        .unwrap();

    let model = ModelSpec::new(Family::Gaussian);
    let config = tight_config();
    let a = estimate(&weighted, &model, &config).unwrap();
    let b = estimate(&replicated, &model, &config).unwrap();
    assert_relative_eq!(a.coefficients[0], b.coefficients[0], epsilon = 1e-10);
    assert_relative_eq!(a.statistics.rss, b.statistics.rss, epsilon = 1e-8);
    let (fa, fb) = (a.fixed_effect("g").unwrap(), b.fixed_effect("g").unwrap());
    for (u, v) in fa.levels.iter().zip(&fb.levels) {
        assert_relative_eq!(*u, *v, epsilon = 1e-8);
    }
}

#[test]
fn test_singletons_are_removed_on_request() {
    // Levels 8 and 9 of `g` appear once each.
    let mut codes: Vec<usize> = (0..40).map(|i| i % 8).collect();
    codes.push(8);
    codes.push(9);
    let n = codes.len();
    let x = Array2::from_shape_fn((n, 1), |(i, _)| ((i * 7) % 13) as f64);
    let y = Array1::from_shape_fn(n, |i| 0.5 * ((i * 7) % 13) as f64 + (codes[i] as f64) + ((i * 3) % 5) as f64 * 0.1);
    let design = Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let config = EngineConfig {
        drop_singletons: true,
        ..EngineConfig::default()
    };
    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &config).unwrap();
    assert!(fit.has_warning(|w| matches!(w, FitWarning::SingletonsRemoved { count: 2 })));
    assert_eq!(fit.statistics.n_obs, n - 2);
    let mask = fit.obs_mask.as_ref().unwrap();
    assert_eq!(mask.len(), n);
    assert!(!mask[n - 1] && !mask[n - 2]);
    assert_eq!(fit.fitted.len(), n - 2);
    assert_eq!(fit.fixed_effect("g").unwrap().levels.len(), 8);

    let kept = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap();
    assert!(kept.obs_mask.is_none());
    assert_eq!(kept.statistics.n_obs, n);
}

#[test]
fn test_single_level_grouping_is_dropped_with_warning() {
    let n = 20;
    let codes: Vec<usize> = (0..n).map(|i| i % 4).collect();
    let constant = vec![0usize; n];
    let x = Array2::from_shape_fn((n, 1), |(i, _)| ((i * 3) % 7) as f64);
    let y = Array1::from_shape_fn(n, |i| ((i * 3) % 7) as f64 + (i % 4) as f64 + 0.1 * (i % 3) as f64);
    let design = Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes), grouping("const", &constant)])
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap();
    assert!(fit.has_warning(|w| matches!(w, FitWarning::DegenerateGrouping { name } if name == "const")));
    assert!(fit.fixed_effect("const").is_none());
    assert!(fit.fixed_effect("g").is_some());
}

#[test]
fn test_negative_binomial_estimates_theta() {
    let mut rng = StdRng::seed_from_u64(99);
    let theta = 2.0;
    let n = 3000;
    let codes: Vec<usize> = (0..n).map(|i| i % 10).collect();
    let x: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| {
            let mu = (0.5 + 0.1 * codes[i] as f64 + 0.5 * x[i]).exp();
            let lambda: f64 = Gamma::new(theta, mu / theta).unwrap().sample(&mut rng);
            Poisson::new(lambda.max(1e-12)).unwrap().sample(&mut rng)
        })
        .collect();
    let design = Design::new(Array1::from(y), Array2::from_shape_vec((n, 1), x).unwrap(), names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let model = ModelSpec::new(Family::NegativeBinomial { theta: None });
    let fit = estimate(&design, &model, &EngineConfig::default()).unwrap();
    assert!((fit.coefficients[0] - 0.5).abs() < 0.15, "beta = {}", fit.coefficients[0]);
    let estimated = fit.statistics.theta.unwrap();
    assert!((1.3..3.0).contains(&estimated), "theta = {estimated}");
    assert_eq!(fit.family, "negbin");
}

#[test]
fn test_offset_shifts_linear_predictor() {
    let n = 50;
    let codes: Vec<usize> = (0..n).map(|i| i % 5).collect();
    let x = Array2::from_shape_fn((n, 1), |(i, _)| ((i * 3) % 8) as f64 / 4.0);
    let offset = Array1::from_shape_fn(n, |i| 0.2 * (i % 7) as f64);
    let y = Array1::from_shape_fn(n, |i| ((0.3 * x[(i, 0)] + offset[i]).exp() * (1.0 + (i % 5) as f64)).round());
    let design = Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap()
        .with_offset(offset.clone())
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Poisson), &EngineConfig::default()).unwrap();
    let levels = &fit.fixed_effect("g").unwrap().levels;
    for i in 0..n {
        let eta = levels[codes[i]] + fit.coefficients[0] * design.x()[(i, 0)] + offset[i];
        assert_relative_eq!(fit.linear_predictor[i], eta, epsilon = 1e-6);
        assert_relative_eq!(fit.fitted[i], eta.exp(), max_relative = 1e-6);
    }
}

#[test]
fn test_linear_fit_recovers_slopes_and_twenty_levels() {
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 0.5).unwrap();
    let (n_levels, per_level) = (20, 50);
    let truth: Vec<f64> = (0..n_levels).map(|g| -2.0 + 0.2 * g as f64).collect();

    let n = n_levels * per_level;
    let codes: Vec<usize> = (0..n).map(|i| i % n_levels).collect();
    let x: Array2<f64> = Array2::from_shape_fn((n, 2), |_| noise.sample(&mut rng) * 2.0);
    let y: Array1<f64> = (0..n)
        .map(|i| 1.5 * x[(i, 0)] - 0.7 * x[(i, 1)] + truth[codes[i]] + noise.sample(&mut rng))
        .collect();
    let design = Design::new(y, x, names(2))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap();
    assert!((fit.coefficients[0] - 1.5).abs() < 0.1, "a = {}", fit.coefficients[0]);
    assert!((fit.coefficients[1] + 0.7).abs() < 0.1, "b = {}", fit.coefficients[1]);

    let levels = &fit.fixed_effect("g").unwrap().levels;
    assert_eq!(levels.len(), n_levels);
    let rho = correlation(levels, &truth);
    assert!(rho >= 0.95, "correlation = {rho}");
    assert!(fit.warnings.is_empty(), "{:?}", fit.warnings);
}

/// Unbalanced two-way panel; with `split` the second half uses its own units
/// and periods, so the observation graph has two components.
fn unbalanced_panel(split: bool) -> Design {
    let mut rng = StdRng::seed_from_u64(31);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let n = 300;
    let mut units = Vec::with_capacity(n);
    let mut periods = Vec::with_capacity(n);
    for i in 0..n {
        let second = split && i >= n / 2;
        let base = if second { (15, 4) } else { (0, 0) };
        units.push(base.0 + i % 15);
        periods.push(base.1 + rng.random_range(0..4usize));
    }
    let x: Array2<f64> = Array2::from_shape_fn((n, 1), |_| noise.sample(&mut rng));
    let y: Array1<f64> = (0..n)
        .map(|i| 0.9 * x[(i, 0)] + 0.3 * units[i] as f64 - 0.2 * periods[i] as f64 + noise.sample(&mut rng))
        .collect();
    Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("unit", &units), grouping("period", &periods)])
        .unwrap()
}

fn capped_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.centering.maxiter = 3;
    config.centering.accelerate = false;
    config
}

#[test]
fn test_iteration_cap_returns_result_with_slow_convergence_warning() {
    let design = unbalanced_panel(false);
    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &capped_config()).unwrap();

    assert!(!fit.convergence.converged);
    assert!(fit.coefficients[0].is_finite());
    assert!(fit.has_warning(|w| matches!(
        w,
        FitWarning::SlowConvergence { unconverged_columns, max_iterations: 3, .. } if *unconverged_columns > 0
    )));
    assert!(!fit.has_warning(|w| matches!(w, FitWarning::UnderidentifiedFixedEffects { .. })));

    let full = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap();
    assert!(full.convergence.converged);
    assert!(!full.has_warning(|w| matches!(w, FitWarning::SlowConvergence { .. })));
}

#[test]
fn test_slow_convergence_and_underidentification_are_both_reported() {
    let design = unbalanced_panel(true);
    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &capped_config()).unwrap();

    assert!(fit.has_warning(|w| matches!(w, FitWarning::SlowConvergence { .. })));
    assert!(fit.has_warning(|w| matches!(
        w,
        FitWarning::UnderidentifiedFixedEffects { components, .. } if *components >= 2
    )));
}

#[test]
fn test_weights_in_reversed_layout_match_contiguous() {
    let n = 40;
    let codes: Vec<usize> = (0..n).map(|i| i % 4).collect();
    let x: Vec<f64> = (0..n).map(|i| ((i * 5) % 9) as f64 - 4.0).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| 1.5 * x[i] + (i % 4) as f64 + ((i * 11) % 7) as f64 * 0.3 * x[i].abs())
        .collect();
    let w: Vec<f64> = (0..n).map(|i| 0.5 + (i % 5) as f64).collect();

    let mut reversed = Array1::from_iter(w.iter().rev().copied());
    reversed.invert_axis(Axis(0));
    assert!(reversed.as_slice().is_none());

    let base = Design::new(Array1::from(y), Array2::from_shape_vec((n, 1), x).unwrap(), names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes)])
        .unwrap();
    let contiguous = base.clone().with_weights(Array1::from(w)).unwrap();
    let strided = base.clone().with_weights(reversed).unwrap();

    let model = ModelSpec::new(Family::Gaussian);
    let config = EngineConfig::default();
    let a = estimate(&contiguous, &model, &config).unwrap();
    let b = estimate(&strided, &model, &config).unwrap();
    let unweighted = estimate(&base, &model, &config).unwrap();

    assert_relative_eq!(a.coefficients[0], b.coefficients[0], epsilon = 1e-12);
    assert_relative_eq!(a.vcov[(0, 0)], b.vcov[(0, 0)], max_relative = 1e-10);
    assert!((a.coefficients[0] - unweighted.coefficients[0]).abs() > 1e-6);
}

#[test]
fn test_only_the_degenerate_of_two_same_named_groupings_is_dropped() {
    let n = 20;
    let codes: Vec<usize> = (0..n).map(|i| i % 4).collect();
    let constant = vec![0usize; n];
    let x = Array2::from_shape_fn((n, 1), |(i, _)| ((i * 3) % 7) as f64);
    let y = Array1::from_shape_fn(n, |i| ((i * 3) % 7) as f64 + (i % 4) as f64 + 0.1 * (i % 3) as f64);
    let design = Design::new(y, x, names(1))
        .unwrap()
        .with_groupings(vec![grouping("g", &codes), grouping("g", &constant)])
        .unwrap();

    let fit = estimate(&design, &ModelSpec::new(Family::Gaussian), &EngineConfig::default()).unwrap();
    assert!(fit.has_warning(|w| matches!(w, FitWarning::DegenerateGrouping { name } if name == "g")));
    assert_eq!(fit.fixed_effects.len(), 1);
    assert_eq!(fit.fixed_effect("g").unwrap().levels.len(), 4);
}
