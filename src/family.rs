//! Distribution families: link, variance and deviance functions.
//!
//! | family             | link     | V(μ)        |
//! |--------------------|----------|-------------|
//! | `Gaussian`         | identity | 1           |
//! | `Poisson`          | log      | μ           |
//! | `Logit`            | logit    | μ(1 − μ)    |
//! | `Probit`           | probit   | μ(1 − μ)    |
//! | `Gamma`            | log      | μ²          |
//! | `NegativeBinomial` | log      | μ + μ²/θ    |
//!
//! `Custom` plugs in any [`FamilyFunctions`] implementation.

use std::f64::consts::{PI, SQRT_2};
use std::fmt;
use std::sync::Arc;

use statrs::function::erf::{erfc, erfc_inv};
use statrs::function::gamma::ln_gamma;

use crate::error::{EngineError, EngineResult};

/// Starting θ of an estimated negative-binomial dispersion.
pub const NEGBIN_START_THETA: f64 = 1.0;

/// User-supplied link / inverse-link / variance / deviance quadruple.
pub trait FamilyFunctions: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn link(&self, mu: f64) -> f64;
    fn link_inverse(&self, eta: f64) -> f64;
    /// `dμ/dη` at `eta`.
    fn mu_eta(&self, eta: f64) -> f64;
    fn variance(&self, mu: f64) -> f64;
    fn unit_deviance(&self, y: f64, mu: f64) -> f64;

    /// Starting mean for response `y`.
    fn initial_mu(&self, y: f64) -> f64 {
        y
    }
}

/// Family of a model.
#[derive(Debug, Clone)]
pub enum Family {
    Gaussian,
    Poisson,
    Logit,
    Probit,
    Gamma,
    /// `theta: None` estimates θ by maximum likelihood.
    NegativeBinomial { theta: Option<f64> },
    Custom(Arc<dyn FamilyFunctions>),
}

#[inline]
fn y_log_y(y: f64, mu: f64) -> f64 {
    if y == 0.0 {
        0.0
    } else {
        y * (y / mu).ln()
    }
}

#[inline]
fn std_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

#[inline]
fn std_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

#[inline]
fn std_normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

impl Family {
    pub fn from_name(name: &str) -> EngineResult<Self> {
        match name {
            "gaussian" | "ols" => Ok(Family::Gaussian),
            "poisson" | "fepois" => Ok(Family::Poisson),
            "logit" => Ok(Family::Logit),
            "probit" => Ok(Family::Probit),
            "gamma" => Ok(Family::Gamma),
            "negbin" => Ok(Family::NegativeBinomial { theta: None }),
            other => Err(EngineError::InvalidDesign(format!("unknown family '{other}'"))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Family::Gaussian => "gaussian",
            Family::Poisson => "poisson",
            Family::Logit => "logit",
            Family::Probit => "probit",
            Family::Gamma => "gamma",
            Family::NegativeBinomial { .. } => "negbin",
            Family::Custom(f) => f.name(),
        }
    }

    /// Gaussian with identity link: solved in one centering pass.
    pub fn is_linear(&self) -> bool {
        matches!(self, Family::Gaussian)
    }

    /// Dispersion fixed by the family, `None` when it is estimated.
    pub fn fixed_dispersion(&self) -> Option<f64> {
        match self {
            Family::Poisson | Family::Logit | Family::Probit | Family::NegativeBinomial { .. } => {
                Some(1.0)
            }
            Family::Gaussian | Family::Gamma | Family::Custom(_) => None,
        }
    }

    /// Family with θ pinned, used inside the negative-binomial alternation.
    pub(crate) fn with_theta(&self, theta: f64) -> Family {
        match self {
            Family::NegativeBinomial { .. } => Family::NegativeBinomial { theta: Some(theta) },
            other => other.clone(),
        }
    }

    pub(crate) fn theta(&self) -> Option<f64> {
        match self {
            Family::NegativeBinomial { theta } => Some(theta.unwrap_or(NEGBIN_START_THETA)),
            _ => None,
        }
    }

    #[inline]
    pub fn link(&self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => mu,
            Family::Poisson | Family::Gamma | Family::NegativeBinomial { .. } => mu.ln(),
            Family::Logit => (mu / (1.0 - mu)).ln(),
            Family::Probit => std_normal_quantile(mu),
            Family::Custom(f) => f.link(mu),
        }
    }

    #[inline]
    pub fn link_inverse(&self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Poisson | Family::Gamma | Family::NegativeBinomial { .. } => eta.exp(),
            Family::Logit => 1.0 / (1.0 + (-eta).exp()),
            Family::Probit => std_normal_cdf(eta),
            Family::Custom(f) => f.link_inverse(eta),
        }
    }

    /// `dμ/dη`.
    #[inline]
    pub fn mu_eta(&self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => 1.0,
            Family::Poisson | Family::Gamma | Family::NegativeBinomial { .. } => eta.exp(),
            Family::Logit => {
                let mu = 1.0 / (1.0 + (-eta).exp());
                (mu * (1.0 - mu)).max(f64::EPSILON)
            }
            Family::Probit => std_normal_pdf(eta).max(f64::EPSILON),
            Family::Custom(f) => f.mu_eta(eta),
        }
    }

    #[inline]
    pub fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => 1.0,
            Family::Poisson => mu,
            Family::Logit | Family::Probit => (mu * (1.0 - mu)).max(f64::EPSILON),
            Family::Gamma => mu * mu,
            Family::NegativeBinomial { theta } => {
                let theta = theta.unwrap_or(NEGBIN_START_THETA);
                mu + mu * mu / theta
            }
            Family::Custom(f) => f.variance(mu),
        }
    }

    #[inline]
    pub fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        match self {
            Family::Gaussian => (y - mu) * (y - mu),
            Family::Poisson => 2.0 * (y_log_y(y, mu) - (y - mu)),
            Family::Logit | Family::Probit => {
                2.0 * (y_log_y(y, mu) + y_log_y(1.0 - y, 1.0 - mu))
            }
            Family::Gamma => 2.0 * (-(y / mu).ln() + (y - mu) / mu),
            Family::NegativeBinomial { theta } => {
                let theta = theta.unwrap_or(NEGBIN_START_THETA);
                2.0 * (y_log_y(y, mu) - (y + theta) * ((y + theta) / (mu + theta)).ln())
            }
            Family::Custom(f) => f.unit_deviance(y, mu),
        }
    }

    #[inline]
    pub fn initial_mu(&self, y: f64) -> f64 {
        match self {
            Family::Gaussian | Family::Gamma => y,
            Family::Poisson | Family::NegativeBinomial { .. } => y + 0.1,
            Family::Logit | Family::Probit => (y + 0.5) / 2.0,
            Family::Custom(f) => f.initial_mu(y),
        }
    }

    /// `Σ w_i d(y_i, μ_i)`.
    pub fn deviance(&self, y: &[f64], mu: &[f64], weights: Option<&[f64]>) -> f64 {
        y.iter()
            .zip(mu)
            .enumerate()
            .map(|(i, (&yi, &mi))| weights.map_or(1.0, |w| w[i]) * self.unit_deviance(yi, mi))
            .sum()
    }

    /// Log-likelihood at `mu`. `dispersion` is σ² for Gaussian and the shape
    /// reciprocal for Gamma; it is ignored by the other built-in families.
    pub fn log_likelihood(&self, y: &[f64], mu: &[f64], weights: Option<&[f64]>, dispersion: f64) -> f64 {
        let w = |i: usize| weights.map_or(1.0, |w| w[i]);
        let terms = y.iter().zip(mu).enumerate();
        match self {
            Family::Gaussian => {
                let sigma2 = dispersion.max(f64::MIN_POSITIVE);
                terms
                    .map(|(i, (&yi, &mi))| {
                        let r = yi - mi;
                        -0.5 * w(i) * ((2.0 * PI * sigma2).ln() + r * r / sigma2)
                    })
                    .sum()
            }
            Family::Poisson => terms
                .map(|(i, (&yi, &mi))| w(i) * (yi * mi.ln() - mi - ln_gamma(yi + 1.0)))
                .sum(),
            Family::Logit | Family::Probit => terms
                .map(|(i, (&yi, &mi))| {
                    let mut ll = 0.0;
                    if yi > 0.0 {
                        ll += yi * mi.ln();
                    }
                    if yi < 1.0 {
                        ll += (1.0 - yi) * (1.0 - mi).ln();
                    }
                    w(i) * ll
                })
                .sum(),
            Family::Gamma => {
                let nu = 1.0 / dispersion.max(f64::MIN_POSITIVE);
                terms
                    .map(|(i, (&yi, &mi))| {
                        w(i) * (nu * (nu * yi / mi).ln() - nu * yi / mi - yi.ln() - ln_gamma(nu))
                    })
                    .sum()
            }
            Family::NegativeBinomial { theta } => {
                let theta = theta.unwrap_or(NEGBIN_START_THETA);
                terms
                    .map(|(i, (&yi, &mi))| w(i) * negbin_log_density(yi, mi, theta))
                    .sum()
            }
            Family::Custom(_) => -0.5 * self.deviance(y, mu, weights),
        }
    }
}

/// Log density of one negative-binomial observation.
#[inline]
pub(crate) fn negbin_log_density(y: f64, mu: f64, theta: f64) -> f64 {
    ln_gamma(y + theta) - ln_gamma(theta) - ln_gamma(y + 1.0)
        + theta * (theta / (theta + mu)).ln()
        + if y > 0.0 { y * (mu / (theta + mu)).ln() } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn builtins() -> Vec<Family> {
        vec![
            Family::Gaussian,
            Family::Poisson,
            Family::Logit,
            Family::Probit,
            Family::Gamma,
            Family::NegativeBinomial { theta: Some(2.0) },
        ]
    }

    #[test]
    fn test_link_inverse_roundtrip() {
        for family in builtins() {
            for mu in [0.2, 0.5, 0.7] {
                let eta = family.link(mu);
                assert_relative_eq!(family.link_inverse(eta), mu, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_mu_eta_matches_finite_difference() {
        let h = 1e-6;
        for family in builtins() {
            for eta in [-0.5, 0.1, 1.2] {
                let numeric = (family.link_inverse(eta + h) - family.link_inverse(eta - h)) / (2.0 * h);
                assert_relative_eq!(family.mu_eta(eta), numeric, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn test_deviance_zero_at_saturation() {
        assert_eq!(Family::Poisson.unit_deviance(3.0, 3.0), 0.0);
        assert_eq!(Family::Poisson.unit_deviance(0.0, 0.0), 0.0);
        assert!(Family::Logit.unit_deviance(1.0, 1.0).abs() < 1e-12);
        assert!(Family::Gamma.unit_deviance(2.5, 2.5).abs() < 1e-12);
        assert!(Family::Poisson.unit_deviance(0.0, 2.0) > 0.0);
    }

    #[test]
    fn test_negbin_variance_and_density() {
        let nb = Family::NegativeBinomial { theta: Some(2.0) };
        assert_relative_eq!(nb.variance(4.0), 12.0, epsilon = 1e-12);

        // Densities over the support sum to one.
        let total: f64 = (0..400).map(|y| negbin_log_density(y as f64, 3.0, 2.0).exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_poisson_log_likelihood() {
        // log P(Y = 2 | μ = 1.5) = 2 ln 1.5 − 1.5 − ln 2
        let ll = Family::Poisson.log_likelihood(&[2.0], &[1.5], None, 1.0);
        assert_relative_eq!(ll, 2.0 * 1.5f64.ln() - 1.5 - 2.0f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_normal_helpers() {
        assert_relative_eq!(std_normal_cdf(0.0), 0.5, epsilon = 1e-14);
        assert_relative_eq!(std_normal_cdf(1.959963984540054), 0.975, epsilon = 1e-9);
        assert_relative_eq!(std_normal_quantile(0.975), 1.959963984540054, epsilon = 1e-8);
    }

    #[test]
    fn test_from_name() {
        assert!(matches!(Family::from_name("poisson"), Ok(Family::Poisson)));
        assert!(Family::from_name("tweedie").is_err());
    }
}
