//! Generalized linear model fitting by iteratively reweighted least squares.
//!
//! Fitting happens on a standardized copy of the design. Coefficients and
//! their covariance are mapped back to the raw columns before they leave
//! this module, so callers only ever see raw-scale estimates.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use statrs::distribution::{Binomial, Discrete};

use crate::design::{DesignMatrix, standardize};

const MU_EPSILON: f64 = f64::EPSILON;
const MAX_STEP_HALVINGS: usize = 20;
const PIVOT_TOLERANCE: f64 = 1e-12;

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("{model}: did not converge after {iterations} iterations")]
    NotConverged { model: String, iterations: usize },

    #[error("{model}: information matrix is singular")]
    Singular { model: String },

    #[error("covariance matrix is not positive semi-definite (smallest eigenvalue {min_eigenvalue})")]
    InvalidCovariance { min_eigenvalue: f64 },

    #[error("{model}: no observations to fit")]
    EmptyDesign { model: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Logit,
    Log,
}

impl Link {
    pub fn link(&self, mu: f64) -> f64 {
        match self {
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Log => mu.ln(),
        }
    }

    pub fn inverse(&self, eta: f64) -> f64 {
        match self {
            Link::Logit => 1.0 / (1.0 + (-eta).exp()),
            Link::Log => eta.exp(),
        }
    }

    /// d mu / d eta
    fn mu_eta(&self, eta: f64) -> f64 {
        match self {
            Link::Logit => {
                let mu = self.inverse(eta);
                f64::max(mu * (1.0 - mu), MU_EPSILON)
            }
            Link::Log => f64::max(eta.exp(), MU_EPSILON),
        }
    }
}

/// Linear predictor `X b + offset` mapped through the inverse link.
pub fn predict_with_coefficients(
    design: &DMatrix<f64>,
    link: Link,
    coefficients: &DVector<f64>,
    offset: Option<&DVector<f64>>,
) -> DVector<f64> {
    let mut eta = design * coefficients;
    if let Some(offset) = offset {
        eta += offset;
    }
    eta.map(|e| link.inverse(e))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Family {
    /// Response is a proportion, prior weights are trial counts.
    Binomial,
    Poisson,
    NegativeBinomial { theta: f64 },
}

impl Family {
    fn link(&self) -> Link {
        match self {
            Family::Binomial => Link::Logit,
            Family::Poisson | Family::NegativeBinomial { .. } => Link::Log,
        }
    }

    fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Binomial => mu * (1.0 - mu),
            Family::Poisson => mu,
            Family::NegativeBinomial { theta } => mu + mu * mu / theta,
        }
    }

    fn mu(&self, eta: f64) -> f64 {
        let mu = self.link().inverse(eta);
        match self {
            Family::Binomial => mu.clamp(MU_EPSILON, 1.0 - MU_EPSILON),
            _ => mu,
        }
    }

    pub(crate) fn mu_start(&self, y: f64, weight: f64) -> f64 {
        match self {
            Family::Binomial => (weight * y + 0.5) / (weight + 1.0),
            _ => y + 0.1,
        }
    }

    fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        match self {
            Family::Binomial => 2.0 * (y_log_y(y, mu) + y_log_y(1.0 - y, 1.0 - mu)),
            Family::Poisson => 2.0 * (y_log_y(y, mu) - (y - mu)),
            Family::NegativeBinomial { theta } => {
                2.0 * (y_log_y(y, mu) - (y + theta) * ((y + theta) / (mu + theta)).ln())
            }
        }
    }

    pub(crate) fn deviance(&self, y: &DVector<f64>, mu: &DVector<f64>, weights: &DVector<f64>) -> f64 {
        (0..y.len())
            .filter(|&i| weights[i] > 0.0)
            .map(|i| weights[i] * self.unit_deviance(y[i], mu[i]))
            .sum()
    }
}

fn y_log_y(y: f64, mu: f64) -> f64 {
    if y > 0.0 { y * (y / mu).ln() } else { 0.0 }
}

pub(crate) struct IrlsFit {
    pub coefficients: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub mu: DVector<f64>,
    pub deviance: f64,
    pub iterations: usize,
}

pub(crate) struct IrlsControl {
    pub max_iterations: usize,
    pub epsilon: f64,
}

impl Default for IrlsControl {
    fn default() -> Self {
        IrlsControl {
            max_iterations: 25,
            epsilon: 1e-8,
        }
    }
}

/// Cholesky factor of a symmetric information matrix, rejecting
/// numerically rank-deficient ones.
pub(crate) fn factor_information(
    information: DMatrix<f64>,
    model: &str,
) -> Result<Cholesky<f64, Dyn>, FitError> {
    let singular = || FitError::Singular {
        model: model.to_string(),
    };
    let chol = information.cholesky().ok_or_else(singular)?;
    let pivots = chol.l_dirty().diagonal().map(|d| d * d);
    let largest = pivots.max();
    if !largest.is_finite() || pivots.min() <= PIVOT_TOLERANCE * largest {
        return Err(singular());
    }
    Ok(chol)
}

fn weighted_system(
    x: &DMatrix<f64>,
    family: Family,
    y: &DVector<f64>,
    weights: &DVector<f64>,
    offset: &DVector<f64>,
    eta: &DVector<f64>,
    mu: &DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let link = family.link();
    let mut xw = x.clone();
    let mut zw = DVector::zeros(x.nrows());
    for i in 0..x.nrows() {
        let d = link.mu_eta(eta[i]);
        let w = weights[i] * d * d / family.variance(mu[i]);
        let scale = if w.is_finite() && w > 0.0 { w.sqrt() } else { 0.0 };
        let z = eta[i] - offset[i] + (y[i] - mu[i]) / d;
        xw.row_mut(i).scale_mut(scale);
        zw[i] = if scale > 0.0 { scale * z } else { 0.0 };
    }
    (xw.tr_mul(&xw), xw.tr_mul(&zw))
}

pub(crate) fn irls(
    design: &DesignMatrix,
    family: Family,
    y: &DVector<f64>,
    weights: &DVector<f64>,
    offset: &DVector<f64>,
    mu_start: DVector<f64>,
    control: &IrlsControl,
    model: &str,
) -> Result<IrlsFit, FitError> {
    if weights.iter().all(|w| *w <= 0.0) {
        return Err(FitError::EmptyDesign {
            model: model.to_string(),
        });
    }
    let standardized = standardize(&design.matrix);
    let x = &standardized.matrix;
    let link = family.link();

    let mut mu = mu_start;
    let mut eta = mu.map(|m| link.link(m));
    let mut deviance = family.deviance(y, &mu, weights);
    let mut beta: Option<DVector<f64>> = None;

    for iteration in 1..=control.max_iterations {
        let (xtwx, xtwz) = weighted_system(x, family, y, weights, offset, &eta, &mu);
        let mut candidate = factor_information(xtwx, model)?.solve(&xtwz);

        let mut halvings = 0;
        let (next_eta, next_mu, next_deviance) = loop {
            let next_eta = x * &candidate + offset;
            let next_mu = next_eta.map(|e| family.mu(e));
            let next_deviance = family.deviance(y, &next_mu, weights);
            if next_deviance.is_finite() {
                break (next_eta, next_mu, next_deviance);
            }
            match &beta {
                Some(previous) if halvings < MAX_STEP_HALVINGS => {
                    candidate = (&candidate + previous) * 0.5;
                    halvings += 1;
                }
                _ => {
                    return Err(FitError::NotConverged {
                        model: model.to_string(),
                        iterations: iteration,
                    });
                }
            }
        };

        let converged =
            (next_deviance - deviance).abs() / (next_deviance.abs() + 0.1) < control.epsilon;
        eta = next_eta;
        mu = next_mu;
        deviance = next_deviance;

        if converged {
            let (information, _) = weighted_system(x, family, y, weights, offset, &eta, &mu);
            let covariance_std = factor_information(information, model)?.inverse();
            let t = &standardized.transform;
            return Ok(IrlsFit {
                coefficients: t * candidate,
                covariance: t * covariance_std * t.transpose(),
                mu,
                deviance,
                iterations: iteration,
            });
        }
        beta = Some(candidate);
    }

    Err(FitError::NotConverged {
        model: model.to_string(),
        iterations: control.max_iterations,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientSummary {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
}

impl CoefficientSummary {
    pub fn new(term: String, estimate: f64, variance: f64) -> Self {
        let std_error = variance.max(0.0).sqrt();
        CoefficientSummary {
            term,
            estimate,
            std_error,
            z_value: estimate / std_error,
        }
    }
}

/// A fitted single-response GLM. Immutable once built; draws go through
/// [`predict_with_coefficients`] with sampled coefficients instead.
#[derive(Debug, Clone)]
pub struct FittedGlm {
    pub model: String,
    pub names: Vec<String>,
    pub link: Link,
    pub coefficients: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub deviance: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub iterations: usize,
    /// Negative-binomial shape, `None` for other families.
    pub theta: Option<f64>,
}

impl FittedGlm {
    pub fn predict(&self, design: &DMatrix<f64>, offset: Option<&DVector<f64>>) -> DVector<f64> {
        predict_with_coefficients(design, self.link, &self.coefficients, offset)
    }

    pub fn summary(&self) -> Vec<CoefficientSummary> {
        self.names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                CoefficientSummary::new(name.clone(), self.coefficients[j], self.covariance[(j, j)])
            })
            .collect()
    }

    pub fn log_summary(&self) {
        match self.theta {
            Some(theta) => log::info!(
                "{}: converged in {} iterations, deviance {:.3}, AIC {:.3}, theta {:.4}",
                self.model,
                self.iterations,
                self.deviance,
                self.aic,
                theta
            ),
            None => log::info!(
                "{}: converged in {} iterations, deviance {:.3}, AIC {:.3}",
                self.model,
                self.iterations,
                self.deviance,
                self.aic
            ),
        }
    }
}

/// Logistic regression with `successes` out of `trials` per row. Rows with
/// zero trials carry no likelihood.
pub fn fit_binomial(
    design: &DesignMatrix,
    successes: &[f64],
    trials: &[f64],
    model: &str,
) -> Result<FittedGlm, FitError> {
    let n = design.nrows();
    let weights = DVector::from_column_slice(trials);
    let y = DVector::from_fn(n, |i, _| {
        if trials[i] > 0.0 { successes[i] / trials[i] } else { 0.0 }
    });
    let offset = DVector::zeros(n);
    let mu_start = DVector::from_fn(n, |i, _| Family::Binomial.mu_start(y[i], weights[i]));
    let fit = irls(
        design,
        Family::Binomial,
        &y,
        &weights,
        &offset,
        mu_start,
        &IrlsControl::default(),
        model,
    )?;

    let log_likelihood: f64 = (0..n)
        .filter(|&i| trials[i] > 0.0)
        .map(|i| match Binomial::new(fit.mu[i], trials[i] as u64) {
            Ok(binomial) => binomial.ln_pmf(successes[i] as u64),
            Err(_) => f64::NAN,
        })
        .sum();
    let n_parameters = design.ncols() as f64;

    Ok(FittedGlm {
        model: model.to_string(),
        names: design.names.clone(),
        link: Link::Logit,
        coefficients: fit.coefficients,
        covariance: fit.covariance,
        deviance: fit.deviance,
        log_likelihood,
        aic: -2.0 * log_likelihood + 2.0 * n_parameters,
        iterations: fit.iterations,
        theta: None,
    })
}

#[cfg(test)]
mod test {
    use statrs::function::factorial::ln_binomial;

    use super::*;
    use crate::design::DesignBuilder;

    #[test]
    fn test_predict_with_coefficients() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 2.0]);
        let b = DVector::from_vec(vec![-1.0, 0.5]);
        let p = predict_with_coefficients(&x, Link::Logit, &b, None);
        assert!(f64::abs(p[0] - 1.0 / (1.0 + f64::exp(1.0))) < 1e-15);
        assert!(f64::abs(p[1] - 0.5) < 1e-15);

        let offset = DVector::from_vec(vec![0.25, -0.25]);
        let m = predict_with_coefficients(&x, Link::Log, &b, Some(&offset));
        assert!(f64::abs(m[0] - f64::exp(-0.75)) < 1e-15);
        assert!(f64::abs(m[1] - f64::exp(-0.25)) < 1e-15);
    }

    #[test]
    fn test_intercept_only_binomial() {
        let design = DesignBuilder::new(1).build();
        let fit = fit_binomial(&design, &[40.0], &[100.0], "intercept").unwrap();
        assert!(f64::abs(fit.coefficients[0] - f64::ln(0.4 / 0.6)) < 1e-8);
        let se = fit.summary()[0].std_error;
        assert!(f64::abs(se - f64::sqrt(1.0 / 24.0)) < 1e-6);
        let p = fit.predict(&design.matrix, None);
        assert!(f64::abs(p[0] - 0.4) < 1e-8);

        let expected = ln_binomial(100, 40) + 40.0 * f64::ln(0.4) + 60.0 * f64::ln(0.6);
        assert!(f64::abs(fit.log_likelihood - expected) < 1e-6);
        assert!(f64::abs(fit.aic - (2.0 - 2.0 * expected)) < 1e-6);
    }

    #[test]
    fn test_binomial_recovers_coefficients() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 250.0).collect();
        let trials = vec![100_000.0; xs.len()];
        let successes: Vec<f64> = xs
            .iter()
            .map(|x| (Link::Logit.inverse(-1.0 + 0.0004 * x) * 100_000.0).round())
            .collect();
        let design = DesignBuilder::new(xs.len()).numeric("x", xs).build();
        let fit = fit_binomial(&design, &successes, &trials, "grid").unwrap();
        assert!(f64::abs(fit.coefficients[0] + 1.0) < 1e-2);
        assert!(f64::abs(fit.coefficients[1] - 0.0004) < 1e-5);
        assert!(fit.aic.is_finite());
    }

    #[test]
    fn test_zero_trial_rows_do_not_change_fit() {
        let design = DesignBuilder::new(3)
            .numeric("x", vec![0.0, 1.0, 2.0])
            .build();
        let with_empty = fit_binomial(&design, &[10.0, 30.0, 0.0], &[50.0, 60.0, 0.0], "empty").unwrap();
        let reduced_design = DesignBuilder::new(2).numeric("x", vec![0.0, 1.0]).build();
        let reduced = fit_binomial(&reduced_design, &[10.0, 30.0], &[50.0, 60.0], "reduced").unwrap();
        for j in 0..2 {
            assert!(f64::abs(with_empty.coefficients[j] - reduced.coefficients[j]) < 1e-4);
        }
        let p = with_empty.predict(&design.matrix, None);
        assert!(p[2] > 0.0 && p[2] < 1.0);
    }

    #[test]
    fn test_collinear_design_is_singular() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let design = DesignBuilder::new(4)
            .numeric("a", x.clone())
            .numeric("b", x)
            .build();
        let result = fit_binomial(&design, &[1.0, 2.0, 3.0, 4.0], &[10.0; 4], "collinear");
        assert!(matches!(result, Err(FitError::Singular { .. })));
    }

    #[test]
    fn test_no_trials_is_empty() {
        let design = DesignBuilder::new(2).build();
        let result = fit_binomial(&design, &[0.0, 0.0], &[0.0, 0.0], "nothing");
        assert!(matches!(result, Err(FitError::EmptyDesign { .. })));
    }
}
