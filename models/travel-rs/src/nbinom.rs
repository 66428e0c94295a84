//! Negative-binomial regression with a log link and an estimated shape.
//!
//! The fit starts from a Poisson GLM, then alternates IRLS at a fixed
//! `theta` with a maximum-likelihood update of `theta` given the fitted
//! means, until both the log-likelihood and `theta` settle.

use nalgebra::DVector;
use statrs::function::gamma::{digamma, ln_gamma};

use crate::design::DesignMatrix;
use crate::glm::{FitError, FittedGlm, Family, IrlsControl, Link, irls};

/// Beyond this the data shows no overdispersion and the fit is Poisson.
pub const THETA_MAX: f64 = 1e8;
const THETA_MIN: f64 = 1e-8;
const THETA_ITERATIONS: usize = 25;
const OUTER_ITERATIONS: usize = 25;
const OUTER_EPSILON: f64 = 1e-6;

pub fn nb_log_likelihood(y: &DVector<f64>, mu: &DVector<f64>, theta: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&y, &mu)| {
            let log_p = -(mu / theta).ln_1p();
            let log_q = if y > 0.0 { y * (mu / (theta + mu)).ln() } else { 0.0 };
            ln_gamma(theta + y) - ln_gamma(theta) - ln_gamma(y + 1.0) + theta * log_p + log_q
        })
        .sum()
}

/// Second derivative of `ln_gamma`, by upward recurrence to `x >= 10` and
/// the asymptotic series there.
fn trigamma(x: f64) -> f64 {
    let mut x = x;
    let mut result = 0.0;
    while x < 10.0 {
        result += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    result
        + inv
        + 0.5 * inv2
        + inv * inv2
            * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 * (1.0 / 30.0 - inv2 * 5.0 / 66.0))))
}

/// Maximum-likelihood `theta` for counts `y` with fixed means `mu`, by
/// Newton's method from the moment estimate.
pub fn theta_ml(y: &DVector<f64>, mu: &DVector<f64>) -> f64 {
    let moment: f64 = y
        .iter()
        .zip(mu.iter())
        .map(|(y, mu)| (y / mu - 1.0).powi(2))
        .sum();
    let mut theta = y.len() as f64 / moment;
    if !theta.is_finite() || theta >= THETA_MAX {
        return THETA_MAX;
    }

    let tolerance = f64::EPSILON.powf(0.25);
    for _ in 0..THETA_ITERATIONS {
        theta = theta.abs().max(THETA_MIN);
        let mut score = 0.0;
        let mut information = 0.0;
        for (&y, &mu) in y.iter().zip(mu.iter()) {
            score += digamma(theta + y) - digamma(theta) + theta.ln() + 1.0
                - (theta + mu).ln()
                - (y + theta) / (mu + theta);
            information += -trigamma(theta + y) + trigamma(theta) - 1.0 / theta
                + 2.0 / (mu + theta)
                - (y + theta) / (mu + theta).powi(2);
        }
        if !score.is_finite() || !(information > 0.0) {
            break;
        }
        let step = score / information;
        theta += step;
        if theta >= THETA_MAX {
            return THETA_MAX;
        }
        if step.abs() <= tolerance {
            return theta.clamp(THETA_MIN, THETA_MAX);
        }
    }
    log::warn!("theta estimate stopped before converging at {theta:.4}");
    theta.clamp(THETA_MIN, THETA_MAX)
}

pub fn fit_negative_binomial(
    design: &DesignMatrix,
    counts: &[f64],
    offset: &DVector<f64>,
    model: &str,
) -> Result<FittedGlm, FitError> {
    let n = design.nrows();
    let p = design.ncols();
    let y = DVector::from_column_slice(counts);
    let weights = DVector::from_element(n, 1.0);
    let control = IrlsControl::default();

    let mu_start = y.map(|y| Family::Poisson.mu_start(y, 1.0));
    let poisson = irls(design, Family::Poisson, &y, &weights, offset, mu_start, &control, model)?;
    log::debug!("{model}: Poisson start deviance {:.3}", poisson.deviance);

    let d1 = (2.0 * n.saturating_sub(p).max(1) as f64).sqrt();
    let mut theta = theta_ml(&y, &poisson.mu);
    let mut mu = poisson.mu;
    let mut log_likelihood = nb_log_likelihood(&y, &mu, theta);

    for iteration in 1..=OUTER_ITERATIONS {
        let family = Family::NegativeBinomial { theta };
        let fit = irls(design, family, &y, &weights, offset, mu, &control, model)?;
        let next_theta = theta_ml(&y, &fit.mu);
        let next_log_likelihood = nb_log_likelihood(&y, &fit.mu, next_theta);
        let change = (next_log_likelihood - log_likelihood).abs() / d1
            + ((next_theta - theta) / theta).abs();
        log::debug!("{model}: outer iteration {iteration}, theta {next_theta:.5}");

        if change < OUTER_EPSILON {
            let log_likelihood = nb_log_likelihood(&y, &fit.mu, theta);
            return Ok(FittedGlm {
                model: model.to_string(),
                names: design.names.clone(),
                link: Link::Log,
                coefficients: fit.coefficients,
                covariance: fit.covariance,
                deviance: fit.deviance,
                log_likelihood,
                aic: -2.0 * log_likelihood + 2.0 * (p as f64 + 1.0),
                iterations: iteration,
                theta: Some(theta),
            });
        }

        theta = next_theta;
        mu = fit.mu;
        log_likelihood = next_log_likelihood;
    }

    Err(FitError::NotConverged {
        model: model.to_string(),
        iterations: OUTER_ITERATIONS,
    })
}
