//! Multinomial logistic regression for destination choice.
//!
//! With `K` categories and `p` covariates the model has a `(K - 1) x p`
//! coefficient matrix, one row per non-reference category in column order.
//! The reference category's linear predictor is fixed at zero, so its
//! unnormalized score is `exp(0) = 1`. Flattened coefficient vectors and
//! covariance matrices are category-major: index `j * p + c` is covariate
//! `c` of non-reference row `j`.

use nalgebra::{DMatrix, DVector};

use crate::design::{DesignMatrix, standardize};
use crate::glm::{CoefficientSummary, FitError, factor_information};

const MAX_ITERATIONS: usize = 100;
const MAX_STEP_HALVINGS: usize = 20;
const EPSILON: f64 = 1e-8;

/// One surveyed trip: the covariate row it came from and where it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripObservation {
    pub row: usize,
    pub category: usize,
}

/// Linear predictors for all `K` categories, with a zero column inserted
/// at `reference`.
pub fn linear_predictors(
    design: &DMatrix<f64>,
    coefficients: &DMatrix<f64>,
    reference: usize,
) -> DMatrix<f64> {
    let non_reference = design * coefficients.transpose();
    non_reference.insert_column(reference, 0.0)
}

/// Row-wise softmax. Each row is shifted by its maximum before
/// exponentiating, which leaves the normalized result unchanged.
pub fn softmax_rows(mut eta: DMatrix<f64>) -> DMatrix<f64> {
    for mut row in eta.row_iter_mut() {
        let max = row.max();
        row.apply(|v| *v = (*v - max).exp());
        let total = row.sum();
        row /= total;
    }
    eta
}

/// Destination-choice probabilities, one row per design row and one column
/// per category.
pub fn destination_probabilities(
    design: &DMatrix<f64>,
    coefficients: &DMatrix<f64>,
    reference: usize,
) -> DMatrix<f64> {
    softmax_rows(linear_predictors(design, coefficients, reference))
}

pub fn flatten(coefficients: &DMatrix<f64>) -> DVector<f64> {
    let (rows, p) = coefficients.shape();
    DVector::from_fn(rows * p, |i, _| coefficients[(i / p, i % p)])
}

pub fn unflatten(flat: &DVector<f64>, rows: usize, p: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows, p, |j, c| flat[j * p + c])
}

#[derive(Debug, Clone)]
pub struct MultinomialFit {
    pub model: String,
    pub names: Vec<String>,
    pub categories: Vec<String>,
    pub reference: usize,
    pub coefficients: DMatrix<f64>,
    pub covariance: DMatrix<f64>,
    pub deviance: f64,
    pub aic: f64,
    pub iterations: usize,
}

impl MultinomialFit {
    pub fn predict(&self, design: &DMatrix<f64>) -> DMatrix<f64> {
        destination_probabilities(design, &self.coefficients, self.reference)
    }

    pub fn flat_coefficients(&self) -> DVector<f64> {
        flatten(&self.coefficients)
    }

    pub fn non_reference_categories(&self) -> impl Iterator<Item = &String> {
        self.categories
            .iter()
            .enumerate()
            .filter(|(k, _)| *k != self.reference)
            .map(|(_, c)| c)
    }

    pub fn summary(&self) -> Vec<CoefficientSummary> {
        let p = self.names.len();
        self.non_reference_categories()
            .enumerate()
            .flat_map(|(j, category)| {
                self.names.iter().enumerate().map(move |(c, name)| {
                    let i = j * p + c;
                    CoefficientSummary::new(
                        format!("{category}:{name}"),
                        self.coefficients[(j, c)],
                        self.covariance[(i, i)],
                    )
                })
            })
            .collect()
    }

    pub fn log_summary(&self) {
        log::info!(
            "{}: converged in {} iterations, deviance {:.3}, AIC {:.3}, reference {}",
            self.model,
            self.iterations,
            self.deviance,
            self.aic,
            self.categories[self.reference]
        );
    }
}

struct Tally {
    /// Trips per design row and category.
    counts: DMatrix<f64>,
    totals: Vec<f64>,
}

fn tally(observations: &[TripObservation], n: usize, k: usize) -> Tally {
    let mut counts = DMatrix::zeros(n, k);
    for obs in observations {
        counts[(obs.row, obs.category)] += 1.0;
    }
    let totals = counts.row_iter().map(|r| r.sum()).collect();
    Tally { counts, totals }
}

fn deviance(probabilities: &DMatrix<f64>, tally: &Tally) -> f64 {
    let mut total = 0.0;
    for (count, p) in tally.counts.iter().zip(probabilities.iter()) {
        if *count > 0.0 {
            total -= 2.0 * count * p.ln();
        }
    }
    total
}

fn score_and_information(
    x: &DMatrix<f64>,
    probabilities: &DMatrix<f64>,
    tally: &Tally,
    reference: usize,
) -> (DVector<f64>, DMatrix<f64>) {
    let p = x.ncols();
    let k = probabilities.ncols();
    let categories: Vec<usize> = (0..k).filter(|c| *c != reference).collect();
    let dim = categories.len() * p;
    let mut score = DVector::zeros(dim);
    let mut information = DMatrix::zeros(dim, dim);

    for (r, total) in tally.totals.iter().enumerate() {
        if *total == 0.0 {
            continue;
        }
        let xr = x.row(r).transpose();
        let outer = &xr * xr.transpose();
        for (j, &cj) in categories.iter().enumerate() {
            let pj = probabilities[(r, cj)];
            let residual = tally.counts[(r, cj)] - total * pj;
            let mut block = score.rows_mut(j * p, p);
            block.axpy(residual, &xr, 1.0);
            for (l, &cl) in categories.iter().enumerate() {
                let delta = if j == l { 1.0 } else { 0.0 };
                let weight = total * pj * (delta - probabilities[(r, cl)]);
                let mut block = information.view_mut((j * p, l * p), (p, p));
                block += &outer * weight;
            }
        }
    }
    (score, information)
}

/// Fits a multinomial logit to individual trips. `categories` names the
/// columns of the response in order, and `reference` indexes the category
/// whose coefficients are fixed at zero.
pub fn fit_multinomial(
    design: &DesignMatrix,
    observations: &[TripObservation],
    categories: Vec<String>,
    reference: usize,
    model: &str,
) -> Result<MultinomialFit, FitError> {
    if observations.is_empty() {
        return Err(FitError::EmptyDesign {
            model: model.to_string(),
        });
    }
    let k = categories.len();
    assert!(reference < k, "reference category out of range");
    let standardized = standardize(&design.matrix);
    let x = &standardized.matrix;
    let p = x.ncols();
    let rows = k - 1;
    let tally = tally(observations, x.nrows(), k);

    let mut beta = DMatrix::zeros(rows, p);
    let mut probabilities = destination_probabilities(x, &beta, reference);
    let mut current = deviance(&probabilities, &tally);

    for iteration in 1..=MAX_ITERATIONS {
        let (score, information) = score_and_information(x, &probabilities, &tally, reference);
        let mut step = unflatten(&factor_information(information, model)?.solve(&score), rows, p);

        let mut halvings = 0;
        let (candidate, candidate_probabilities, candidate_deviance) = loop {
            let candidate = &beta + &step;
            let candidate_probabilities = destination_probabilities(x, &candidate, reference);
            let candidate_deviance = deviance(&candidate_probabilities, &tally);
            let acceptable = candidate_deviance.is_finite()
                && candidate_deviance <= current + EPSILON * (current.abs() + 0.1);
            if acceptable {
                break (candidate, candidate_probabilities, candidate_deviance);
            }
            if halvings == MAX_STEP_HALVINGS {
                return Err(FitError::NotConverged {
                    model: model.to_string(),
                    iterations: iteration,
                });
            }
            step *= 0.5;
            halvings += 1;
        };

        let converged = (current - candidate_deviance).abs() / (candidate_deviance.abs() + 0.1) < EPSILON;
        beta = candidate;
        probabilities = candidate_probabilities;
        current = candidate_deviance;

        if converged {
            let (_, information) = score_and_information(x, &probabilities, &tally, reference);
            let covariance_std = factor_information(information, model)?.inverse();

            let t = &standardized.transform;
            let mut block_transform = DMatrix::zeros(rows * p, rows * p);
            for j in 0..rows {
                block_transform
                    .view_mut((j * p, j * p), (p, p))
                    .copy_from(t);
            }
            let coefficients = &beta * t.transpose();
            let covariance = &block_transform * covariance_std * block_transform.transpose();

            return Ok(MultinomialFit {
                model: model.to_string(),
                names: design.names.clone(),
                categories,
                reference,
                coefficients,
                covariance,
                deviance: current,
                aic: current + 2.0 * (rows * p) as f64,
                iterations: iteration,
            });
        }
    }

    Err(FitError::NotConverged {
        model: model.to_string(),
        iterations: MAX_ITERATIONS,
    })
}
