use nalgebra::{DMatrix, DVector};
use rand::{Rng, distr::Distribution};
use rand_distr::StandardNormal;

use crate::glm::FitError;

/// Relative tolerance for slightly negative eigenvalues from rounding.
const EIGEN_TOLERANCE: f64 = 1e-6;

/// Multivariate normal over coefficient vectors, parameterized by a fitted
/// estimate and its asymptotic covariance.
#[derive(Debug, Clone)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    /// `V * sqrt(L)` from the eigendecomposition `covariance = V L V^T`.
    factor: DMatrix<f64>,
}

impl MultivariateNormal {
    pub fn new(mean: DVector<f64>, covariance: &DMatrix<f64>) -> Result<Self, FitError> {
        let dim = mean.len();
        if covariance.shape() != (dim, dim) {
            return Err(FitError::InvalidCovariance {
                min_eigenvalue: f64::NAN,
            });
        }
        let symmetric = (covariance + covariance.transpose()) * 0.5;
        let eigen = symmetric.symmetric_eigen();
        let largest = eigen.eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let smallest = eigen.eigenvalues.min();
        if !smallest.is_finite() || smallest < -EIGEN_TOLERANCE * largest {
            return Err(FitError::InvalidCovariance {
                min_eigenvalue: smallest,
            });
        }
        let roots = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
        let factor = eigen.eigenvectors * DMatrix::from_diagonal(&roots);
        Ok(MultivariateNormal { mean, factor })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_fn(self.dim(), |_, _| {
            Distribution::<f64>::sample(&StandardNormal, rng)
        });
        &self.mean + &self.factor * z
    }

    pub fn sample_n<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<DVector<f64>> {
        (0..n).map(|_| self.sample(rng)).collect()
    }
}
