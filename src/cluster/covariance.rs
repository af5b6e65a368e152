//! Sample covariance and Mahalanobis distance

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distance::DistanceMeasure;
use crate::error::{AnomalyError, Result};

/// Diagonal perturbation applied to a singular covariance matrix
pub const SINGULAR_RIDGE: f64 = 1e-13;

/// Ridge escalations tried before a factorization is given up
const MAX_RIDGE_STEPS: usize = 40;

/// Symmetric `d x d` sample covariance together with the location it was
/// measured around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    location: Array1<f64>,
    matrix: Array2<f64>,
    n_points: usize,
}

impl CovarianceMatrix {
    /// Covariance around the sample mean
    pub fn from_points(points: ArrayView2<f64>) -> Result<Self> {
        let location = points
            .mean_axis(Axis(0))
            .ok_or_else(|| AnomalyError::InvalidInput("covariance of an empty point set".to_string()))?;
        Self::about(points, location)
    }

    /// Covariance of `points` around a fixed `location`, divided by
    /// `max(n - 1, 1)`. Entries are computed in parallel.
    pub fn about(points: ArrayView2<f64>, location: Array1<f64>) -> Result<Self> {
        let (n, d) = points.dim();
        if n == 0 {
            return Err(AnomalyError::InvalidInput("covariance of an empty point set".to_string()));
        }
        if location.len() != d {
            return Err(AnomalyError::ShapeError {
                expected: format!("location of length {d}"),
                actual: format!("location of length {}", location.len()),
            });
        }

        let centered = &points - &location;
        let divisor = n.saturating_sub(1).max(1) as f64;

        let cells: Vec<(usize, usize)> = (0..d).flat_map(|j| (j..d).map(move |k| (j, k))).collect();
        let values: Vec<f64> = cells
            .par_iter()
            .map(|&(j, k)| centered.column(j).dot(&centered.column(k)) / divisor)
            .collect();

        let mut matrix = Array2::zeros((d, d));
        for (&(j, k), v) in cells.iter().zip(values) {
            matrix[[j, k]] = v;
            matrix[[k, j]] = v;
        }

        Ok(Self { location, matrix, n_points: n })
    }

    /// Wrap an existing symmetric matrix
    pub fn from_parts(location: Array1<f64>, matrix: Array2<f64>, n_points: usize) -> Result<Self> {
        let d = location.len();
        if matrix.dim() != (d, d) {
            return Err(AnomalyError::ShapeError {
                expected: format!("{d}x{d} matrix"),
                actual: format!("{}x{} matrix", matrix.nrows(), matrix.ncols()),
            });
        }
        Ok(Self { location, matrix, n_points })
    }

    pub fn dim(&self) -> usize {
        self.location.len()
    }

    pub fn location(&self) -> &Array1<f64> {
        &self.location
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Number of points the estimate was computed from
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Variance of every dimension
    pub fn variances(&self) -> Array1<f64> {
        self.matrix.diag().to_owned()
    }

    /// Add [`SINGULAR_RIDGE`] to the diagonal
    pub fn add_minimum(&mut self) {
        self.matrix.diag_mut().mapv_inplace(|v| v + SINGULAR_RIDGE);
    }

    /// Add the minimal ridge when the matrix is singular. Returns whether
    /// it was needed.
    pub fn regularize_if_singular(&mut self) -> bool {
        if self.determinant() == 0.0 {
            self.add_minimum();
            true
        } else {
            false
        }
    }

    /// Restrict to the given dimensions
    pub fn project(&self, dims: &[usize]) -> Self {
        let matrix = self.matrix.select(Axis(0), dims).select(Axis(1), dims);
        Self {
            location: self.location.select(Axis(0), dims),
            matrix,
            n_points: self.n_points,
        }
    }

    /// `(1 - lambda) * self + lambda * other`
    pub fn blend(&self, other: &Array2<f64>, lambda: f64) -> Result<Self> {
        if other.dim() != self.matrix.dim() {
            return Err(AnomalyError::ShapeError {
                expected: format!("{}x{} matrix", self.dim(), self.dim()),
                actual: format!("{}x{} matrix", other.nrows(), other.ncols()),
            });
        }
        Ok(Self {
            location: self.location.clone(),
            matrix: &self.matrix * (1.0 - lambda) + other * lambda,
            n_points: self.n_points,
        })
    }

    /// Lower-triangular Cholesky factor, `None` if the matrix is not
    /// positive definite.
    pub fn cholesky(&self) -> Option<Array2<f64>> {
        cholesky_lower(&self.matrix)
    }

    /// Natural log of the determinant; negative infinity when singular.
    pub fn log_determinant(&self) -> f64 {
        match self.cholesky() {
            Some(l) => 2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>(),
            None => f64::NEG_INFINITY,
        }
    }

    /// Determinant, 0 when the matrix is singular
    pub fn determinant(&self) -> f64 {
        self.log_determinant().exp()
    }

    /// Factorize for Mahalanobis distances. A matrix that is not positive
    /// definite gets an escalating ridge until it is.
    pub fn mahalanobis(&self) -> Result<Mahalanobis> {
        if let Some(lower) = self.cholesky() {
            return Ok(Mahalanobis { location: self.location.clone(), lower });
        }
        if self.matrix.iter().any(|v| !v.is_finite()) {
            return Err(AnomalyError::ComputationError("covariance matrix contains non-finite values".to_string()));
        }

        let mut ridge = SINGULAR_RIDGE;
        for _ in 0..MAX_RIDGE_STEPS {
            let mut regularized = self.matrix.clone();
            regularized.diag_mut().mapv_inplace(|v| v + ridge);
            if let Some(lower) = cholesky_lower(&regularized) {
                debug!(ridge, dim = self.dim(), "Regularized covariance for inversion");
                return Ok(Mahalanobis { location: self.location.clone(), lower });
            }
            ridge *= 10.0;
        }
        Err(AnomalyError::ComputationError("covariance matrix could not be regularized".to_string()))
    }
}

fn cholesky_lower(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }

            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 || diag.is_nan() {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Mahalanobis distance under a factorized covariance
#[derive(Debug, Clone)]
pub struct Mahalanobis {
    location: Array1<f64>,
    lower: Array2<f64>,
}

impl Mahalanobis {
    pub fn location(&self) -> &Array1<f64> {
        &self.location
    }

    /// `(x - mu)^T S^-1 (x - mu)`
    pub fn squared_distance(&self, x: ArrayView1<f64>) -> f64 {
        let diff = &x - &self.location;
        self.solve_squared_norm(diff.view())
    }

    // Forward substitution L y = v, returns |y|^2.
    fn solve_squared_norm(&self, v: ArrayView1<f64>) -> f64 {
        let n = v.len();
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..i {
                sum += self.lower[[i, j]] * y[j];
            }
            y[i] = (v[i] - sum) / self.lower[[i, i]];
        }
        y.dot(&y)
    }
}

impl DistanceMeasure for Mahalanobis {
    fn distance(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let diff = &a - &b;
        self.solve_squared_norm(diff.view()).sqrt()
    }

    fn identity(&self) -> String {
        format!("mahalanobis(d={})", self.location.len())
    }
}
