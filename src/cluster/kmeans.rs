//! K-Means clustering for cluster-based detectors

use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ClusterPartition;
use crate::error::{AnomalyError, Result};

/// K-Means clustering (Lloyd's algorithm with k-means++ init)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeans {
    /// Number of clusters
    pub n_clusters: usize,
    /// Maximum iterations
    pub max_iter: usize,
    /// Convergence tolerance on centroid movement
    pub tol: f64,
    /// Random seed
    pub random_state: Option<u64>,
}

impl Default for KMeans {
    fn default() -> Self {
        Self::new(5)
    }
}

impl KMeans {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            max_iter: 300,
            tol: 1e-4,
            random_state: Some(42),
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_random_state(mut self, seed: Option<u64>) -> Self {
        self.random_state = seed;
        self
    }

    /// K-Means++ initialization
    fn kmeans_pp_init(x: ArrayView2<f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
        let n_samples = x.nrows();
        let mut centroids = Array2::zeros((k, x.ncols()));

        let first = (rng.next_u64() as usize) % n_samples;
        centroids.row_mut(0).assign(&x.row(first));

        for c in 1..k {
            // D² to the nearest chosen centroid
            let dists: Vec<f64> = (0..n_samples)
                .into_par_iter()
                .map(|i| {
                    (0..c)
                        .map(|j| euclidean_sq(x.row(i), centroids.row(j)))
                        .fold(f64::MAX, f64::min)
                })
                .collect();

            let total: f64 = dists.iter().sum();
            if total <= 0.0 {
                let idx = (rng.next_u64() as usize) % n_samples;
                centroids.row_mut(c).assign(&x.row(idx));
                continue;
            }

            let r = (rng.next_u64() as f64 / u64::MAX as f64) * total;
            let mut cumulative = 0.0;
            let mut chosen = n_samples - 1;
            for (i, &d) in dists.iter().enumerate() {
                cumulative += d;
                if cumulative >= r {
                    chosen = i;
                    break;
                }
            }
            centroids.row_mut(c).assign(&x.row(chosen));
        }

        centroids
    }

    fn nearest(row: ArrayView1<f64>, centroids: &Array2<f64>) -> usize {
        let mut best_c = 0;
        let mut best_dist = f64::MAX;
        for (c, centroid) in centroids.rows().into_iter().enumerate() {
            let d = euclidean_sq(row, centroid);
            if d < best_dist {
                best_dist = d;
                best_c = c;
            }
        }
        best_c
    }

    /// Cluster `x`. More clusters than points are clamped to the number
    /// of points.
    pub fn fit(&self, x: ArrayView2<f64>) -> Result<ClusterPartition> {
        let n_samples = x.nrows();
        if n_samples == 0 {
            return Err(AnomalyError::InvalidInput("cannot cluster an empty point set".to_string()));
        }
        if self.n_clusters == 0 {
            return Err(AnomalyError::ConfigError("n_clusters must be at least 1".to_string()));
        }
        let k = if n_samples < self.n_clusters {
            warn!(requested = self.n_clusters, used = n_samples, "More clusters than points, clamping");
            n_samples
        } else {
            self.n_clusters
        };

        let mut rng = ChaCha8Rng::seed_from_u64(self.random_state.unwrap_or(42));
        let mut centroids = Self::kmeans_pp_init(x, k, &mut rng);
        let mut labels = vec![usize::MAX; n_samples];
        let mut iterations = 0;

        for _iter in 0..self.max_iter {
            iterations += 1;
            let new_labels: Vec<usize> = (0..n_samples)
                .into_par_iter()
                .map(|i| Self::nearest(x.row(i), &centroids))
                .collect();

            let changed = new_labels.iter().zip(labels.iter()).filter(|(a, b)| a != b).count();
            labels = new_labels;

            // Update step: recompute centroids
            let mut new_centroids = Array2::zeros(centroids.dim());
            let mut counts = vec![0usize; k];
            for (i, &c) in labels.iter().enumerate() {
                counts[c] += 1;
                let mut row = new_centroids.row_mut(c);
                row += &x.row(i);
            }
            for c in 0..k {
                if counts[c] > 0 {
                    new_centroids.row_mut(c).mapv_inplace(|v| v / counts[c] as f64);
                } else {
                    // Empty cluster: reinitialize randomly
                    let idx = (rng.next_u64() as usize) % n_samples;
                    new_centroids.row_mut(c).assign(&x.row(idx));
                }
            }

            let shift: f64 = centroids
                .iter()
                .zip(new_centroids.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();

            centroids = new_centroids;

            if changed == 0 || shift < self.tol {
                break;
            }
        }

        // Labels match the final centroids
        let labels: Vec<usize> = (0..n_samples)
            .into_par_iter()
            .map(|i| Self::nearest(x.row(i), &centroids))
            .collect();

        debug!(n_samples, k, iterations, "K-Means converged");
        ClusterPartition::from_assignment(x, labels, k)
    }
}

fn euclidean_sq(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}
