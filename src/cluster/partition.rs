//! Point-to-cluster assignment with centroids and sizes

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::distance::DistanceMeasure;
use crate::error::{AnomalyError, Result};

/// Cluster membership of a point set
///
/// `sizes` always sums to the number of assigned points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPartition {
    assignment: Vec<usize>,
    centroids: Array2<f64>,
    sizes: Vec<usize>,
}

impl ClusterPartition {
    /// Build from an assignment and one centroid row per cluster
    pub fn new(assignment: Vec<usize>, centroids: Array2<f64>) -> Result<Self> {
        let n_clusters = centroids.nrows();
        let mut sizes = vec![0usize; n_clusters];
        for (i, &c) in assignment.iter().enumerate() {
            if c >= n_clusters {
                return Err(AnomalyError::InvalidInput(format!(
                    "point {i} is assigned to cluster {c}, but only {n_clusters} clusters exist"
                )));
            }
            sizes[c] += 1;
        }
        Ok(Self {
            assignment,
            centroids,
            sizes,
        })
    }

    /// Build from an assignment, using member means as centroids. Empty
    /// clusters get a zero centroid.
    pub fn from_assignment(points: ArrayView2<f64>, assignment: Vec<usize>, n_clusters: usize) -> Result<Self> {
        if assignment.len() != points.nrows() {
            return Err(AnomalyError::ShapeError {
                expected: format!("{} cluster ids", points.nrows()),
                actual: format!("{} cluster ids", assignment.len()),
            });
        }

        let mut centroids = Array2::zeros((n_clusters, points.ncols()));
        let mut counts = vec![0usize; n_clusters];
        for (i, &c) in assignment.iter().enumerate() {
            if c >= n_clusters {
                return Err(AnomalyError::InvalidInput(format!(
                    "point {i} is assigned to cluster {c}, but only {n_clusters} clusters exist"
                )));
            }
            counts[c] += 1;
            let mut row = centroids.row_mut(c);
            row += &points.row(i);
        }
        for (c, &count) in counts.iter().enumerate() {
            if count > 0 {
                centroids.row_mut(c).mapv_inplace(|v| v / count as f64);
            }
        }

        Self::new(assignment, centroids)
    }

    pub fn n_clusters(&self) -> usize {
        self.sizes.len()
    }

    /// Number of assigned points
    pub fn len(&self) -> usize {
        self.assignment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignment.is_empty()
    }

    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    pub fn cluster_of(&self, i: usize) -> usize {
        self.assignment[i]
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }

    pub fn centroid(&self, c: usize) -> ArrayView1<'_, f64> {
        self.centroids.row(c)
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Indices of the points in cluster `c`
    pub fn members(&self, c: usize) -> Vec<usize> {
        self.assignment
            .iter()
            .enumerate()
            .filter(|&(_, &a)| a == c)
            .map(|(i, _)| i)
            .collect()
    }

    /// Cluster ids by descending size; equal sizes keep id order.
    pub fn ranked_by_size(&self) -> Vec<usize> {
        rank_by_size(&self.sizes)
    }

    /// Check that the partition describes `points`
    pub fn check_points(&self, points: ArrayView2<f64>) -> Result<()> {
        if self.len() != points.nrows() {
            return Err(AnomalyError::ShapeError {
                expected: format!("partition of {} points", points.nrows()),
                actual: format!("partition of {} points", self.len()),
            });
        }
        if self.centroids.ncols() != points.ncols() {
            return Err(AnomalyError::ShapeError {
                expected: format!("centroids of dimension {}", points.ncols()),
                actual: format!("centroids of dimension {}", self.centroids.ncols()),
            });
        }
        Ok(())
    }

    /// Remove clusters with fewer than `limit` points by moving their
    /// points to the nearest centroid of a cluster with more than `limit`
    /// points. Centroids are left unchanged.
    ///
    /// Returns a mask of the removed clusters. When no cluster is large
    /// enough to take the points, nothing moves.
    pub fn reassign_small_clusters(
        &mut self,
        points: ArrayView2<f64>,
        measure: &dyn DistanceMeasure,
        limit: f64,
    ) -> Vec<bool> {
        let removed: Vec<bool> = self.sizes.iter().map(|&s| (s as f64) < limit).collect();
        let targets: Vec<usize> = (0..self.n_clusters())
            .filter(|&c| self.sizes[c] as f64 > limit)
            .collect();

        if targets.is_empty() {
            warn!(limit, n_clusters = self.n_clusters(), "No cluster is large enough to absorb small clusters");
            return removed;
        }

        let mut moved = 0usize;
        for i in 0..self.assignment.len() {
            let from = self.assignment[i];
            if !removed[from] {
                continue;
            }
            let mut best = targets[0];
            let mut best_distance = f64::INFINITY;
            for &c in &targets {
                let d = measure.distance(points.row(i), self.centroids.row(c));
                if d < best_distance {
                    best_distance = d;
                    best = c;
                }
            }
            self.assignment[i] = best;
            self.sizes[from] -= 1;
            self.sizes[best] += 1;
            moved += 1;
        }

        let n_removed = removed.iter().filter(|&&r| r).count();
        if n_removed > 0 {
            info!(limit, removed = n_removed, moved, "Reassigned points of small clusters");
        }
        removed
    }
}

/// Indices of `sizes` by descending size; equal sizes keep index order.
pub(crate) fn rank_by_size(sizes: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]));
    order
}
