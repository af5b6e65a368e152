//! Cluster-Based Local Outlier Factor (CBLOF)
//!
//! Clusters are split into large and small ones. Points of a large cluster
//! score with the distance to their own centroid, points of a small cluster
//! with the distance to the nearest large centroid. Scores are optionally
//! multiplied by the size of the point's own cluster.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::partition::rank_by_size;
use super::{resolve_partition, ClusterPartition};
use crate::anomaly::{validate_points, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::utils::parallel::ParallelConfig;

/// Rule splitting clusters into large and small ones
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LargeClusterPolicy {
    /// Walk clusters by descending size; the large set ends at the first
    /// cluster where the covered share of points reaches `alpha`, or where
    /// the size ratio to the next cluster is at least `beta`.
    AlphaBeta { alpha: f64, beta: f64 },
    /// Clusters with at least `gamma * n / n_clusters` points are large.
    MinimumSize { gamma: f64 },
}

impl Default for LargeClusterPolicy {
    fn default() -> Self {
        LargeClusterPolicy::AlphaBeta { alpha: 0.9, beta: 5.0 }
    }
}

impl LargeClusterPolicy {
    /// Mask of large clusters. Empty clusters are never large; if no
    /// cluster qualifies, every non-empty cluster is treated as large.
    pub fn large_clusters(&self, sizes: &[usize]) -> Vec<bool> {
        let n: usize = sizes.iter().sum();
        let mut large = vec![false; sizes.len()];

        match *self {
            LargeClusterPolicy::AlphaBeta { alpha, beta } => {
                let order = rank_by_size(sizes);

                let mut boundary = order.len().saturating_sub(1);
                let mut covered = 0usize;
                for (rank, &c) in order.iter().enumerate() {
                    covered += sizes[c];
                    if covered as f64 >= alpha * n as f64 {
                        boundary = rank;
                        break;
                    }
                    if let Some(&next) = order.get(rank + 1) {
                        if sizes[c] as f64 / sizes[next] as f64 >= beta {
                            boundary = rank;
                            break;
                        }
                    }
                }
                for &c in order.iter().take(boundary + 1) {
                    large[c] = sizes[c] > 0;
                }
            }
            LargeClusterPolicy::MinimumSize { gamma } => {
                let limit = gamma * n as f64 / sizes.len().max(1) as f64;
                for (c, &size) in sizes.iter().enumerate() {
                    large[c] = size > 0 && size as f64 >= limit;
                }
            }
        }

        if !large.iter().any(|&l| l) {
            warn!(policy = ?self, "No cluster qualifies as large, treating all clusters as large");
            for (c, &size) in sizes.iter().enumerate() {
                large[c] = size > 0;
            }
        }
        large
    }
}

/// Distance of every point to its own centroid (large clusters) or to the
/// nearest large centroid (small clusters), with the large cluster used.
pub(crate) fn large_cluster_distances(
    points: ArrayView2<f64>,
    partition: &ClusterPartition,
    large: &[bool],
    measure: &dyn DistanceMeasure,
) -> Vec<(f64, usize)> {
    let large_ids: Vec<usize> = (0..large.len()).filter(|&c| large[c]).collect();
    (0..points.nrows())
        .into_par_iter()
        .map(|i| {
            let own = partition.cluster_of(i);
            let row = points.row(i);
            if large[own] {
                (measure.distance(row, partition.centroid(own)), own)
            } else {
                nearest_centroid(row, partition, &large_ids, measure)
            }
        })
        .collect()
}

fn nearest_centroid(
    row: ArrayView1<f64>,
    partition: &ClusterPartition,
    candidates: &[usize],
    measure: &dyn DistanceMeasure,
) -> (f64, usize) {
    let mut best = (f64::INFINITY, usize::MAX);
    for &c in candidates {
        let d = measure.distance(row, partition.centroid(c));
        if d < best.0 {
            best = (d, c);
        }
    }
    best
}

/// CBLOF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CblofConfig {
    /// Large/small cluster split
    pub policy: LargeClusterPolicy,
    /// Multiply scores by the size of the point's cluster
    pub use_cluster_size_weighting: bool,
    /// Clusters built by k-means when no partition is supplied
    pub n_clusters: usize,
    /// Seed of the built-in k-means
    pub seed: Option<u64>,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for CblofConfig {
    fn default() -> Self {
        Self {
            policy: LargeClusterPolicy::default(),
            use_cluster_size_weighting: true,
            n_clusters: 5,
            seed: Some(42),
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl CblofConfig {
    pub fn with_policy(mut self, policy: LargeClusterPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cluster_size_weighting(mut self, weighting: bool) -> Self {
        self.use_cluster_size_weighting = weighting;
        self
    }

    pub fn with_n_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Score `points` against a partition
pub fn cblof_scores(
    points: ArrayView2<f64>,
    partition: &ClusterPartition,
    policy: &LargeClusterPolicy,
    use_cluster_size_weighting: bool,
    measure: &dyn DistanceMeasure,
) -> Result<Array1<f64>> {
    partition.check_points(points)?;
    let large = policy.large_clusters(partition.sizes());
    debug!(
        n_clusters = partition.n_clusters(),
        n_large = large.iter().filter(|&&l| l).count(),
        "Classified clusters"
    );

    let distances = large_cluster_distances(points, partition, &large, measure);
    let sizes = partition.sizes();
    let scores = distances
        .iter()
        .enumerate()
        .map(|(i, &(d, _))| {
            if use_cluster_size_weighting {
                d * sizes[partition.cluster_of(i)] as f64
            } else {
                d
            }
        })
        .collect();
    Ok(scores)
}

/// Cluster-Based Local Outlier Factor detector
#[derive(Debug, Clone)]
pub struct CblofDetector {
    config: CblofConfig,
    measure: Arc<dyn DistanceMeasure>,
    partition: Option<ClusterPartition>,
}

impl CblofDetector {
    pub fn new(config: CblofConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            partition: None,
        }
    }

    pub fn with_measure(mut self, measure: Arc<dyn DistanceMeasure>) -> Self {
        self.measure = measure;
        self
    }

    /// Score against this partition instead of running k-means
    pub fn with_partition(mut self, partition: ClusterPartition) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn config(&self) -> &CblofConfig {
        &self.config
    }
}

impl Default for CblofDetector {
    fn default() -> Self {
        Self::new(CblofConfig::default())
    }
}

impl AnomalyDetector for CblofDetector {
    fn name(&self) -> &'static str {
        "cblof"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        validate_points(x)?;
        let partition = resolve_partition(x.view(), self.partition.as_ref(), self.config.n_clusters, self.config.seed)?;
        self.config.parallel.install(|| {
            cblof_scores(
                x.view(),
                &partition,
                &self.config.policy,
                self.config.use_cluster_size_weighting,
                self.measure.as_ref(),
            )
        })?
    }
}
