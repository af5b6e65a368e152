//! Local Density Cluster-based Outlier Factor (LDCOF)
//!
//! Like CBLOF, but the distance to the (nearest) large centroid is divided
//! by the average distance of that large cluster's own members to its
//! centroid.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::cblof::{large_cluster_distances, LargeClusterPolicy};
use super::{resolve_partition, ClusterPartition};
use crate::anomaly::{validate_points, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::utils::parallel::ParallelConfig;

/// LDCOF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdcofConfig {
    /// Large/small cluster split
    pub policy: LargeClusterPolicy,
    /// Clusters built by k-means when no partition is supplied
    pub n_clusters: usize,
    /// Seed of the built-in k-means
    pub seed: Option<u64>,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for LdcofConfig {
    fn default() -> Self {
        Self {
            policy: LargeClusterPolicy::MinimumSize { gamma: 0.1 },
            n_clusters: 5,
            seed: Some(42),
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl LdcofConfig {
    pub fn with_policy(mut self, policy: LargeClusterPolicy) -> Self {
        self.policy = policy;
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
pub fn ldcof_scores(
    points: ArrayView2<f64>,
    partition: &ClusterPartition,
    policy: &LargeClusterPolicy,
    measure: &dyn DistanceMeasure,
) -> Result<Array1<f64>> {
    partition.check_points(points)?;
    let large = policy.large_clusters(partition.sizes());
    let distances = large_cluster_distances(points, partition, &large, measure);

    // Average distance of each large cluster's own members
    let mut average = vec![0.0_f64; partition.n_clusters()];
    for (i, &(d, _)) in distances.iter().enumerate() {
        let own = partition.cluster_of(i);
        if large[own] {
            average[own] += d;
        }
    }
    for (c, avg) in average.iter_mut().enumerate() {
        if large[c] {
            *avg /= partition.sizes()[c] as f64;
        }
    }
    debug!(
        n_large = large.iter().filter(|&&l| l).count(),
        "Computed LDCOF cluster densities"
    );

    let scores = distances
        .iter()
        .map(|&(d, c)| if average[c] == 0.0 { 0.0 } else { d / average[c] })
        .collect();
    Ok(scores)
}

/// Local Density Cluster-based Outlier Factor detector
#[derive(Debug, Clone)]
pub struct LdcofDetector {
    config: LdcofConfig,
    measure: Arc<dyn DistanceMeasure>,
    partition: Option<ClusterPartition>,
}

impl LdcofDetector {
    pub fn new(config: LdcofConfig) -> Self {
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
}

impl Default for LdcofDetector {
    fn default() -> Self {
        Self::new(LdcofConfig::default())
    }
}

impl AnomalyDetector for LdcofDetector {
    fn name(&self) -> &'static str {
        "ldcof"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        validate_points(x)?;
        let partition = resolve_partition(x.view(), self.partition.as_ref(), self.config.n_clusters, self.config.seed)?;
        self.config
            .parallel
            .install(|| ldcof_scores(x.view(), &partition, &self.config.policy, self.measure.as_ref()))?
    }
}
