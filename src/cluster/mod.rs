//! Cluster-based anomaly detection
//!
//! - CBLOF: distance to the own or nearest large cluster centroid
//! - LDCOF: the same distance relative to the large cluster's density
//! - CMGOS: Mahalanobis distance under a per-cluster Gaussian, with a
//!   reduced, regularized or MCD covariance estimate
//!
//! Detectors take a caller-supplied [`ClusterPartition`] or cluster the
//! data with the built-in [`KMeans`].

mod cblof;
mod cmgos;
mod covariance;
mod kmeans;
mod ldcof;
mod mcd;
mod partition;

pub use cblof::{cblof_scores, CblofConfig, CblofDetector, LargeClusterPolicy};
pub use cmgos::{
    chi_squared_quantile, CmgosConfig, CmgosDetector, CmgosEvaluator, CmgosResult, CovarianceMethod,
    SmallClusterPolicy,
};
pub use covariance::{CovarianceMatrix, Mahalanobis, SINGULAR_RIDGE};
pub use kmeans::KMeans;
pub use ldcof::{ldcof_scores, LdcofConfig, LdcofDetector};
pub use mcd::{Mcd, McdConfig, McdEstimate};
pub use partition::ClusterPartition;

use ndarray::ArrayView2;

use crate::error::Result;

/// The supplied partition, checked against `points`, or a k-means
/// clustering of them.
pub(crate) fn resolve_partition(
    points: ArrayView2<f64>,
    supplied: Option<&ClusterPartition>,
    n_clusters: usize,
    seed: Option<u64>,
) -> Result<ClusterPartition> {
    match supplied {
        Some(partition) => {
            partition.check_points(points)?;
            Ok(partition.clone())
        }
        None => KMeans::new(n_clusters).with_random_state(seed).fit(points),
    }
}
