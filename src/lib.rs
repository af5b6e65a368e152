//! Kolosal Anomaly - unsupervised anomaly detection on numeric point sets
//!
//! Every detector assigns each point a score; higher scores are more
//! anomalous.
//!
//! # Modules
//!
//! ## Nearest-neighbor detectors
//! - [`neighbors`] - Incremental k-nearest-neighbor collection, parallel
//!   population and reusable neighbor models
//! - [`anomaly`] - k-NN, LOF, COF, INFLO, LoOP and LOCI scoring
//!
//! ## Cluster-based detectors
//! - [`cluster`] - CBLOF, LDCOF and CMGOS with covariance and MCD
//!   estimation
//!
//! ## Infrastructure
//! - [`distance`] - Distance measures
//! - [`utils`] - Duplicate collapsing and parallel execution
//! - [`error`] - Error type

// Core error handling
pub mod error;

pub mod distance;
pub mod utils;

// Detectors
pub mod neighbors;
pub mod anomaly;
pub mod cluster;

pub use error::{AnomalyError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{AnomalyError, Result};

    // Distances
    pub use crate::distance::{DistanceMeasure, DistanceMetric};

    // Neighbor collections
    pub use crate::neighbors::{
        KnnCollection, KnnCollectionModel, NeighborEvaluator, NeighborPopulator, NeighborScorer, PopulationStrategy,
    };

    // Nearest-neighbor detectors
    pub use crate::anomaly::{
        AnomalyDetector, AnomalyResult, CofDetector, InfloDetector, KnnDetector, LociDetector, LofDetector,
        LoopDetector,
    };

    // Cluster-based detectors
    pub use crate::cluster::{
        CblofDetector, ClusterPartition, CmgosDetector, CovarianceMatrix, CovarianceMethod, KMeans,
        LargeClusterPolicy, LdcofDetector, Mcd, SmallClusterPolicy,
    };

    // Utilities
    pub use crate::utils::{DistinctPoints, ParallelConfig};
}
