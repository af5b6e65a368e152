//! k-NN global anomaly score
//!
//! The score of a point is the average distance to its k nearest neighbors,
//! or only the k-th distance. Duplicates of the point itself count as
//! neighbors at distance zero.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{score_with_neighbors, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::neighbors::{KnnCollection, KnnCollectionModel, NeighborScorer, ScoringContext};
use crate::utils::parallel::ParallelConfig;

/// k-NN detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnConfig {
    /// Number of neighbors
    pub k: usize,
    /// Score with the k-th distance instead of the average
    pub kth_distance_only: bool,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            k: 10,
            kth_distance_only: false,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl KnnConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_kth_distance_only(mut self, kth: bool) -> Self {
        self.kth_distance_only = kth;
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

/// Weighted average (or k-th) neighbor distance
#[derive(Debug, Clone, Copy, Default)]
pub struct KnnScorer {
    pub kth_distance_only: bool,
}

impl KnnScorer {
    pub fn new(kth_distance_only: bool) -> Self {
        Self { kth_distance_only }
    }

    /// Score of a single point. At most k "virtual" neighbors are consumed,
    /// each stored neighbor standing for as many records as its weight.
    pub fn point_score(&self, collection: &KnnCollection, i: usize) -> f64 {
        let k = collection.k();
        let weight = collection.weight();
        let neighbors = collection.neighbors(i);
        if neighbors.is_empty() {
            return 0.0;
        }

        let mut elements = weight[i] - 1;
        let mut sum = 0.0;
        let mut last = None;
        for neighbor in neighbors {
            if elements >= k {
                break;
            }
            let take = weight[neighbor.index].min(k - elements);
            sum += take as f64 * neighbor.distance;
            elements += take;
            last = Some(neighbor.distance);
        }

        if self.kth_distance_only {
            last.unwrap_or(0.0)
        } else if elements == 0 {
            0.0
        } else {
            sum / elements as f64
        }
    }
}

impl NeighborScorer for KnnScorer {
    fn name(&self) -> &'static str {
        "knn"
    }

    fn degenerate_score(&self) -> f64 {
        0.0
    }

    fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>> {
        let collection = ctx.collection;
        let scores: Vec<f64> = (0..collection.len())
            .into_par_iter()
            .map(|i| self.point_score(collection, i))
            .collect();
        Ok(Array1::from_vec(scores))
    }
}

/// k-NN global anomaly detector
#[derive(Debug, Clone)]
pub struct KnnDetector {
    config: KnnConfig,
    measure: Arc<dyn DistanceMeasure>,
    model: Option<KnnCollectionModel>,
}

impl KnnDetector {
    pub fn new(config: KnnConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            model: None,
        }
    }

    /// Create with default config and specified k
    pub fn with_k(k: usize) -> Self {
        Self::new(KnnConfig::default().with_k(k))
    }

    /// Use a custom distance measure instead of the configured metric
    pub fn with_measure(mut self, measure: Arc<dyn DistanceMeasure>) -> Self {
        self.measure = measure;
        self
    }

    /// Reuse a previously built neighbor model when it matches
    pub fn with_model(mut self, model: KnnCollectionModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Neighbor model of the last scored data set
    pub fn model(&self) -> Option<&KnnCollectionModel> {
        self.model.as_ref()
    }

    pub fn config(&self) -> &KnnConfig {
        &self.config
    }
}

impl Default for KnnDetector {
    fn default() -> Self {
        Self::new(KnnConfig::default())
    }
}

impl AnomalyDetector for KnnDetector {
    fn name(&self) -> &'static str {
        "knn"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (scores, model) = score_with_neighbors(
            KnnScorer::new(self.config.kth_distance_only),
            x,
            self.config.k,
            &self.measure,
            &self.config.parallel,
            self.model.as_ref(),
        )?;
        if model.is_some() {
            self.model = model;
        }
        Ok(scores)
    }
}
