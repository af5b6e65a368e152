//! Local Outlier Factor (LOF) anomaly detection
//!
//! LOF oscillates with k, so the score of a point is the maximum LOF over a
//! range `[min_k, max_k]`. The range is swept downwards on a private copy of
//! the populated collection, shrinking by one per step.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::{finite_or, score_with_neighbors, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::neighbors::{KnnCollection, KnnCollectionModel, NeighborScorer, ScoringContext};
use crate::utils::parallel::ParallelConfig;

/// LOF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LofConfig {
    /// Lower bound of the neighborhood range
    pub min_k: usize,
    /// Upper bound of the neighborhood range
    pub max_k: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for LofConfig {
    fn default() -> Self {
        Self {
            min_k: 10,
            max_k: 20,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl LofConfig {
    /// Score with a single neighborhood size
    pub fn with_k(mut self, k: usize) -> Self {
        self.min_k = k;
        self.max_k = k;
        self
    }

    pub fn with_range(mut self, min_k: usize, max_k: usize) -> Self {
        self.min_k = min_k;
        self.max_k = max_k;
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

/// Maximum LOF over `[min_k, k]` where k is the collection's size
#[derive(Debug, Clone, Copy)]
pub struct LofScorer {
    pub min_k: usize,
}

impl LofScorer {
    pub fn new(min_k: usize) -> Self {
        Self { min_k: min_k.max(1) }
    }

    /// Local reachability density of every point at the collection's k
    pub fn local_reachability_density(collection: &KnnCollection) -> Vec<f64> {
        let weight = collection.weight();
        (0..collection.len())
            .into_par_iter()
            .map(|i| {
                let kdist = collection.k_distance(i);
                let mut cardinality = (weight[i] - 1) as f64;
                let mut reachability = cardinality * kdist;
                for n in collection.neighbors(i) {
                    let w = weight[n.index] as f64;
                    reachability += w * n.distance.max(collection.k_distance(n.index));
                    cardinality += w;
                }
                for &t in collection.ties(i) {
                    let w = weight[t] as f64;
                    reachability += w * kdist.max(collection.k_distance(t));
                    cardinality += w;
                }
                cardinality / reachability
            })
            .collect()
    }

    /// LOF of every point at the collection's k
    pub fn lof_at_current_k(collection: &KnnCollection) -> Vec<f64> {
        let weight = collection.weight();
        let lrd = Self::local_reachability_density(collection);
        (0..collection.len())
            .into_par_iter()
            .map(|i| {
                let mut cardinality = (weight[i] - 1) as f64;
                let mut sum_lrd = cardinality * lrd[i];
                let neighborhood = collection
                    .neighbors(i)
                    .iter()
                    .map(|n| n.index)
                    .chain(collection.ties(i).iter().copied());
                for idx in neighborhood {
                    let w = weight[idx] as f64;
                    sum_lrd += w * lrd[idx];
                    cardinality += w;
                }
                finite_or(sum_lrd / (cardinality * lrd[i]), 1.0)
            })
            .collect()
    }
}

impl NeighborScorer for LofScorer {
    fn name(&self) -> &'static str {
        "lof"
    }

    fn degenerate_score(&self) -> f64 {
        1.0
    }

    fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>> {
        let mut sweep = ctx.collection.snapshot();
        let end = self.min_k.min(sweep.k());
        let mut best = vec![0.0_f64; sweep.len()];

        loop {
            for (b, lof) in best.iter_mut().zip(Self::lof_at_current_k(&sweep)) {
                if lof > *b {
                    *b = lof;
                }
            }
            if sweep.k() <= end {
                break;
            }
            sweep.shrink()?;
        }

        Ok(Array1::from_vec(best))
    }
}

/// Local Outlier Factor detector
#[derive(Debug, Clone)]
pub struct LofDetector {
    config: LofConfig,
    measure: Arc<dyn DistanceMeasure>,
    model: Option<KnnCollectionModel>,
}

impl LofDetector {
    pub fn new(config: LofConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            model: None,
        }
    }

    /// Create with default config and a single k
    pub fn with_k(k: usize) -> Self {
        Self::new(LofConfig::default().with_k(k))
    }

    pub fn with_measure(mut self, measure: Arc<dyn DistanceMeasure>) -> Self {
        self.measure = measure;
        self
    }

    pub fn with_model(mut self, model: KnnCollectionModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn model(&self) -> Option<&KnnCollectionModel> {
        self.model.as_ref()
    }

    pub fn config(&self) -> &LofConfig {
        &self.config
    }
}

impl Default for LofDetector {
    fn default() -> Self {
        Self::new(LofConfig::default())
    }
}

impl AnomalyDetector for LofDetector {
    fn name(&self) -> &'static str {
        "lof"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let mut min_k = self.config.min_k;
        let max_k = self.config.max_k;
        if min_k > max_k {
            warn!(min_k, max_k, "LOF lower bound exceeds upper bound, using upper bound");
            min_k = max_k;
        }

        let (scores, model) = score_with_neighbors(
            LofScorer::new(min_k),
            x,
            max_k,
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
