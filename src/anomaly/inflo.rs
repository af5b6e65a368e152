//! Influenced Outlierness (INFLO)
//!
//! The influence space of a point is its k-neighborhood plus its reverse
//! neighbors: points that are closer to it than to their own k-th neighbor.
//! INFLO compares a point's density (inverse k-distance) with the average
//! density of that space.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{finite_or, score_with_neighbors, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::neighbors::{KnnCollectionModel, NeighborScorer, ScoringContext};
use crate::utils::parallel::ParallelConfig;

/// INFLO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfloConfig {
    /// Number of neighbors
    pub k: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for InfloConfig {
    fn default() -> Self {
        Self {
            k: 10,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl InfloConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
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

#[derive(Debug, Clone, Copy)]
pub struct InfloScorer;

impl NeighborScorer for InfloScorer {
    fn name(&self) -> &'static str {
        "inflo"
    }

    fn degenerate_score(&self) -> f64 {
        1.0
    }

    // Reverse-neighbor contributions scatter into other points' sums, so
    // this pass stays sequential; it is O(n * k).
    fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>> {
        let collection = ctx.collection;
        let weight = collection.weight();
        let n = collection.len();
        let mut cardinality = vec![0.0_f64; n];
        let mut density_sum = vec![0.0_f64; n];

        for i in 0..n {
            let kdist = collection.k_distance(i);
            let w_i = weight[i] as f64;
            cardinality[i] += w_i - 1.0;
            density_sum[i] += (w_i - 1.0) / kdist;

            let neighborhood = collection
                .neighbors(i)
                .iter()
                .map(|nb| (nb.index, nb.distance))
                .chain(collection.ties(i).iter().map(|&t| (t, kdist)));
            for (idx, distance) in neighborhood {
                let w = weight[idx] as f64;
                let other_kdist = collection.k_distance(idx);
                cardinality[i] += w;
                density_sum[i] += w / other_kdist;
                // i is not in idx's neighborhood: i belongs to idx's reverse
                // neighbors instead.
                if distance > other_kdist {
                    cardinality[idx] += w_i;
                    density_sum[idx] += w_i / kdist;
                }
            }
        }

        let scores = (0..n)
            .map(|i| finite_or(density_sum[i] * collection.k_distance(i) / cardinality[i], 1.0))
            .collect();
        Ok(scores)
    }
}

/// Influenced Outlierness detector
#[derive(Debug, Clone)]
pub struct InfloDetector {
    config: InfloConfig,
    measure: Arc<dyn DistanceMeasure>,
    model: Option<KnnCollectionModel>,
}

impl InfloDetector {
    pub fn new(config: InfloConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            model: None,
        }
    }

    pub fn with_k(k: usize) -> Self {
        Self::new(InfloConfig::default().with_k(k))
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
}

impl Default for InfloDetector {
    fn default() -> Self {
        Self::new(InfloConfig::default())
    }
}

impl AnomalyDetector for InfloDetector {
    fn name(&self) -> &'static str {
        "inflo"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (scores, model) = score_with_neighbors(
            InfloScorer,
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

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_symmetric_pair_scores_one() {
        let x = array![[0.0], [1.0]];
        let mut inflo = InfloDetector::with_k(1);
        let scores = inflo.score_samples(&x).unwrap();
        assert_eq!(scores, array![1.0, 1.0]);
    }

    #[test]
    fn test_reverse_neighbor_counts() {
        // k = 1: 0 <-> 1 are mutual, 10's nearest is 1 but 1's k-distance is
        // 1, so 10 joins 1's influence space.
        let x = array![[0.0], [1.0], [10.0]];
        let mut inflo = InfloDetector::with_k(1);
        let scores = inflo.score_samples(&x).unwrap();

        assert!((scores[0] - 1.0).abs() < 1e-12);
        // Point 1: own neighbor 0 (density 1) plus reverse neighbor 10
        // (density 1/9): (1 + 1/9) * 1 / 2.
        assert!((scores[1] - (1.0 + 1.0 / 9.0) / 2.0).abs() < 1e-12);
        // Point 10: neighbor 1 with density 1, own k-distance 9.
        assert!((scores[2] - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_outlier_ranked_first() {
        let mut rows: Vec<f64> = (0..16).flat_map(|i| [(i % 4) as f64, (i / 4) as f64]).collect();
        rows.extend_from_slice(&[12.0, 12.0]);
        let x = Array2::from_shape_vec((17, 2), rows).unwrap();
        let scores = InfloDetector::with_k(3).score_samples(&x).unwrap();
        let max_grid = scores.iter().take(16).cloned().fold(f64::MIN, f64::max);
        assert!(scores[16] > max_grid);
    }
}
