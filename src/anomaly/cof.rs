//! Connectivity-based Outlier Factor (COF)
//!
//! Each point's neighborhood is chained greedily: starting from the nearest
//! neighbor, the next member is the one closest to anything already in the
//! chain. The average chaining distance weights earlier links more, and the
//! COF is the ratio of a point's own average chaining distance to its
//! neighbors'.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{finite_or, score_with_neighbors, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::neighbors::{KnnCollection, KnnCollectionModel, NeighborScorer, ScoringContext};
use crate::utils::parallel::ParallelConfig;

/// COF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CofConfig {
    /// Number of neighbors
    pub k: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for CofConfig {
    fn default() -> Self {
        Self {
            k: 10,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl CofConfig {
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
pub struct CofScorer;

impl CofScorer {
    /// Tie-inclusive neighborhood of `i` as (index, distance) pairs; tied
    /// points sit at the k-distance.
    fn neighborhood(collection: &KnnCollection, i: usize) -> Vec<(usize, f64)> {
        let kdist = collection.k_distance(i);
        collection
            .neighbors(i)
            .iter()
            .map(|n| (n.index, n.distance))
            .chain(collection.ties(i).iter().map(|&t| (t, kdist)))
            .collect()
    }

    /// Weighted average chaining distance of point `i`
    fn average_chaining_distance(ctx: &ScoringContext<'_>, i: usize) -> f64 {
        let collection = ctx.collection;
        let weight = collection.weight();
        let members = Self::neighborhood(collection, i);
        if members.is_empty() {
            return 0.0;
        }

        let neighbor_weight: usize = members.iter().map(|&(idx, _)| weight[idx]).sum();
        let cardinality = (weight[i] - 1 + neighbor_weight) as f64;
        let denominator = cardinality * (cardinality + 1.0);

        let mut cost: Vec<f64> = members.iter().map(|&(_, d)| d).collect();
        let mut chained = vec![false; members.len()];
        let mut remaining = neighbor_weight as f64;
        let mut summation = 0.0;
        let mut next = Some(0);

        while let Some(sel) = next {
            chained[sel] = true;
            let before = remaining * (remaining + 1.0);
            remaining -= weight[members[sel].0] as f64;
            let link_weight = before - remaining * (remaining + 1.0);
            summation += link_weight * cost[sel];

            let added = ctx.points.row(members[sel].0);
            next = None;
            for j in 0..members.len() {
                if chained[j] {
                    continue;
                }
                let d = ctx.measure.distance(added, ctx.points.row(members[j].0));
                if d < cost[j] {
                    cost[j] = d;
                }
                next = match next {
                    Some(m) if cost[m] < cost[j] || (cost[m] == cost[j] && members[m].0 < members[j].0) => Some(m),
                    _ => Some(j),
                };
            }
        }

        summation / denominator
    }
}

impl NeighborScorer for CofScorer {
    fn name(&self) -> &'static str {
        "cof"
    }

    fn degenerate_score(&self) -> f64 {
        1.0
    }

    fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>> {
        let collection = ctx.collection;
        let weight = collection.weight();
        let n = collection.len();

        let ac_dist: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| Self::average_chaining_distance(ctx, i))
            .collect();

        let cof: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut cardinality = (weight[i] - 1) as f64;
                let mut summation = cardinality * ac_dist[i];
                for (idx, _) in Self::neighborhood(collection, i) {
                    let w = weight[idx] as f64;
                    summation += w * ac_dist[idx];
                    cardinality += w;
                }
                finite_or(cardinality * ac_dist[i] / summation, 1.0)
            })
            .collect();

        Ok(Array1::from_vec(cof))
    }
}

/// Connectivity-based Outlier Factor detector
#[derive(Debug, Clone)]
pub struct CofDetector {
    config: CofConfig,
    measure: Arc<dyn DistanceMeasure>,
    model: Option<KnnCollectionModel>,
}

impl CofDetector {
    pub fn new(config: CofConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            model: None,
        }
    }

    pub fn with_k(k: usize) -> Self {
        Self::new(CofConfig::default().with_k(k))
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

impl Default for CofDetector {
    fn default() -> Self {
        Self::new(CofConfig::default())
    }
}

impl AnomalyDetector for CofDetector {
    fn name(&self) -> &'static str {
        "cof"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (scores, model) = score_with_neighbors(
            CofScorer,
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
