//! Local Outlier Probability (LoOP)
//!
//! Scores are probabilities in `[0, 1)`: the probabilistic set distance of a
//! point is compared with its neighbors', normalized by the quadratic mean
//! over the data set and mapped through the Gaussian error function.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::warn;

use super::{score_with_neighbors, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::Result;
use crate::neighbors::{KnnCollectionModel, NeighborScorer, ScoringContext};
use crate::utils::parallel::ParallelConfig;

/// LoOP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Number of neighbors
    pub k: usize,
    /// Normalization factor, valid range `[1, 3]`
    pub lambda: f64,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            k: 10,
            lambda: 3.0,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
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

/// Gaussian error function.
///
/// Taylor series for `|x| <= 3` (terms below 1e-13 stop the sum, at most
/// 1000 terms), the Numerical Recipes Chebyshev fit for `3 < |x| < 6`, and
/// saturation beyond. Score rankings depend on the accuracy of the small
/// range, hence the series instead of a cheaper fit.
pub fn erf(x: f64) -> f64 {
    if x >= 6.0 {
        return 1.0;
    }
    if x <= -6.0 {
        return -1.0;
    }

    let z = x.abs();
    if z > 3.0 {
        let t = 1.0 / (1.0 + 0.5 * z);
        let poly = -z * z - 1.26551223
            + t * (1.00002368
                + t * (0.37409196
                    + t * (0.09678418
                        + t * (-0.18628806
                            + t * (0.27886807
                                + t * (-1.13520398 + t * (1.48851587 + t * (-0.82215223 + t * 0.17087277))))))));
        let res = 1.0 - t * poly.exp();
        return if x >= 0.0 { res } else { -res };
    }

    let zz = z * z;
    let mut res = 0.0;
    let mut mult = 1.0;
    for n in 0..1000 {
        let diff = z * mult / (2 * n + 1) as f64;
        res += diff;
        if diff.abs() < 1e-13 {
            break;
        }
        mult *= -zz / (n + 1) as f64;
    }
    res *= 2.0 / PI.sqrt();
    if x >= 0.0 {
        res
    } else {
        -res
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopScorer {
    pub lambda: f64,
}

impl LoopScorer {
    /// `lambda` is clamped to `[1, 3]`
    pub fn new(lambda: f64) -> Self {
        let clamped = if lambda.is_finite() { lambda.clamp(1.0, 3.0) } else { 3.0 };
        if clamped != lambda {
            warn!(requested = lambda, used = clamped, "LoOP lambda out of range, clamping");
        }
        Self { lambda: clamped }
    }
}

impl NeighborScorer for LoopScorer {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn degenerate_score(&self) -> f64 {
        0.0
    }

    fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>> {
        let collection = ctx.collection;
        let weight = collection.weight();
        let n = collection.len();
        let lambda = self.lambda;

        let pdist: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let kdist = collection.k_distance(i);
                let mut cardinality = (weight[i] - 1) as f64;
                let mut squared = 0.0;
                for nb in collection.neighbors(i) {
                    let w = weight[nb.index] as f64;
                    cardinality += w;
                    squared += w * nb.distance * nb.distance;
                }
                for &t in collection.ties(i) {
                    let w = weight[t] as f64;
                    cardinality += w;
                    squared += w * kdist * kdist;
                }
                if cardinality == 0.0 {
                    0.0
                } else {
                    lambda * (squared / cardinality).sqrt()
                }
            })
            .collect();

        let plof: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut cardinality = (weight[i] - 1) as f64;
                let mut sum_pdist = cardinality * pdist[i];
                let neighborhood = collection
                    .neighbors(i)
                    .iter()
                    .map(|nb| nb.index)
                    .chain(collection.ties(i).iter().copied());
                for idx in neighborhood {
                    let w = weight[idx] as f64;
                    cardinality += w;
                    sum_pdist += w * pdist[idx];
                }
                if sum_pdist == 0.0 {
                    0.0
                } else {
                    cardinality * pdist[i] / sum_pdist - 1.0
                }
            })
            .collect();

        let mean_squared = plof.iter().map(|p| p * p).sum::<f64>() / n as f64;
        let nplof = lambda * mean_squared.sqrt() * std::f64::consts::SQRT_2;

        let scores = plof
            .iter()
            .map(|&p| if nplof == 0.0 { 0.0 } else { erf(p / nplof).max(0.0) })
            .collect();
        Ok(scores)
    }
}

/// Local Outlier Probability detector
#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: LoopConfig,
    measure: Arc<dyn DistanceMeasure>,
    model: Option<KnnCollectionModel>,
}

impl LoopDetector {
    pub fn new(config: LoopConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            model: None,
        }
    }

    pub fn with_k(k: usize) -> Self {
        Self::new(LoopConfig::default().with_k(k))
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

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopConfig::default())
    }
}

impl AnomalyDetector for LoopDetector {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (scores, model) = score_with_neighbors(
            LoopScorer::new(self.config.lambda),
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
    use crate::neighbors::NeighborEvaluator;

    #[test]
    fn test_erf_reference_values() {
        assert_eq!(erf(0.0), 0.0);
        assert!((erf(0.5) - 0.520_499_877_813_046_5).abs() < 1e-11);
        assert!((erf(1.0) - 0.842_700_792_949_714_9).abs() < 1e-11);
        assert!((erf(-2.0) + 0.995_322_265_018_952_7).abs() < 1e-11);
        assert!((erf(3.5) - 0.999_999_256_901_627_7).abs() < 2e-7);
        assert_eq!(erf(6.0), 1.0);
        assert_eq!(erf(-7.5), -1.0);
    }

    #[test]
    fn test_erf_is_monotonic() {
        let mut prev = erf(-6.0);
        for i in -599..=600 {
            let v = erf(i as f64 / 100.0);
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn test_identical_points_score_zero() {
        // Without duplicate collapsing every pdist is 0, so PLOF and its
        // normalizer are 0 as well.
        let x = Array2::from_elem((5, 2), 3.0);
        let mut evaluator = NeighborEvaluator::new(
            LoopScorer::new(3.0),
            x,
            vec![1; 5],
            2,
            Arc::new(DistanceMetric::Euclidean),
            ParallelConfig::new(),
        )
        .unwrap();
        let scores = evaluator.evaluate().unwrap().scores;
        assert_eq!(scores, Array1::<f64>::zeros(5));

        let mut detector = LoopDetector::with_k(2);
        let collapsed = detector.score_samples(&Array2::from_elem((5, 2), 3.0)).unwrap();
        assert_eq!(collapsed, Array1::<f64>::zeros(5));
    }

    #[test]
    fn test_scores_are_probabilities() {
        let mut rows: Vec<f64> = (0..20).flat_map(|i| [(i % 5) as f64, (i / 5) as f64]).collect();
        rows.extend_from_slice(&[30.0, -30.0]);
        let x = Array2::from_shape_vec((21, 2), rows).unwrap();
        let scores = LoopDetector::with_k(4).score_samples(&x).unwrap();

        assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
        let max_grid = scores.iter().take(20).cloned().fold(f64::MIN, f64::max);
        assert!(scores[20] > max_grid);
        assert!(scores[20] > 0.5);
    }

    #[test]
    fn test_lambda_is_clamped() {
        assert_eq!(LoopScorer::new(7.0).lambda, 3.0);
        assert_eq!(LoopScorer::new(0.2).lambda, 1.0);
    }
}
