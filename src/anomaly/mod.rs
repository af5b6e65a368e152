//! Anomaly detection module
//!
//! Nearest-neighbor detectors:
//! - k-NN distance (average or k-th)
//! - Local Outlier Factor (LOF) over a range of k
//! - Connectivity-based Outlier Factor (COF)
//! - Influenced Outlierness (INFLO)
//! - Local Outlier Probability (LoOP)
//! - Local Correlation Integral (LOCI)
//!
//! Every detector is transductive: it scores the rows it is given, and
//! higher scores mean more anomalous. Exact duplicate rows are collapsed
//! before neighbor search and receive identical scores.

mod cof;
mod inflo;
mod knn;
mod lof;
mod loci;
mod loop_prob;

pub use cof::{CofConfig, CofDetector, CofScorer};
pub use inflo::{InfloConfig, InfloDetector, InfloScorer};
pub use knn::{KnnConfig, KnnDetector, KnnScorer};
pub use lof::{LofConfig, LofDetector, LofScorer};
pub use loci::{LociConfig, LociDetector, LociEvaluator};
pub use loop_prob::{erf, LoopConfig, LoopDetector, LoopScorer};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::distance::DistanceMeasure;
use crate::error::{AnomalyError, Result};
use crate::neighbors::{KnnCollectionModel, NeighborEvaluator, NeighborScorer};
use crate::utils::dedup::DistinctPoints;
use crate::utils::parallel::ParallelConfig;

/// Anomaly detection result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    /// Anomaly scores (higher = more anomalous)
    pub scores: Array1<f64>,
    /// Binary labels (-1 = anomaly, 1 = normal)
    pub labels: Array1<i32>,
    /// Threshold used for classification
    pub threshold: f64,
    /// Number of anomalies detected
    pub n_anomalies: usize,
}

impl AnomalyResult {
    /// Label the `contamination` share of highest scores as anomalies
    pub fn from_scores(scores: Array1<f64>, contamination: f64) -> Self {
        let n = scores.len();
        if n == 0 {
            return Self {
                scores,
                labels: Array1::zeros(0),
                threshold: f64::INFINITY,
                n_anomalies: 0,
            };
        }

        let contamination = contamination.clamp(0.0, 0.5);
        let mut sorted: Vec<f64> = scores.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let threshold_idx = ((contamination * n as f64) as usize).min(n - 1);
        let threshold = sorted[threshold_idx];

        let labels: Array1<i32> = scores.mapv(|s| if s > threshold { -1 } else { 1 });
        let n_anomalies = labels.iter().filter(|&&l| l == -1).count();

        Self {
            scores,
            labels,
            threshold,
            n_anomalies,
        }
    }
}

/// Trait for anomaly detectors
pub trait AnomalyDetector: Send + Sync {
    /// Short algorithm name
    fn name(&self) -> &'static str;

    /// Score every row of `x`
    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>>;

    /// Score `x` and label the `contamination` share of highest scores
    fn detect(&mut self, x: &Array2<f64>, contamination: f64) -> Result<AnomalyResult> {
        let scores = self.score_samples(x)?;
        Ok(AnomalyResult::from_scores(scores, contamination))
    }
}

pub(crate) fn validate_points(x: &Array2<f64>) -> Result<()> {
    if x.nrows() == 0 {
        return Err(AnomalyError::InvalidInput("point set is empty".to_string()));
    }
    if x.ncols() == 0 {
        return Err(AnomalyError::InvalidInput("points have no dimensions".to_string()));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(AnomalyError::InvalidInput("points contain non-finite values".to_string()));
    }
    Ok(())
}

/// Collapse duplicates, populate (or reuse) a neighbor collection, score
/// with `scorer` and broadcast back to input rows. Returns the scores and a
/// model of the populated collection.
pub(crate) fn score_with_neighbors<S: NeighborScorer>(
    scorer: S,
    x: &Array2<f64>,
    k: usize,
    measure: &Arc<dyn DistanceMeasure>,
    parallel: &ParallelConfig,
    model: Option<&KnnCollectionModel>,
) -> Result<(Array1<f64>, Option<KnnCollectionModel>)> {
    validate_points(x)?;
    let distinct = DistinctPoints::from_points(x);

    let mut evaluator = NeighborEvaluator::new(
        scorer,
        distinct.points.clone(),
        distinct.weight.clone(),
        k,
        Arc::clone(measure),
        parallel.clone(),
    )?;
    if let Some(model) = model {
        evaluator = evaluator.with_model(model)?;
    }

    let scores = evaluator.evaluate()?;
    Ok((distinct.broadcast(&scores.scores)?, evaluator.model()))
}

/// Replace non-finite ratio scores by the neutral value.
pub(crate) fn finite_or(value: f64, neutral: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        neutral
    }
}
