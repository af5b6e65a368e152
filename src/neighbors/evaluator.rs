//! Neighbor evaluator: population plus a pluggable scoring strategy
//!
//! Lifecycle: `Empty -> Populated (evaluate) -> Shrunk (re_evaluate)*`.
//! Distances are computed once; every later `re_evaluate(step)` shrinks the
//! collection and re-scores without touching the point matrix.

use ndarray::{Array1, Array2, ArrayView2};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::collection::KnnCollection;
use super::model::KnnCollectionModel;
use super::populate::NeighborPopulator;
use crate::distance::DistanceMeasure;
use crate::error::{AnomalyError, Result};
use crate::utils::parallel::ParallelConfig;

/// Everything a scoring strategy may read
pub struct ScoringContext<'a> {
    pub collection: &'a KnnCollection,
    pub points: ArrayView2<'a, f64>,
    pub measure: &'a dyn DistanceMeasure,
}

/// Turns a populated collection into per-point scores
pub trait NeighborScorer: Send + Sync + fmt::Debug {
    /// Short algorithm name, used in logs
    fn name(&self) -> &'static str;

    /// Score every point when fewer than two distinct points exist
    fn degenerate_score(&self) -> f64;

    /// Score all points of the context. Runs inside the evaluator's thread
    /// pool, so rayon iterators honor the configured parallelism.
    fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>>;
}

/// Scores produced at a given neighborhood size
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborScores {
    /// Neighborhood size the scores were computed with
    pub k: usize,
    /// Collection generation the scores were computed from
    pub generation: u64,
    /// One score per point
    pub scores: Array1<f64>,
}

#[derive(Debug, Clone)]
enum EvaluatorState {
    Empty,
    Populated(KnnCollection),
    Shrunk { collection: KnnCollection, total: usize },
}

/// Populates a [`KnnCollection`] and scores it with `S`
#[derive(Debug)]
pub struct NeighborEvaluator<S: NeighborScorer> {
    scorer: S,
    points: Array2<f64>,
    weight: Vec<usize>,
    k: usize,
    measure: Arc<dyn DistanceMeasure>,
    parallel: ParallelConfig,
    preloaded: Option<KnnCollection>,
    state: EvaluatorState,
}

impl<S: NeighborScorer> NeighborEvaluator<S> {
    /// Create an evaluator over distinct `points` with multiplicities
    /// `weight`. `k` is clamped to `[1, n - 1]`.
    pub fn new(
        scorer: S,
        points: Array2<f64>,
        weight: Vec<usize>,
        k: usize,
        measure: Arc<dyn DistanceMeasure>,
        parallel: ParallelConfig,
    ) -> Result<Self> {
        if weight.len() != points.nrows() {
            return Err(AnomalyError::ShapeError {
                expected: format!("{} weights", points.nrows()),
                actual: format!("{} weights", weight.len()),
            });
        }
        if weight.iter().any(|&w| w == 0) {
            return Err(AnomalyError::InvalidInput("point weights must be at least 1".to_string()));
        }

        let k = clamp_k(k, points.nrows());
        Ok(Self {
            scorer,
            points,
            weight,
            k,
            measure,
            parallel,
            preloaded: None,
            state: EvaluatorState::Empty,
        })
    }

    /// Seed the evaluator from a previously built model. Mismatching models
    /// are ignored and distances are recomputed.
    pub fn with_model(mut self, model: &KnnCollectionModel) -> Result<Self> {
        let reused = model.collection_for(&self.points, self.measure.as_ref(), self.k)?;
        self.preloaded = reused.filter(|c| c.weight() == self.weight.as_slice());
        Ok(self)
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    /// Current neighborhood size
    pub fn k(&self) -> usize {
        self.collection().map_or(self.k, KnnCollection::k)
    }

    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    /// The populated collection, if any
    pub fn collection(&self) -> Option<&KnnCollection> {
        match &self.state {
            EvaluatorState::Empty => None,
            EvaluatorState::Populated(c) => Some(c),
            EvaluatorState::Shrunk { collection, .. } => Some(collection),
        }
    }

    /// Total shrink applied since population
    pub fn shrunk_by(&self) -> usize {
        match &self.state {
            EvaluatorState::Shrunk { total, .. } => *total,
            _ => 0,
        }
    }

    /// Snapshot of the current collection as a reusable model
    pub fn model(&self) -> Option<KnnCollectionModel> {
        self.collection()
            .map(|c| KnnCollectionModel::new(self.points.clone(), self.measure.as_ref(), c.snapshot()))
    }

    /// Populate the collection if needed and score every point
    pub fn evaluate(&mut self) -> Result<NeighborScores> {
        if self.points.nrows() < 2 {
            return Ok(self.degenerate());
        }

        if matches!(self.state, EvaluatorState::Empty) {
            let collection = match self.preloaded.take() {
                Some(c) => c,
                None => NeighborPopulator::new(self.measure.as_ref(), self.parallel.clone()).populate(
                    self.points.view(),
                    self.weight.clone(),
                    self.k,
                )?,
            };
            self.state = EvaluatorState::Populated(collection);
        }
        self.score_current()
    }

    /// Shrink the collection by `step` and re-score without computing any
    /// distance. `step == 0` re-scores the current collection.
    pub fn re_evaluate(&mut self, step: usize) -> Result<NeighborScores> {
        if self.points.nrows() < 2 {
            return Ok(self.degenerate());
        }

        let state = std::mem::replace(&mut self.state, EvaluatorState::Empty);
        let (mut collection, total) = match state {
            EvaluatorState::Empty => {
                return Err(AnomalyError::InvalidState(
                    "re_evaluate called before evaluate".to_string(),
                ))
            }
            EvaluatorState::Populated(c) => (c, 0),
            EvaluatorState::Shrunk { collection, total } => (collection, total),
        };

        let shrunk = collection.shrink_by(step);
        let total = if shrunk.is_ok() { total + step } else { total };
        self.state = if total == 0 {
            EvaluatorState::Populated(collection)
        } else {
            EvaluatorState::Shrunk { collection, total }
        };
        shrunk?;

        debug!(algorithm = self.scorer.name(), step, k = self.k(), "Re-evaluating after shrink");
        self.score_current()
    }

    fn score_current(&self) -> Result<NeighborScores> {
        let collection = self
            .collection()
            .ok_or_else(|| AnomalyError::InvalidState("collection not populated".to_string()))?;
        let ctx = ScoringContext {
            collection,
            points: self.points.view(),
            measure: self.measure.as_ref(),
        };
        let scores = self.parallel.install(|| self.scorer.score(&ctx))??;
        Ok(NeighborScores {
            k: collection.k(),
            generation: collection.generation(),
            scores,
        })
    }

    fn degenerate(&self) -> NeighborScores {
        NeighborScores {
            k: self.k,
            generation: 0,
            scores: Array1::from_elem(self.points.nrows(), self.scorer.degenerate_score()),
        }
    }
}

/// Clamp a requested neighborhood size to `[1, n - 1]`, warning on change.
pub fn clamp_k(k: usize, n: usize) -> usize {
    let upper = n.saturating_sub(1).max(1);
    let clamped = k.clamp(1, upper);
    if clamped != k {
        warn!(requested = k, used = clamped, n, "Neighborhood size out of range, clamping");
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;
    use ndarray::array;

    #[derive(Debug)]
    struct KDistance;

    impl NeighborScorer for KDistance {
        fn name(&self) -> &'static str {
            "k-distance"
        }

        fn degenerate_score(&self) -> f64 {
            -1.0
        }

        fn score(&self, ctx: &ScoringContext<'_>) -> Result<Array1<f64>> {
            Ok((0..ctx.collection.len()).map(|i| ctx.collection.k_distance(i)).collect())
        }
    }

    fn evaluator(k: usize) -> NeighborEvaluator<KDistance> {
        let x = array![[0.0], [1.0], [3.0], [7.0]];
        NeighborEvaluator::new(
            KDistance,
            x,
            vec![1; 4],
            k,
            Arc::new(DistanceMetric::Euclidean),
            ParallelConfig::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_re_evaluate_before_evaluate_fails() {
        let mut e = evaluator(2);
        assert!(matches!(e.re_evaluate(1), Err(AnomalyError::InvalidState(_))));
    }

    #[test]
    fn test_re_evaluate_zero_is_idempotent() {
        let mut e = evaluator(2);
        let first = e.evaluate().unwrap();
        let again = e.re_evaluate(0).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_re_evaluate_shrinks() {
        let mut e = evaluator(3);
        let full = e.evaluate().unwrap();
        assert_eq!(full.scores, array![7.0, 6.0, 4.0, 7.0]);

        let shrunk = e.re_evaluate(1).unwrap();
        assert_eq!(shrunk.k, 2);
        assert_eq!(shrunk.scores, array![3.0, 2.0, 3.0, 6.0]);
        assert_eq!(e.shrunk_by(), 1);

        assert!(matches!(e.re_evaluate(2), Err(AnomalyError::ShrinkExceedsK { .. })));
        assert_eq!(e.k(), 2);
    }

    #[test]
    fn test_k_is_clamped() {
        let e = evaluator(10);
        assert_eq!(e.k(), 3);
        assert_eq!(clamp_k(0, 5), 1);
    }

    #[test]
    fn test_degenerate_input() {
        let mut e = NeighborEvaluator::new(
            KDistance,
            array![[1.0, 2.0]],
            vec![3],
            5,
            Arc::new(DistanceMetric::Euclidean),
            ParallelConfig::new(),
        )
        .unwrap();
        assert_eq!(e.evaluate().unwrap().scores, array![-1.0]);
    }

    #[test]
    fn test_model_round_trip() {
        let mut e = evaluator(3);
        let first = e.evaluate().unwrap();
        let model = e.model().unwrap();

        let mut reused = evaluator(2).with_model(&model).unwrap();
        let mut fresh = evaluator(2);
        assert_eq!(reused.evaluate().unwrap().scores, fresh.evaluate().unwrap().scores);
        assert_eq!(first.k, 3);
    }

    #[test]
    fn test_weight_validation() {
        let result = NeighborEvaluator::new(
            KDistance,
            array![[0.0], [1.0]],
            vec![1],
            1,
            Arc::new(DistanceMetric::Euclidean),
            ParallelConfig::new(),
        );
        assert!(result.is_err());
    }
}
