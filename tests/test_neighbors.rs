//! Integration test: nearest-neighbor collection and detectors

use kolosal_anomaly::anomaly::{
    AnomalyDetector, KnnDetector, KnnScorer, LofConfig, LofDetector, LofScorer, LoopDetector,
};
use kolosal_anomaly::distance::DistanceMetric;
use kolosal_anomaly::neighbors::{KnnCollection, NeighborEvaluator, NeighborPopulator, PopulationStrategy};
use kolosal_anomaly::utils::ParallelConfig;
use kolosal_anomaly::AnomalyError;
use ndarray::{array, Array2};
use proptest::prelude::*;
use std::sync::Arc;

fn grid_with_outliers() -> Array2<f64> {
    let mut rows: Vec<f64> = (0..49).flat_map(|i| [(i % 7) as f64, (i / 7) as f64]).collect();
    rows.extend_from_slice(&[15.0, 15.0, -8.0, 3.0]);
    Array2::from_shape_vec((51, 2), rows).unwrap()
}

fn is_sorted(collection: &KnnCollection) -> bool {
    (0..collection.len()).all(|i| {
        collection
            .neighbors(i)
            .windows(2)
            .all(|w| w[0].distance <= w[1].distance)
    })
}

#[test]
fn test_collinear_scenario() {
    let x = array![[0.0], [1.0], [2.0], [100.0]];
    let scores = KnnDetector::with_k(1).score_samples(&x).unwrap();

    let max_idx = (0..4).max_by(|&a, &b| scores[a].total_cmp(&scores[b])).unwrap();
    assert_eq!(max_idx, 3);
    assert_eq!(scores[1], scores[2]);
    assert!(scores[1] <= scores[0]);
}

#[test]
fn test_duplicate_weight_matches_explicit_rows() {
    // Collapsed duplicates must score like the explicit weighted point set
    let duplicated = array![[0.0], [0.0], [3.0], [4.0]];
    let scores = KnnDetector::with_k(1).score_samples(&duplicated).unwrap();
    assert_eq!(scores[0], 0.0);
    assert_eq!(scores[1], 0.0);

    let mut evaluator = NeighborEvaluator::new(
        KnnScorer::new(false),
        array![[0.0], [3.0], [4.0]],
        vec![2, 1, 1],
        1,
        Arc::new(DistanceMetric::Euclidean),
        ParallelConfig::new(),
    )
    .unwrap();
    let weighted = evaluator.evaluate().unwrap().scores;
    assert_eq!(weighted, array![0.0, 1.0, 1.0]);
    assert_eq!(scores[2], weighted[1]);
    assert_eq!(scores[3], weighted[2]);
}

#[test]
fn test_lof_range_equals_single_k() {
    let x = grid_with_outliers();
    for k in [3, 5, 8] {
        let mut range = LofDetector::new(LofConfig::default().with_range(k, k));
        let mut single = LofDetector::with_k(k);
        assert_eq!(range.score_samples(&x).unwrap(), single.score_samples(&x).unwrap());
    }
}

#[test]
fn test_lof_range_is_max_over_k() {
    let x = grid_with_outliers();
    let range = LofDetector::new(LofConfig::default().with_range(3, 6))
        .score_samples(&x)
        .unwrap();
    for k in 3..=6 {
        let single = LofDetector::with_k(k).score_samples(&x).unwrap();
        for (r, s) in range.iter().zip(single.iter()) {
            assert!(r + 1e-12 >= *s);
        }
    }
}

#[test]
fn test_re_evaluate_zero_is_idempotent() {
    let x = grid_with_outliers();
    let mut evaluator = NeighborEvaluator::new(
        LofScorer::new(4),
        x,
        vec![1; 51],
        4,
        Arc::new(DistanceMetric::Euclidean),
        ParallelConfig::new(),
    )
    .unwrap();
    let first = evaluator.evaluate().unwrap();
    let again = evaluator.re_evaluate(0).unwrap();
    assert_eq!(first.scores, again.scores);
    assert_eq!(first.k, again.k);
}

#[test]
fn test_re_evaluate_before_evaluate() {
    let mut evaluator = NeighborEvaluator::new(
        KnnScorer::default(),
        array![[0.0], [1.0], [2.0]],
        vec![1; 3],
        2,
        Arc::new(DistanceMetric::Euclidean),
        ParallelConfig::new(),
    )
    .unwrap();
    assert!(matches!(evaluator.re_evaluate(1), Err(AnomalyError::InvalidState(_))));
    evaluator.evaluate().unwrap();
    assert!(matches!(
        evaluator.re_evaluate(2),
        Err(AnomalyError::ShrinkExceedsK { requested: 2, k: 2 })
    ));
    assert_eq!(evaluator.re_evaluate(1).unwrap().k, 1);
}

#[test]
fn test_shrink_matches_direct_population() {
    let x = grid_with_outliers();
    let mut shrunk = NeighborEvaluator::new(
        KnnScorer::default(),
        x.clone(),
        vec![1; 51],
        6,
        Arc::new(DistanceMetric::Euclidean),
        ParallelConfig::new(),
    )
    .unwrap();
    shrunk.evaluate().unwrap();
    let after = shrunk.re_evaluate(3).unwrap().scores;

    let direct = KnnDetector::with_k(3).score_samples(&x).unwrap();
    for (a, b) in after.iter().zip(direct.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn test_strategies_agree_in_high_dimension() {
    let x = Array2::from_shape_fn((30, 40), |(i, j)| ((i * 13 + j * 7) % 11) as f64 + (i % 3) as f64 * 0.5);
    let metric = DistanceMetric::Euclidean;
    let parallel = ParallelConfig::new().with_threads(4);
    assert_eq!(PopulationStrategy::select(&parallel, 40), PopulationStrategy::PairPartitioned);

    let sequential = NeighborPopulator::new(&metric, ParallelConfig::new())
        .populate(x.view(), vec![1; 30], 5)
        .unwrap();
    for strategy in [PopulationStrategy::RowPartitioned, PopulationStrategy::PairPartitioned] {
        let populated = NeighborPopulator::new(&metric, parallel.clone())
            .with_strategy(strategy)
            .populate(x.view(), vec![1; 30], 5)
            .unwrap();
        for i in 0..30 {
            let a: Vec<f64> = sequential.neighbors(i).iter().map(|n| n.distance).collect();
            let b: Vec<f64> = populated.neighbors(i).iter().map(|n| n.distance).collect();
            assert_eq!(a, b);
            assert_eq!(
                sequential.ties(i).len() + sequential.neighbors(i).len(),
                populated.ties(i).len() + populated.neighbors(i).len()
            );
        }
    }
}

#[test]
fn test_identical_points_loop_zero() {
    let x = Array2::from_elem((6, 3), 1.5);
    let scores = LoopDetector::with_k(3).score_samples(&x).unwrap();
    assert!(scores.iter().all(|&s| s == 0.0));
}

#[test]
fn test_detect_labels_outliers() {
    let x = grid_with_outliers();
    let result = LofDetector::with_k(5).detect(&x, 0.04).unwrap();
    assert_eq!(result.labels[49], -1);
    assert_eq!(result.labels[50], -1);
    assert!(result.n_anomalies <= 3);
}

proptest! {
    #[test]
    fn prop_lists_stay_sorted(
        k in 1usize..6,
        updates in prop::collection::vec((0usize..8, 0usize..8, 0u8..20), 0..200),
    ) {
        let mut collection = KnnCollection::unweighted(k, 8);
        for (p1, p2, d) in updates {
            collection.update_nearest_neighbors(p1, p2, d as f64);
            prop_assert!(is_sorted(&collection));
        }
        for i in 0..8 {
            prop_assert!(collection.neighbors(i).len() <= k);
            prop_assert!(collection.neighbors(i).iter().all(|n| n.index != i));
        }
    }

    #[test]
    fn prop_shrink_keeps_nearest(
        points in prop::collection::vec(-50i32..50, 4..20),
        k in 2usize..4,
    ) {
        let n = points.len();
        let x = Array2::from_shape_fn((n, 1), |(i, _)| points[i] as f64);
        let metric = DistanceMetric::Euclidean;
        let full = NeighborPopulator::new(&metric, ParallelConfig::new())
            .populate(x.view(), vec![1; n], k)
            .unwrap();
        let mut shrunk = full.clone();
        shrunk.shrink().unwrap();

        prop_assert_eq!(shrunk.k(), k - 1);
        prop_assert!(is_sorted(&shrunk));
        for i in 0..n {
            let kept = shrunk.neighbors(i);
            prop_assert_eq!(kept, &full.neighbors(i)[..kept.len()]);
            let kdist = shrunk.k_distance(i);
            // Nothing closer than the new k-distance was discarded
            for nb in full.neighbors(i) {
                if nb.distance < kdist {
                    prop_assert!(kept.iter().any(|m| m.index == nb.index));
                }
            }
        }
    }
}
