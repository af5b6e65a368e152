//! Integration test: cluster-based detectors

use kolosal_anomaly::anomaly::AnomalyDetector;
use kolosal_anomaly::cluster::{
    cblof_scores, CblofConfig, CblofDetector, ClusterPartition, CmgosConfig, CmgosDetector, CovarianceMatrix,
    CovarianceMethod, LargeClusterPolicy, LdcofConfig, LdcofDetector, Mcd, McdConfig, McdEstimate,
    SmallClusterPolicy,
};
use kolosal_anomaly::distance::DistanceMetric;
use kolosal_anomaly::utils::ParallelConfig;
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// `n` points scattered around `center`
fn blob(n: usize, center: [f64; 2], spread: f64, rng: &mut ChaCha8Rng) -> Vec<f64> {
    (0..n)
        .flat_map(|_| {
            let a: f64 = rng.gen_range(-spread..spread);
            let b: f64 = rng.gen_range(-spread..spread);
            [center[0] + a, center[1] + 0.6 * a + 0.4 * b]
        })
        .collect()
}

fn ninety_ten() -> (Array2<f64>, ClusterPartition) {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let mut rows = blob(90, [0.0, 0.0], 1.0, &mut rng);
    rows.extend(blob(10, [20.0, 20.0], 0.5, &mut rng));
    let x = Array2::from_shape_vec((100, 2), rows).unwrap();
    let assignment: Vec<usize> = (0..100).map(|i| usize::from(i >= 90)).collect();
    let partition = ClusterPartition::from_assignment(x.view(), assignment, 2).unwrap();
    (x, partition)
}

#[test]
fn test_cblof_ninety_ten() {
    let (x, partition) = ninety_ten();
    let policy = LargeClusterPolicy::AlphaBeta { alpha: 0.9, beta: 5.0 };
    assert_eq!(policy.large_clusters(partition.sizes()), vec![true, false]);

    let scores = cblof_scores(x.view(), &partition, &policy, false, &DistanceMetric::Euclidean).unwrap();
    let large_centroid = partition.centroid(0);
    for i in 90..100 {
        let expected = (&x.row(i) - &large_centroid).mapv(|v| v * v).sum().sqrt();
        assert!((scores[i] - expected).abs() < 1e-12);
    }
    let max_large = scores.iter().take(90).cloned().fold(f64::MIN, f64::max);
    let min_small = scores.iter().skip(90).cloned().fold(f64::MAX, f64::min);
    assert!(min_small > max_large);
}

#[test]
fn test_cblof_detector_weighting() {
    let (x, partition) = ninety_ten();
    let mut weighted = CblofDetector::default().with_partition(partition.clone());
    let mut plain = CblofDetector::new(CblofConfig::default().with_cluster_size_weighting(false))
        .with_partition(partition);

    let w = weighted.score_samples(&x).unwrap();
    let p = plain.score_samples(&x).unwrap();
    for i in 0..100 {
        let size = if i < 90 { 90.0 } else { 10.0 };
        assert!((w[i] - p[i] * size).abs() < 1e-9);
    }
}

#[test]
fn test_ldcof_small_cluster_relative_to_density() {
    let (x, partition) = ninety_ten();
    let mut detector = LdcofDetector::new(
        LdcofConfig::default().with_policy(LargeClusterPolicy::AlphaBeta { alpha: 0.9, beta: 5.0 }),
    )
    .with_partition(partition);
    let scores = detector.score_samples(&x).unwrap();

    // Members of the large cluster average to 1
    let mean_large = scores.iter().take(90).sum::<f64>() / 90.0;
    assert!((mean_large - 1.0).abs() < 1e-9);
    assert!(scores.iter().skip(90).all(|&s| s > 5.0));
}

#[test]
fn test_partition_rejects_wrong_size() {
    let (x, _) = ninety_ten();
    let partition = ClusterPartition::new(vec![0; 10], Array2::zeros((1, 2))).unwrap();
    let mut detector = CblofDetector::default().with_partition(partition);
    assert!(detector.score_samples(&x).is_err());
}

#[test]
fn test_reduction_restores_zero_effect_dimension() {
    let x = Array2::from_shape_fn((12, 2), |(i, j)| if j == 0 { i as f64 } else { 7.0 });
    let partition = ClusterPartition::new(vec![0; 12], Array2::zeros((1, 2))).unwrap();
    let result = CmgosDetector::new(
        CmgosConfig::default()
            .with_method(CovarianceMethod::Reduction)
            .with_small_clusters(SmallClusterPolicy::Keep)
            .with_remove_runs(0),
    )
    .with_partition(partition)
    .evaluate(&x)
    .unwrap();

    let first = x.column(0).to_owned();
    let cov = CovarianceMatrix::from_points(first.view().insert_axis(ndarray::Axis(1))).unwrap();
    let variance = cov.matrix()[[0, 0]];
    for i in 0..12 {
        let expected = (i as f64 - 5.5).powi(2) / variance / result.distance_limit;
        assert!((result.scores[i] - expected).abs() < 1e-9);
    }
}

#[test]
fn test_cmgos_mcd_flags_contamination() {
    let mut rng = ChaCha8Rng::seed_from_u64(23);
    let mut rows = blob(120, [0.0, 0.0], 1.0, &mut rng);
    rows.extend(blob(6, [3.0, -3.0], 0.1, &mut rng));
    let x = Array2::from_shape_vec((126, 2), rows).unwrap();
    let partition = ClusterPartition::new(vec![0; 126], Array2::zeros((1, 2))).unwrap();

    let result = CmgosDetector::new(
        CmgosConfig::default()
            .with_method(CovarianceMethod::Mcd)
            .with_small_clusters(SmallClusterPolicy::Keep)
            .with_iterations(100)
            .with_parallel(ParallelConfig::new().with_threads(2)),
    )
    .with_partition(partition)
    .evaluate(&x)
    .unwrap();

    assert!(result.scores.iter().skip(120).all(|&s| s > 1.0));
    let inside = result.scores.iter().take(120).filter(|&&s| s <= 1.0).count();
    assert!(inside >= 100);
}

#[test]
fn test_cmgos_with_kmeans() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let mut rows = blob(50, [0.0, 0.0], 1.0, &mut rng);
    rows.extend(blob(50, [12.0, 0.0], 1.0, &mut rng));
    rows.extend_from_slice(&[6.0, 9.0]);
    let x = Array2::from_shape_vec((101, 2), rows).unwrap();

    let mut detector = CmgosDetector::new(CmgosConfig::default().with_n_clusters(2));
    let result = detector.detect(&x, 0.01).unwrap();
    assert_eq!(result.labels[100], -1);
}

#[test]
fn test_mcd_determinant_monotonic() {
    let mut rng = ChaCha8Rng::seed_from_u64(31);
    let mut rows = blob(80, [0.0, 0.0], 1.0, &mut rng);
    rows.extend(blob(20, [8.0, 8.0], 2.0, &mut rng));
    let x = Array2::from_shape_vec((100, 2), rows).unwrap();
    let all: Vec<usize> = (0..100).collect();
    let h = Mcd::default().support_size(100, 2);

    let start_rows: Vec<usize> = (50..100).chain(0..2).collect();
    let cov = CovarianceMatrix::from_points(x.select(ndarray::Axis(0), &start_rows).view()).unwrap();
    let mut estimate = McdEstimate {
        log_determinant: cov.log_determinant(),
        covariance: cov,
        support: start_rows,
    };
    let mut steps = 0;
    loop {
        let next = Mcd::c_step(x.view(), &all, &estimate, h).unwrap();
        assert!(next.log_determinant <= estimate.log_determinant + 1e-9);
        steps += 1;
        if next.log_determinant >= estimate.log_determinant || steps > 100 {
            break;
        }
        estimate = next;
    }
    assert!(steps <= 100);
}

#[test]
fn test_mcd_location_is_robust() {
    let mut rng = ChaCha8Rng::seed_from_u64(41);
    let mut rows = blob(70, [1.0, 1.0], 0.5, &mut rng);
    rows.extend(blob(25, [30.0, -30.0], 0.5, &mut rng));
    let x = Array2::from_shape_vec((95, 2), rows).unwrap();

    let estimate = Mcd::new(McdConfig::default().with_iterations(60)).fit(x.view()).unwrap();
    let location: &Array1<f64> = estimate.covariance.location();
    assert!((location[0] - 1.0).abs() < 0.3);
    assert!((location[1] - 1.0).abs() < 0.3);
}
