//! Integration test: reusing populated neighbor models across detectors

use kolosal_anomaly::anomaly::{AnomalyDetector, CofDetector, InfloDetector, KnnDetector, LofConfig, LofDetector};
use kolosal_anomaly::distance::DistanceMetric;
use kolosal_anomaly::neighbors::KnnCollectionModel;
use ndarray::Array2;

fn data() -> Array2<f64> {
    let mut rows: Vec<f64> = (0..36).flat_map(|i| [(i % 6) as f64, (i / 6) as f64 * 1.5]).collect();
    rows.extend_from_slice(&[2.0, 2.0, 2.0, 2.0, 14.0, -3.0]);
    Array2::from_shape_vec((39, 2), rows).unwrap()
}

fn trained(k: usize) -> KnnCollectionModel {
    let mut knn = KnnDetector::with_k(k);
    knn.score_samples(&data()).unwrap();
    knn.model().cloned().unwrap()
}

#[test]
fn test_model_serves_other_algorithms() {
    let x = data();
    let model = trained(8);

    let fresh = LofDetector::with_k(5).score_samples(&x).unwrap();
    let reused = LofDetector::with_k(5).with_model(model.clone()).score_samples(&x).unwrap();
    for (a, b) in fresh.iter().zip(reused.iter()) {
        assert!((a - b).abs() < 1e-12);
    }

    let fresh = CofDetector::with_k(4).score_samples(&x).unwrap();
    let reused = CofDetector::with_k(4).with_model(model.clone()).score_samples(&x).unwrap();
    for (a, b) in fresh.iter().zip(reused.iter()) {
        assert!((a - b).abs() < 1e-12);
    }

    let fresh = InfloDetector::with_k(8).score_samples(&x).unwrap();
    let reused = InfloDetector::with_k(8).with_model(model).score_samples(&x).unwrap();
    assert_eq!(fresh, reused);
}

#[test]
fn test_model_is_not_consumed() {
    let x = data();
    let model = trained(6);
    let before = model.clone();

    let mut lof = LofDetector::new(LofConfig::default().with_range(2, 4)).with_model(model.clone());
    lof.score_samples(&x).unwrap();
    assert_eq!(model, before);
    assert_eq!(model.k(), 6);
}

#[test]
fn test_larger_k_recomputes() {
    let x = data();
    let model = trained(3);
    let fresh = KnnDetector::with_k(6).score_samples(&x).unwrap();
    let mut detector = KnnDetector::with_k(6).with_model(model);
    assert_eq!(detector.score_samples(&x).unwrap(), fresh);
    assert_eq!(detector.model().map(KnnCollectionModel::k), Some(6));
}

#[test]
fn test_different_measure_recomputes() {
    let x = data();
    let model = trained(5);
    let mut manhattan = KnnDetector::new(
        kolosal_anomaly::anomaly::KnnConfig::default()
            .with_k(5)
            .with_metric(DistanceMetric::Manhattan),
    );
    let fresh = manhattan.score_samples(&x).unwrap();

    let mut reusing = KnnDetector::new(
        kolosal_anomaly::anomaly::KnnConfig::default()
            .with_k(5)
            .with_metric(DistanceMetric::Manhattan),
    )
    .with_model(model);
    assert_eq!(reusing.score_samples(&x).unwrap(), fresh);
}

#[test]
fn test_model_round_trips_through_json() {
    let x = data();
    let model = trained(4);
    let json = serde_json::to_string(&model).unwrap();
    let restored: KnnCollectionModel = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, model);

    let fresh = KnnDetector::with_k(2).score_samples(&x).unwrap();
    let reused = KnnDetector::with_k(2).with_model(restored).score_samples(&x).unwrap();
    assert_eq!(fresh, reused);
}
