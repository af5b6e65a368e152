//! Clustering-based Multivariate Gaussian Outlier Score (CMGOS)
//!
//! Every cluster is modeled as a Gaussian. Points are scored by their
//! squared Mahalanobis distance to their cluster, divided by the
//! chi-squared quantile of the configured probability, so scores above 1
//! lie outside the expected normal region.
//!
//! Covariance estimation per cluster is one of:
//! - reduction: constant dimensions are dropped before inversion
//! - regularization: blend with the pooled covariance of all clusters
//! - MCD: robust Minimum Covariance Determinant estimate

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::index;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::covariance::{CovarianceMatrix, Mahalanobis};
use super::mcd::{Mcd, McdConfig};
use super::{resolve_partition, ClusterPartition};
use crate::anomaly::{validate_points, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::{AnomalyError, Result};
use crate::utils::parallel::ParallelConfig;

/// Variances at or below this share of the largest variance count as
/// constant under reduction.
const CONSTANT_TOLERANCE: f64 = 1e-12;

/// Handling of clusters too small for a covariance estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SmallClusterPolicy {
    /// Only clusters with fewer points than dimensions are removed
    Keep,
    /// Remove clusters below `(1 - probability) * n / n_clusters`
    RuleOfThumb,
    /// Remove clusters below `gamma * n / n_clusters`
    Gamma(f64),
    /// Remove clusters below a fixed size
    MinimumSize(usize),
}

/// Per-cluster covariance estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceMethod {
    Reduction,
    Regularization,
    Mcd,
}

/// CMGOS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmgosConfig {
    /// Probability mass of the normal class
    pub probability: f64,
    pub small_clusters: SmallClusterPolicy,
    pub method: CovarianceMethod,
    /// Rounds of dropping points above the distance limit before the final
    /// estimate; ignored for MCD
    pub remove_runs: usize,
    /// Weight of the pooled covariance under regularization
    pub lambda: f64,
    /// Estimate covariances from at most this many sampled cluster members
    pub covariance_sample: Option<usize>,
    /// MCD support size, `None` for `ceil(probability * cluster size)`
    pub h: Option<usize>,
    /// MCD random restarts
    pub iterations: usize,
    /// Clusters above this size use fastMCD
    pub fast_mcd_threshold: usize,
    pub subset_count: usize,
    pub subset_size: usize,
    /// Random seed for sampling and MCD
    pub seed: Option<u64>,
    /// Clusters built by k-means when no partition is supplied
    pub n_clusters: usize,
    /// Distance metric for cluster reassignment
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for CmgosConfig {
    fn default() -> Self {
        Self {
            probability: 0.975,
            small_clusters: SmallClusterPolicy::Gamma(0.1),
            method: CovarianceMethod::Reduction,
            remove_runs: 1,
            lambda: 0.1,
            covariance_sample: None,
            h: None,
            iterations: 500,
            fast_mcd_threshold: 600,
            subset_count: 5,
            subset_size: 300,
            seed: Some(42),
            n_clusters: 5,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl CmgosConfig {
    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_small_clusters(mut self, policy: SmallClusterPolicy) -> Self {
        self.small_clusters = policy;
        self
    }

    pub fn with_method(mut self, method: CovarianceMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_remove_runs(mut self, runs: usize) -> Self {
        self.remove_runs = runs;
        self
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_covariance_sample(mut self, sample: Option<usize>) -> Self {
        self.covariance_sample = sample;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_n_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Outcome of a CMGOS run
#[derive(Debug, Clone)]
pub struct CmgosResult {
    /// Squared Mahalanobis distance over the chi-squared quantile
    pub scores: Array1<f64>,
    /// Partition after small clusters were reassigned
    pub partition: ClusterPartition,
    /// Clusters removed as too small
    pub removed_clusters: Vec<bool>,
    /// Chi-squared quantile for the full dimensionality
    pub distance_limit: f64,
}

/// Fitted Gaussian of one cluster
#[derive(Debug, Clone)]
struct ClusterModel {
    /// Dimensions kept after reduction, `None` for all
    dims: Option<Vec<usize>>,
    /// `None` when every dimension is constant
    metric: Option<Mahalanobis>,
    /// Squared distance above which a point is dropped between rounds
    limit: f64,
}

impl ClusterModel {
    fn squared_distance(&self, x: ArrayView1<f64>) -> f64 {
        match (&self.metric, &self.dims) {
            (None, _) => 0.0,
            (Some(metric), None) => metric.squared_distance(x),
            (Some(metric), Some(dims)) => metric.squared_distance(x.select(Axis(0), dims).view()),
        }
    }
}

/// Chi-squared inverse CDF
pub fn chi_squared_quantile(probability: f64, degrees_of_freedom: usize) -> Result<f64> {
    let distribution = ChiSquared::new(degrees_of_freedom as f64)
        .map_err(|e| AnomalyError::ConfigError(format!("chi-squared with {degrees_of_freedom} degrees of freedom: {e}")))?;
    Ok(distribution.inverse_cdf(probability))
}

/// CMGOS over a clustered point set
#[derive(Debug, Clone)]
pub struct CmgosEvaluator {
    config: CmgosConfig,
    measure: Arc<dyn DistanceMeasure>,
}

impl CmgosEvaluator {
    pub fn new(mut config: CmgosConfig, measure: Arc<dyn DistanceMeasure>) -> Result<Self> {
        if !(config.probability > 0.0 && config.probability < 1.0) {
            return Err(AnomalyError::ConfigError(format!(
                "probability must lie in (0, 1), got {}",
                config.probability
            )));
        }
        let lambda = if config.lambda.is_finite() { config.lambda.clamp(0.0, 1.0) } else { 0.1 };
        if lambda != config.lambda {
            warn!(requested = config.lambda, used = lambda, "CMGOS lambda out of range, clamping");
            config.lambda = lambda;
        }
        if config.method == CovarianceMethod::Mcd && config.remove_runs > 0 {
            debug!(remove_runs = config.remove_runs, "MCD trims outliers itself, skipping removal rounds");
            config.remove_runs = 0;
        }
        Ok(Self { config, measure })
    }

    pub fn config(&self) -> &CmgosConfig {
        &self.config
    }

    fn small_cluster_limit(&self, n: usize, n_clusters: usize) -> Option<f64> {
        let k = n_clusters.max(1) as f64;
        match self.config.small_clusters {
            SmallClusterPolicy::Keep => None,
            SmallClusterPolicy::RuleOfThumb => Some((1.0 - self.config.probability) * n as f64 / k),
            SmallClusterPolicy::Gamma(gamma) => Some(gamma * n as f64 / k),
            SmallClusterPolicy::MinimumSize(size) => Some(size as f64),
        }
    }

    /// Score `points` against `partition`
    pub fn evaluate(&self, points: ArrayView2<f64>, mut partition: ClusterPartition) -> Result<CmgosResult> {
        partition.check_points(points)?;
        let (n, d) = points.dim();
        let k = partition.n_clusters();

        let mut removed = vec![false; k];
        if let Some(limit) = self.small_cluster_limit(n, k) {
            removed = partition.reassign_small_clusters(points, self.measure.as_ref(), limit);
        }
        let too_small = partition.reassign_small_clusters(points, self.measure.as_ref(), d as f64);
        for (r, s) in removed.iter_mut().zip(too_small) {
            *r |= s;
        }

        let distance_limit = chi_squared_quantile(self.config.probability, d)?;
        let scores = self
            .config
            .parallel
            .install(|| self.score(points, &partition, &removed, distance_limit))??;

        Ok(CmgosResult {
            scores,
            partition,
            removed_clusters: removed,
            distance_limit,
        })
    }

    fn score(
        &self,
        points: ArrayView2<f64>,
        partition: &ClusterPartition,
        removed: &[bool],
        distance_limit: f64,
    ) -> Result<Array1<f64>> {
        let n = points.nrows();
        let members: Vec<Vec<usize>> = (0..partition.n_clusters()).map(|c| partition.members(c)).collect();

        // Points are centered once by the mean of their cluster
        let mut centered = points.to_owned();
        for rows in members.iter().filter(|rows| !rows.is_empty()) {
            let mean = points
                .select(Axis(0), rows)
                .mean_axis(Axis(0))
                .ok_or_else(|| AnomalyError::ComputationError("empty cluster mean".to_string()))?;
            for &r in rows {
                let mut row = centered.row_mut(r);
                row -= &mean;
            }
        }

        let rounds = self.config.remove_runs;
        let mut kept = members.clone();
        let mut models = self.fit_models(centered.view(), &kept, removed, distance_limit, 0)?;
        for round in 1..=rounds {
            let before: usize = kept.iter().map(Vec::len).sum();
            kept = kept
                .into_iter()
                .zip(models.iter())
                .map(|(rows, model)| match model {
                    Some(model) => {
                        let inside: Vec<usize> = rows
                            .par_iter()
                            .copied()
                            .filter(|&r| model.squared_distance(centered.row(r)) <= model.limit)
                            .collect();
                        if inside.is_empty() {
                            rows
                        } else {
                            inside
                        }
                    }
                    None => rows,
                })
                .collect();
            let after: usize = kept.iter().map(Vec::len).sum();
            info!(round, dropped = before - after, "Dropped points above the cluster distance limit");
            models = self.fit_models(centered.view(), &kept, removed, distance_limit, round)?;
        }

        let assignment = partition.assignment();
        let scores: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| match &models[assignment[i]] {
                Some(model) => model.squared_distance(centered.row(i)) / distance_limit,
                None => 0.0,
            })
            .collect();
        Ok(Array1::from_vec(scores))
    }

    fn fit_models(
        &self,
        centered: ArrayView2<f64>,
        rows: &[Vec<usize>],
        removed: &[bool],
        distance_limit: f64,
        round: usize,
    ) -> Result<Vec<Option<ClusterModel>>> {
        match self.config.method {
            CovarianceMethod::Reduction => rows
                .iter()
                .enumerate()
                .map(|(c, r)| {
                    if r.is_empty() {
                        return Ok(None);
                    }
                    let covariance = self.sample_covariance(centered, r, c, round)?;
                    self.reduced_model(covariance).map(Some)
                })
                .collect(),
            CovarianceMethod::Regularization => self.regularized_models(centered, rows, removed, distance_limit, round),
            CovarianceMethod::Mcd => rows
                .iter()
                .enumerate()
                .map(|(c, r)| {
                    if r.is_empty() {
                        return Ok(None);
                    }
                    self.mcd_model(centered, r, c, distance_limit).map(Some)
                })
                .collect(),
        }
    }

    /// Covariance around the cluster mean, from a random sample of rows
    /// when sampling is configured.
    fn sample_covariance(
        &self,
        centered: ArrayView2<f64>,
        rows: &[usize],
        cluster: usize,
        round: usize,
    ) -> Result<CovarianceMatrix> {
        let origin = Array1::zeros(centered.ncols());
        match self.config.covariance_sample {
            Some(sample) if sample > 0 && sample < rows.len() => {
                let seed = self
                    .config
                    .seed
                    .unwrap_or_else(rand::random)
                    .wrapping_add(((round as u64) << 32) | cluster as u64);
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                let mut picked: Vec<usize> = index::sample(&mut rng, rows.len(), sample)
                    .into_iter()
                    .map(|p| rows[p])
                    .collect();
                picked.sort_unstable();
                CovarianceMatrix::about(centered.select(Axis(0), &picked).view(), origin)
            }
            _ => CovarianceMatrix::about(centered.select(Axis(0), rows).view(), origin),
        }
    }

    fn reduced_model(&self, covariance: CovarianceMatrix) -> Result<ClusterModel> {
        let d = covariance.dim();
        let variances = covariance.variances();
        let largest = variances.iter().cloned().fold(0.0_f64, f64::max);
        let dims: Vec<usize> = (0..d)
            .filter(|&j| variances[j] > CONSTANT_TOLERANCE * largest)
            .collect();

        if dims.is_empty() {
            return Ok(ClusterModel {
                dims: Some(dims),
                metric: None,
                limit: 0.0,
            });
        }

        let reduced = dims.len() < d;
        if reduced {
            debug!(kept = dims.len(), dims = d, "Dropped constant dimensions");
        }
        let mut covariance = if reduced { covariance.project(&dims) } else { covariance };
        covariance.regularize_if_singular();

        Ok(ClusterModel {
            limit: chi_squared_quantile(self.config.probability, dims.len())?,
            metric: Some(covariance.mahalanobis()?),
            dims: if reduced { Some(dims) } else { None },
        })
    }

    fn regularized_models(
        &self,
        centered: ArrayView2<f64>,
        rows: &[Vec<usize>],
        removed: &[bool],
        distance_limit: f64,
        round: usize,
    ) -> Result<Vec<Option<ClusterModel>>> {
        let d = centered.ncols();
        let covariances: Vec<Option<CovarianceMatrix>> = rows
            .iter()
            .enumerate()
            .map(|(c, r)| {
                if r.is_empty() {
                    Ok(None)
                } else {
                    self.sample_covariance(centered, r, c, round).map(Some)
                }
            })
            .collect::<Result<_>>()?;

        let mut pooled = Array2::<f64>::zeros((d, d));
        let mut pooled_size = 0usize;
        for (c, covariance) in covariances.iter().enumerate() {
            if let (Some(covariance), false) = (covariance, removed[c]) {
                pooled.scaled_add(rows[c].len() as f64, covariance.matrix());
                pooled_size += rows[c].len();
            }
        }
        if pooled_size == 0 {
            return Err(AnomalyError::NoClusterLeft);
        }
        pooled /= pooled_size as f64;

        covariances
            .into_iter()
            .map(|covariance| match covariance {
                None => Ok(None),
                Some(covariance) => {
                    let mut blended = covariance.blend(&pooled, self.config.lambda)?;
                    blended.regularize_if_singular();
                    Ok(Some(ClusterModel {
                        dims: None,
                        metric: Some(blended.mahalanobis()?),
                        limit: distance_limit,
                    }))
                }
            })
            .collect()
    }

    fn mcd_model(
        &self,
        centered: ArrayView2<f64>,
        rows: &[usize],
        cluster: usize,
        distance_limit: f64,
    ) -> Result<ClusterModel> {
        let h = self
            .config
            .h
            .unwrap_or_else(|| (self.config.probability * rows.len() as f64).ceil() as usize);
        let mcd = Mcd::new(McdConfig {
            h: Some(h),
            iterations: self.config.iterations,
            fast_mcd_threshold: self.config.fast_mcd_threshold,
            subset_count: self.config.subset_count,
            subset_size: self.config.subset_size,
            seed: self.config.seed.map(|s| s.wrapping_add(cluster as u64)),
            parallel: self.config.parallel.clone(),
            ..McdConfig::default()
        });

        let estimate = mcd.fit_in_current_pool(centered.select(Axis(0), rows).view())?;
        debug!(
            cluster,
            size = rows.len(),
            support = estimate.support.len(),
            log_determinant = estimate.log_determinant,
            "Estimated MCD covariance"
        );
        let mut covariance = estimate.covariance;
        covariance.regularize_if_singular();
        Ok(ClusterModel {
            dims: None,
            metric: Some(covariance.mahalanobis()?),
            limit: distance_limit,
        })
    }
}

/// Clustering-based Multivariate Gaussian Outlier Score detector
#[derive(Debug, Clone)]
pub struct CmgosDetector {
    config: CmgosConfig,
    measure: Arc<dyn DistanceMeasure>,
    partition: Option<ClusterPartition>,
}

impl CmgosDetector {
    pub fn new(config: CmgosConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self {
            config,
            measure,
            partition: None,
        }
    }

    pub fn with_measure(mut self, measure: Arc<dyn DistanceMeasure>) -> Self {
        self.measure = measure;
        self
    }

    /// Score against this partition instead of running k-means
    pub fn with_partition(mut self, partition: ClusterPartition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Full outcome, including the partition after reassignment
    pub fn evaluate(&self, x: &Array2<f64>) -> Result<CmgosResult> {
        validate_points(x)?;
        let partition = resolve_partition(x.view(), self.partition.as_ref(), self.config.n_clusters, self.config.seed)?;
        CmgosEvaluator::new(self.config.clone(), Arc::clone(&self.measure))?.evaluate(x.view(), partition)
    }
}

impl Default for CmgosDetector {
    fn default() -> Self {
        Self::new(CmgosConfig::default())
    }
}

impl AnomalyDetector for CmgosDetector {
    fn name(&self) -> &'static str {
        "cmgos"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        Ok(self.evaluate(x)?.scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;

    fn blob(n: usize, center: (f64, f64), seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .flat_map(|_| {
                let a: f64 = rng.gen_range(-1.0..1.0);
                let b: f64 = rng.gen_range(-1.0..1.0);
                [center.0 + a, center.1 + 0.5 * a + 0.3 * b]
            })
            .collect()
    }

    fn one_cluster(n: usize) -> ClusterPartition {
        ClusterPartition::new(vec![0; n], Array2::zeros((1, 2))).unwrap()
    }

    #[test]
    fn test_chi_squared_quantile() {
        assert!((chi_squared_quantile(0.975, 1).unwrap() - 5.023886).abs() < 1e-4);
        assert!((chi_squared_quantile(0.975, 2).unwrap() - 7.377759).abs() < 1e-4);
    }

    #[test]
    fn test_invalid_probability() {
        let config = CmgosConfig::default().with_probability(1.0);
        assert!(CmgosEvaluator::new(config, Arc::new(DistanceMetric::Euclidean)).is_err());
    }

    #[test]
    fn test_reduction_drops_constant_dimension() {
        let x = array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [4.0, 5.0]];
        let config = CmgosConfig::default()
            .with_small_clusters(SmallClusterPolicy::Keep)
            .with_remove_runs(0);
        let evaluator = CmgosEvaluator::new(config, Arc::new(DistanceMetric::Euclidean)).unwrap();
        let result = evaluator.evaluate(x.view(), one_cluster(5)).unwrap();

        // Only the first dimension is left: variance 2.5 around mean 2
        let limit = chi_squared_quantile(0.975, 2).unwrap();
        for (i, &s) in result.scores.iter().enumerate() {
            let expected = (i as f64 - 2.0).powi(2) / 2.5 / limit;
            assert!((s - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_outlier_exceeds_limit() {
        let mut rows = blob(60, (0.0, 0.0), 1);
        rows.extend_from_slice(&[4.0, -4.0]);
        let x = Array2::from_shape_vec((61, 2), rows).unwrap();

        for method in [CovarianceMethod::Reduction, CovarianceMethod::Regularization, CovarianceMethod::Mcd] {
            let config = CmgosConfig::default()
                .with_method(method)
                .with_small_clusters(SmallClusterPolicy::Keep)
                .with_iterations(50);
            let evaluator = CmgosEvaluator::new(config, Arc::new(DistanceMetric::Euclidean)).unwrap();
            let scores = evaluator.evaluate(x.view(), one_cluster(61)).unwrap().scores;
            let max_rest = scores.iter().take(60).cloned().fold(f64::MIN, f64::max);
            assert!(scores[60] > 1.0, "{method:?}");
            assert!(scores[60] > max_rest, "{method:?}");
        }
    }

    #[test]
    fn test_regularization_without_clusters_fails() {
        let x = Array2::from_shape_vec((20, 2), blob(20, (0.0, 0.0), 4)).unwrap();
        let partition = ClusterPartition::from_assignment(x.view(), (0..20).map(|i| i % 2).collect(), 2).unwrap();
        let config = CmgosConfig::default()
            .with_method(CovarianceMethod::Regularization)
            .with_small_clusters(SmallClusterPolicy::MinimumSize(50));
        let evaluator = CmgosEvaluator::new(config, Arc::new(DistanceMetric::Euclidean)).unwrap();
        let err = evaluator.evaluate(x.view(), partition).unwrap_err();
        assert!(matches!(err, AnomalyError::NoClusterLeft));
    }

    #[test]
    fn test_small_cluster_is_absorbed() {
        let mut rows = blob(40, (0.0, 0.0), 2);
        rows.extend(blob(40, (10.0, 10.0), 3));
        rows.extend_from_slice(&[5.0, 5.0]);
        let x = Array2::from_shape_vec((81, 2), rows).unwrap();
        let assignment: Vec<usize> = (0..81).map(|i| if i < 40 { 0 } else if i < 80 { 1 } else { 2 }).collect();
        let partition = ClusterPartition::from_assignment(x.view(), assignment, 3).unwrap();

        let result = CmgosDetector::new(CmgosConfig::default())
            .with_partition(partition)
            .evaluate(&x)
            .unwrap();
        assert_eq!(result.removed_clusters, vec![false, false, true]);
        assert_eq!(result.partition.sizes().iter().sum::<usize>(), 81);
        assert_eq!(result.partition.sizes()[2], 0);
        assert!(result.scores[80] > 1.0);
    }

    #[test]
    fn test_covariance_sampling() {
        let mut rows = blob(200, (0.0, 0.0), 9);
        rows.extend_from_slice(&[6.0, -6.0]);
        let x = Array2::from_shape_vec((201, 2), rows).unwrap();
        let config = CmgosConfig::default()
            .with_small_clusters(SmallClusterPolicy::Keep)
            .with_covariance_sample(Some(50));
        let evaluator = CmgosEvaluator::new(config, Arc::new(DistanceMetric::Euclidean)).unwrap();
        let scores = evaluator.evaluate(x.view(), one_cluster(201)).unwrap().scores;
        let max_rest = scores.iter().take(200).cloned().fold(f64::MIN, f64::max);
        assert!(scores[200] > max_rest);
    }
}
