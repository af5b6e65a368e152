//! Local Correlation Integral (LOCI)
//!
//! For every critical radius r of a point p, LOCI compares the number of
//! points within `alpha * r` of p with the average of the same count over
//! p's r-neighborhood (the multi-granularity deviation factor, MDEF). The
//! score is the largest MDEF measured in units of its standard deviation.
//!
//! Memory is quadratic: every point keeps all `2n` critical distances.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{validate_points, AnomalyDetector};
use crate::distance::{DistanceMeasure, DistanceMetric};
use crate::error::{AnomalyError, Result};
use crate::utils::dedup::DistinctPoints;
use crate::utils::parallel::{parallel_map_indexed, ParallelConfig};

/// LOCI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LociConfig {
    /// Ratio between the counting and the sampling radius
    pub alpha: f64,
    /// Minimum weighted neighborhood size for a radius to be considered
    pub n_min: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Parallel evaluation
    pub parallel: ParallelConfig,
}

impl Default for LociConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            n_min: 20,
            metric: DistanceMetric::Euclidean,
            parallel: ParallelConfig::default(),
        }
    }
}

impl LociConfig {
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_n_min(mut self, n_min: usize) -> Self {
        self.n_min = n_min;
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
struct CriticalDistance {
    distance: f64,
    /// Point reached at this distance, `None` for an `r / alpha` entry
    point: Option<usize>,
    /// Weighted number of points within `distance`, inclusive
    count: usize,
}

/// LOCI over a weighted point set
#[derive(Debug)]
pub struct LociEvaluator<'a> {
    points: ArrayView2<'a, f64>,
    weight: &'a [usize],
    measure: &'a dyn DistanceMeasure,
    alpha: f64,
    n_min: usize,
    parallel: ParallelConfig,
}

impl<'a> LociEvaluator<'a> {
    /// `alpha` must lie in `(0, 1]`; `n_min` is clamped below the total
    /// weight.
    pub fn new(
        points: ArrayView2<'a, f64>,
        weight: &'a [usize],
        measure: &'a dyn DistanceMeasure,
        alpha: f64,
        n_min: usize,
        parallel: ParallelConfig,
    ) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(AnomalyError::ConfigError(format!("LOCI alpha must lie in (0, 1], got {alpha}")));
        }
        if weight.len() != points.nrows() {
            return Err(AnomalyError::ShapeError {
                expected: format!("{} weights", points.nrows()),
                actual: format!("{} weights", weight.len()),
            });
        }

        let total: usize = weight.iter().sum();
        let limit = total.saturating_sub(1).max(1);
        let clamped = n_min.min(limit);
        if clamped != n_min {
            warn!(requested = n_min, used = clamped, total, "LOCI n_min exceeds data size, clamping");
        }

        Ok(Self {
            points,
            weight,
            measure,
            alpha,
            n_min: clamped,
            parallel,
        })
    }

    fn critical_distances(&self, i: usize) -> Vec<CriticalDistance> {
        let n = self.points.nrows();
        let mut entries = Vec::with_capacity(2 * n);
        for j in 0..n {
            let d = if j == i {
                0.0
            } else {
                self.measure.distance(self.points.row(i), self.points.row(j))
            };
            entries.push(CriticalDistance { distance: d, point: Some(j), count: 0 });
            entries.push(CriticalDistance { distance: d / self.alpha, point: None, count: 0 });
        }

        // Points sort before sampling entries at equal distance, so counts
        // at a radius include every point on its boundary.
        entries.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.point.is_some().cmp(&a.point.is_some()))
        });

        let mut count = 0;
        for e in &mut entries {
            if let Some(p) = e.point {
                count += self.weight[p];
            }
            e.count = count;
        }
        entries
    }

    /// Weighted number of points within `radius`
    fn count_within(entries: &[CriticalDistance], radius: f64) -> usize {
        let idx = entries.partition_point(|e| e.distance <= radius);
        if idx == 0 {
            0
        } else {
            entries[idx - 1].count
        }
    }

    fn point_score(&self, i: usize, all: &[Vec<CriticalDistance>]) -> f64 {
        let entries = &all[i];
        let mut best = 0.0_f64;

        for (j, entry) in entries.iter().enumerate() {
            if entry.count < self.n_min {
                continue;
            }
            if j + 1 < entries.len() && entries[j + 1].distance == entry.distance {
                continue;
            }

            let alpha_r = entry.distance * self.alpha;
            let n_pr = entry.count as f64;
            let n_pr_alpha = Self::count_within(entries, alpha_r) as f64;

            let sampled: Vec<(f64, f64)> = entries[..=j]
                .iter()
                .filter_map(|e| e.point)
                .map(|p| (self.weight[p] as f64, Self::count_within(&all[p], alpha_r) as f64))
                .collect();

            let n_hat = sampled.iter().map(|(w, c)| w * c).sum::<f64>() / n_pr;
            let variance = sampled.iter().map(|(w, c)| w * (c - n_hat).powi(2)).sum::<f64>() / n_pr;

            let mdef = 1.0 - n_pr_alpha / n_hat;
            let sigma_mdef = variance.sqrt() / n_hat;
            let ratio = if sigma_mdef == 0.0 { 0.0 } else { mdef / sigma_mdef };
            if ratio > best {
                best = ratio;
            }
        }
        best
    }

    /// Score every point
    pub fn evaluate(&self) -> Result<Array1<f64>> {
        let n = self.points.nrows();
        if n < 2 {
            return Ok(Array1::zeros(n));
        }

        let all = parallel_map_indexed(n, &self.parallel, |i| self.critical_distances(i))?;
        let scores = parallel_map_indexed(n, &self.parallel, |i| self.point_score(i, &all))?;
        debug!(n, n_min = self.n_min, alpha = self.alpha, "Computed LOCI scores");
        Ok(Array1::from_vec(scores))
    }
}

/// Local Correlation Integral detector
#[derive(Debug, Clone)]
pub struct LociDetector {
    config: LociConfig,
    measure: Arc<dyn DistanceMeasure>,
}

impl LociDetector {
    pub fn new(config: LociConfig) -> Self {
        let measure: Arc<dyn DistanceMeasure> = Arc::new(config.metric);
        Self { config, measure }
    }

    pub fn with_measure(mut self, measure: Arc<dyn DistanceMeasure>) -> Self {
        self.measure = measure;
        self
    }
}

impl Default for LociDetector {
    fn default() -> Self {
        Self::new(LociConfig::default())
    }
}

impl AnomalyDetector for LociDetector {
    fn name(&self) -> &'static str {
        "loci"
    }

    fn score_samples(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        validate_points(x)?;
        let distinct = DistinctPoints::from_points(x);
        let evaluator = LociEvaluator::new(
            distinct.points.view(),
            &distinct.weight,
            self.measure.as_ref(),
            self.config.alpha,
            self.config.n_min,
            self.config.parallel.clone(),
        )?;
        distinct.broadcast(&evaluator.evaluate()?)
    }
}
