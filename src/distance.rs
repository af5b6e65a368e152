//! Distance measures
//!
//! Every neighbor and cluster evaluator is parameterized by a
//! [`DistanceMeasure`]. The built-in [`DistanceMetric`] covers the usual
//! Minkowski family plus cosine distance; callers can plug in their own
//! measure by implementing the trait.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetric, deterministic, non-negative distance between two vectors of
/// equal length.
pub trait DistanceMeasure: Send + Sync + fmt::Debug {
    /// Distance between `a` and `b`
    fn distance(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64;

    /// Stable identity used to decide whether a cached neighbor model was
    /// built with this measure. Two measures with the same identity must
    /// return identical distances.
    fn identity(&self) -> String;
}

/// Built-in distance metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Euclidean distance (L2)
    Euclidean,
    /// Manhattan distance (L1)
    Manhattan,
    /// Chebyshev distance (L-infinity)
    Chebyshev,
    /// Minkowski distance with parameter p
    Minkowski(f64),
    /// Cosine similarity converted to a distance
    Cosine,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        Self::Euclidean
    }
}

impl DistanceMeasure for DistanceMetric {
    fn distance(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match *self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(ai, bi)| {
                    let d = ai - bi;
                    d * d
                })
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Manhattan => a.iter().zip(b.iter()).map(|(ai, bi)| (ai - bi).abs()).sum(),
            DistanceMetric::Chebyshev => a
                .iter()
                .zip(b.iter())
                .map(|(ai, bi)| (ai - bi).abs())
                .fold(0.0, f64::max),
            DistanceMetric::Minkowski(p) => a
                .iter()
                .zip(b.iter())
                .map(|(ai, bi)| (ai - bi).abs().powf(p))
                .sum::<f64>()
                .powf(1.0 / p),
            DistanceMetric::Cosine => {
                let mut dot = 0.0;
                let mut norm_a = 0.0;
                let mut norm_b = 0.0;
                for (ai, bi) in a.iter().zip(b.iter()) {
                    dot += ai * bi;
                    norm_a += ai * ai;
                    norm_b += bi * bi;
                }
                let denom = norm_a.sqrt() * norm_b.sqrt();
                if denom > 0.0 {
                    (1.0 - dot / denom).max(0.0)
                } else if norm_a == norm_b {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    fn identity(&self) -> String {
        match self {
            DistanceMetric::Minkowski(p) => format!("minkowski(p={p})"),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}
