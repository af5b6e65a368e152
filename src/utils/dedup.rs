//! Duplicate collapsing
//!
//! Neighbor-based scores are defined over distinct coordinates: exact
//! duplicates share a score, and their multiplicity enters the algorithms as
//! a point weight.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::cmp::Ordering;

use crate::error::{AnomalyError, Result};

/// Distinct rows of a point matrix with their multiplicities
#[derive(Debug, Clone)]
pub struct DistinctPoints {
    /// Distinct rows, in order of first occurrence
    pub points: Array2<f64>,
    /// Number of input rows equal to each distinct row
    pub weight: Vec<usize>,
    /// Input row indices mapped to each distinct row
    pub mapping: Vec<Vec<usize>>,
    n_rows: usize,
}

/// Signed zeros compare equal, matching `==` on coordinates.
fn unsigned_zero(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

fn lexicographic(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| unsigned_zero(*x).total_cmp(&unsigned_zero(*y)))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

impl DistinctPoints {
    /// Collapse exact duplicate rows of `x`
    pub fn from_points(x: &Array2<f64>) -> Self {
        let n = x.nrows();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| lexicographic(x.row(a), x.row(b)).then(a.cmp(&b)));

        let mut groups: Vec<Vec<usize>> = Vec::new();
        for &idx in &order {
            match groups.last_mut() {
                Some(group) if lexicographic(x.row(group[0]), x.row(idx)) == Ordering::Equal => group.push(idx),
                _ => groups.push(vec![idx]),
            }
        }
        groups.sort_by_key(|g| g[0]);

        let first: Vec<usize> = groups.iter().map(|g| g[0]).collect();
        let points = x.select(Axis(0), &first);
        let weight = groups.iter().map(Vec::len).collect();

        Self {
            points,
            weight,
            mapping: groups,
            n_rows: n,
        }
    }

    /// Number of distinct rows
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Number of input rows
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Whether any input row was collapsed
    pub fn has_duplicates(&self) -> bool {
        self.len() != self.n_rows
    }

    /// Map per-distinct-row scores back to input row order
    pub fn broadcast(&self, scores: &Array1<f64>) -> Result<Array1<f64>> {
        if scores.len() != self.len() {
            return Err(AnomalyError::ShapeError {
                expected: format!("{} scores", self.len()),
                actual: format!("{} scores", scores.len()),
            });
        }

        let mut out = Array1::zeros(self.n_rows);
        for (score, rows) in scores.iter().zip(&self.mapping) {
            for &row in rows {
                out[row] = *score;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_collapse_duplicates() {
        let x = array![[1.0, 2.0], [0.0, 0.0], [1.0, 2.0], [5.0, 5.0], [0.0, 0.0], [1.0, 2.0]];
        let distinct = DistinctPoints::from_points(&x);

        assert_eq!(distinct.len(), 3);
        assert_eq!(distinct.points, array![[1.0, 2.0], [0.0, 0.0], [5.0, 5.0]]);
        assert_eq!(distinct.weight, vec![3, 2, 1]);
        assert_eq!(distinct.mapping, vec![vec![0, 2, 5], vec![1, 4], vec![3]]);
        assert!(distinct.has_duplicates());
    }

    #[test]
    fn test_signed_zeros_collapse() {
        // [-0.0, 2.0] would sort between the two zero rows if signs counted
        let x = array![[0.0, 1.0], [-0.0, 2.0], [-0.0, 1.0]];
        let distinct = DistinctPoints::from_points(&x);

        assert_eq!(distinct.len(), 2);
        assert_eq!(distinct.weight, vec![2, 1]);
        assert_eq!(distinct.mapping, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_broadcast_scores() {
        let x = array![[0.0], [0.0], [5.0]];
        let distinct = DistinctPoints::from_points(&x);
        let scores = distinct.broadcast(&array![0.25, 4.0]).unwrap();
        assert_eq!(scores, array![0.25, 0.25, 4.0]);
    }

    #[test]
    fn test_broadcast_rejects_wrong_length() {
        let x = array![[0.0], [1.0]];
        let distinct = DistinctPoints::from_points(&x);
        assert!(distinct.broadcast(&array![1.0]).is_err());
    }

    #[test]
    fn test_no_duplicates() {
        let x = array![[3.0], [1.0], [2.0]];
        let distinct = DistinctPoints::from_points(&x);
        assert!(!distinct.has_duplicates());
        assert_eq!(distinct.points, x);
        assert_eq!(distinct.weight, vec![1, 1, 1]);
    }
}
