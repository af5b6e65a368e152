//! Reusable neighbor model
//!
//! A populated collection can serve any later request over the same points
//! and measure with an equal or smaller k: the stored collection is cloned
//! and shrunk instead of recomputing all pairwise distances.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::collection::KnnCollection;
use crate::distance::DistanceMeasure;
use crate::error::Result;

/// Populated [`KnnCollection`] together with what it was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnCollectionModel {
    points: Array2<f64>,
    measure: String,
    collection: KnnCollection,
}

impl KnnCollectionModel {
    pub fn new(points: Array2<f64>, measure: &dyn DistanceMeasure, collection: KnnCollection) -> Self {
        Self {
            points,
            measure: measure.identity(),
            collection,
        }
    }

    /// Neighborhood size the model was built with
    pub fn k(&self) -> usize {
        self.collection.k()
    }

    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    /// Identity of the distance measure used to build the model
    pub fn measure(&self) -> &str {
        &self.measure
    }

    pub fn collection(&self) -> &KnnCollection {
        &self.collection
    }

    fn mismatch(&self, points: &Array2<f64>, measure: &dyn DistanceMeasure, k: usize) -> Option<&'static str> {
        if k > self.k() {
            Some("requested k exceeds model k")
        } else if self.measure != measure.identity() {
            Some("distance measure differs")
        } else if self.points != *points {
            Some("point set differs")
        } else {
            None
        }
    }

    /// Whether this model may serve a request for `k` neighbors over
    /// `points` under `measure`
    pub fn reusable_for(&self, points: &Array2<f64>, measure: &dyn DistanceMeasure, k: usize) -> bool {
        self.mismatch(points, measure, k).is_none()
    }

    /// Copy of the stored collection shrunk to `k`, or `None` when the model
    /// does not match the request
    pub fn collection_for(
        &self,
        points: &Array2<f64>,
        measure: &dyn DistanceMeasure,
        k: usize,
    ) -> Result<Option<KnnCollection>> {
        if let Some(reason) = self.mismatch(points, measure, k) {
            info!(reason, model_k = self.k(), k, "Neighbor model not reusable, recomputing");
            return Ok(None);
        }

        let mut collection = self.collection.snapshot();
        collection.shrink_by(self.k() - k)?;
        info!(model_k = self.k(), k, "Reusing neighbor model");
        Ok(Some(collection))
    }
}
