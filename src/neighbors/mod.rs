//! Shared nearest-neighbor infrastructure
//!
//! - [`KnnCollection`]: per-point sorted top-k lists with tie tracking
//! - [`NeighborPopulator`]: sequential and parallel pairwise population
//! - [`NeighborEvaluator`]: population plus a [`NeighborScorer`] strategy
//! - [`KnnCollectionModel`]: reusable populated collection

mod collection;
mod evaluator;
mod model;
mod populate;

pub use collection::{KnnCollection, Neighbor, NeighborList};
pub use evaluator::{clamp_k, NeighborEvaluator, NeighborScorer, NeighborScores, ScoringContext};
pub use model::KnnCollectionModel;
pub use populate::{NeighborPopulator, PopulationStrategy, HIGH_DIMENSION_THRESHOLD};
