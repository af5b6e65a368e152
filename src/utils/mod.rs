//! Utility functions and types

pub mod dedup;
pub mod parallel;

pub use dedup::DistinctPoints;
pub use parallel::{parallel_map_indexed, split_ranges, ParallelConfig};
