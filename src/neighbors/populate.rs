//! Pairwise distance population of a [`KnnCollection`]
//!
//! Three strategies:
//! - sequential: each unordered pair is measured once and offered in both
//!   directions;
//! - row-partitioned: every worker owns a disjoint range of points and scans
//!   all other points for them, so no list is shared and no lock is taken;
//! - pair-partitioned: the `n(n-1)/2` pairs are split evenly by count and the
//!   two lists touched by a pair are locked one after the other. Measuring a
//!   pair only once pays off when the distance itself is expensive, i.e. for
//!   high-dimensional data.

use ndarray::ArrayView2;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use super::collection::{KnnCollection, NeighborList};
use crate::distance::DistanceMeasure;
use crate::error::Result;
use crate::utils::parallel::{split_ranges, ParallelConfig};

/// Dimensionality at which parallel population switches to pair partitioning
pub const HIGH_DIMENSION_THRESHOLD: usize = 32;

/// How pairwise distances are distributed over workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopulationStrategy {
    Sequential,
    RowPartitioned,
    PairPartitioned,
}

impl PopulationStrategy {
    /// Pick a strategy for `dims`-dimensional data under `parallel`
    pub fn select(parallel: &ParallelConfig, dims: usize) -> Self {
        if !parallel.enabled || parallel.num_threads() < 2 {
            Self::Sequential
        } else if dims < HIGH_DIMENSION_THRESHOLD {
            Self::RowPartitioned
        } else {
            Self::PairPartitioned
        }
    }
}

/// Fills a [`KnnCollection`] from a point matrix
#[derive(Debug)]
pub struct NeighborPopulator<'a> {
    measure: &'a dyn DistanceMeasure,
    parallel: ParallelConfig,
    strategy: Option<PopulationStrategy>,
}

impl<'a> NeighborPopulator<'a> {
    pub fn new(measure: &'a dyn DistanceMeasure, parallel: ParallelConfig) -> Self {
        Self {
            measure,
            parallel,
            strategy: None,
        }
    }

    /// Force a strategy instead of selecting one by dimensionality
    pub fn with_strategy(mut self, strategy: PopulationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Build a populated collection of size `k` over `points`
    pub fn populate(&self, points: ArrayView2<f64>, weight: Vec<usize>, k: usize) -> Result<KnnCollection> {
        let strategy = self
            .strategy
            .unwrap_or_else(|| PopulationStrategy::select(&self.parallel, points.ncols()));
        let start = Instant::now();
        let mut collection = KnnCollection::new(k, weight);

        match strategy {
            PopulationStrategy::Sequential => self.populate_sequential(points, &mut collection),
            PopulationStrategy::RowPartitioned => self.populate_rows(points, &mut collection)?,
            PopulationStrategy::PairPartitioned => {
                collection = self.populate_pairs(points, collection)?;
            }
        }

        debug!(
            n = points.nrows(),
            dims = points.ncols(),
            k,
            ?strategy,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Populated nearest-neighbor collection"
        );
        Ok(collection)
    }

    fn populate_sequential(&self, points: ArrayView2<f64>, collection: &mut KnnCollection) {
        let n = points.nrows();
        for i in 0..n {
            for j in (i + 1)..n {
                let d = self.measure.distance(points.row(i), points.row(j));
                collection.update_nearest_neighbors(i, j, d);
                collection.update_nearest_neighbors(j, i, d);
            }
        }
    }

    fn populate_rows(&self, points: ArrayView2<f64>, collection: &mut KnnCollection) -> Result<()> {
        let n = points.nrows();
        let k = collection.k();
        let chunk = n.div_ceil(self.parallel.num_threads()).max(1);
        let measure = self.measure;
        let lists = collection.lists_mut();

        self.parallel.install(|| {
            lists.par_chunks_mut(chunk).enumerate().for_each(|(c, owned)| {
                let offset = c * chunk;
                for (local, list) in owned.iter_mut().enumerate() {
                    let i = offset + local;
                    for j in 0..n {
                        if j != i {
                            list.offer(k, j, measure.distance(points.row(i), points.row(j)));
                        }
                    }
                }
            })
        })
    }

    fn populate_pairs(&self, points: ArrayView2<f64>, collection: KnnCollection) -> Result<KnnCollection> {
        let n = points.nrows();
        let k = collection.k();
        let weight = collection.weight().to_vec();
        let locked: Vec<Mutex<NeighborList>> = collection.into_lists().into_iter().map(Mutex::new).collect();
        let total_pairs = n * n.saturating_sub(1) / 2;
        let measure = self.measure;

        self.parallel.install(|| {
            split_ranges(total_pairs, self.parallel.num_threads())
                .into_par_iter()
                .for_each(|range| {
                    let (mut i, mut j) = pair_at(n, range.start);
                    for _ in range {
                        let d = measure.distance(points.row(i), points.row(j));
                        locked[i].lock().offer(k, j, d);
                        locked[j].lock().offer(k, i, d);
                        j += 1;
                        if j == n {
                            i += 1;
                            j = i + 1;
                        }
                    }
                })
        })?;

        let lists = locked.into_iter().map(Mutex::into_inner).collect();
        Ok(KnnCollection::from_parts(k, weight, lists))
    }
}

/// Row-major position of the `index`-th unordered pair `(i, j)`, `i < j`.
fn pair_at(n: usize, mut index: usize) -> (usize, usize) {
    let mut i = 0;
    while i + 1 < n {
        let row = n - 1 - i;
        if index < row {
            return (i, i + 1 + index);
        }
        index -= row;
        i += 1;
    }
    (i, i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;
    use ndarray::Array2;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn random_points(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |_| rng.gen_range(-5.0..5.0))
    }

    fn neighborhood(c: &KnnCollection, i: usize) -> Vec<usize> {
        let mut all: Vec<usize> = c.neighbors(i).iter().map(|n| n.index).collect();
        all.extend_from_slice(c.ties(i));
        all.sort_unstable();
        all
    }

    #[test]
    fn test_pair_at() {
        assert_eq!(pair_at(4, 0), (0, 1));
        assert_eq!(pair_at(4, 2), (0, 3));
        assert_eq!(pair_at(4, 3), (1, 2));
        assert_eq!(pair_at(4, 5), (2, 3));
    }

    #[test]
    fn test_strategy_selection() {
        let seq = ParallelConfig::new();
        let par = ParallelConfig::new().with_threads(4);
        assert_eq!(PopulationStrategy::select(&seq, 64), PopulationStrategy::Sequential);
        assert_eq!(PopulationStrategy::select(&par, 3), PopulationStrategy::RowPartitioned);
        assert_eq!(PopulationStrategy::select(&par, 32), PopulationStrategy::PairPartitioned);
    }

    #[test]
    fn test_strategies_agree() {
        let x = random_points(60, 4, 7);
        let metric = DistanceMetric::Euclidean;
        let parallel = ParallelConfig::new().with_threads(3);
        let build = |s| {
            NeighborPopulator::new(&metric, parallel.clone())
                .with_strategy(s)
                .populate(x.view(), vec![1; 60], 5)
                .unwrap()
        };

        let seq = build(PopulationStrategy::Sequential);
        let rows = build(PopulationStrategy::RowPartitioned);
        let pairs = build(PopulationStrategy::PairPartitioned);

        assert_eq!(seq, rows);
        for i in 0..60 {
            assert_eq!(neighborhood(&seq, i), neighborhood(&pairs, i));
            assert_eq!(seq.k_distance(i), pairs.k_distance(i));
        }
    }

    #[test]
    fn test_neighbors_exclude_self() {
        let x = random_points(20, 2, 1);
        let metric = DistanceMetric::Manhattan;
        let c = NeighborPopulator::new(&metric, ParallelConfig::new())
            .populate(x.view(), vec![1; 20], 3)
            .unwrap();
        for i in 0..20 {
            assert_eq!(c.neighbors(i).len(), 3);
            assert!(c.neighbors(i).iter().all(|n| n.index != i));
        }
    }
}
