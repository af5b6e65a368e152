//! Minimum Covariance Determinant (MCD) estimator
//!
//! Finds the `h` points whose sample covariance has the smallest
//! determinant. Random `(p + 1)`-point seeds are refined with C-steps
//! (re-estimate from the `h` points nearest in Mahalanobis distance), which
//! never increase the determinant. Large inputs go through the staged
//! fastMCD search: disjoint subsets, a merged subset, then the full data.

use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

use super::covariance::CovarianceMatrix;
use crate::error::{AnomalyError, Result};
use crate::utils::parallel::{split_ranges, ParallelConfig};

/// MCD configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McdConfig {
    /// Support size, `None` for the lower bound `ceil((n + p + 1) / 2)`
    pub h: Option<usize>,
    /// Random restarts
    pub iterations: usize,
    /// Inputs above this size use fastMCD
    pub fast_mcd_threshold: usize,
    /// Maximum number of fastMCD subsets
    pub subset_count: usize,
    /// Points per fastMCD subset
    pub subset_size: usize,
    /// Candidates kept between stages
    pub candidates: usize,
    /// Upper bound on C-steps while converging
    pub max_c_steps: usize,
    /// Random seed
    pub seed: Option<u64>,
    /// Parallel restarts
    pub parallel: ParallelConfig,
}

impl Default for McdConfig {
    fn default() -> Self {
        Self {
            h: None,
            iterations: 500,
            fast_mcd_threshold: 600,
            subset_count: 5,
            subset_size: 300,
            candidates: 10,
            max_c_steps: 100,
            seed: Some(42),
            parallel: ParallelConfig::default(),
        }
    }
}

impl McdConfig {
    pub fn with_h(mut self, h: Option<usize>) -> Self {
        self.h = h;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_fast_mcd_threshold(mut self, threshold: usize) -> Self {
        self.fast_mcd_threshold = threshold;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Location and scatter of an h-subset
#[derive(Debug, Clone)]
pub struct McdEstimate {
    /// Covariance of the support around its mean
    pub covariance: CovarianceMatrix,
    /// Log-determinant, negative infinity for an exact fit
    pub log_determinant: f64,
    /// Row indices of the support
    pub support: Vec<usize>,
}

impl McdEstimate {
    fn from_support(points: ArrayView2<f64>, support: Vec<usize>) -> Result<Self> {
        let covariance = CovarianceMatrix::from_points(points.select(Axis(0), &support).view())?;
        Ok(Self {
            log_determinant: covariance.log_determinant(),
            covariance,
            support,
        })
    }

    pub fn determinant(&self) -> f64 {
        self.log_determinant.exp()
    }
}

struct Ranked {
    log_determinant: f64,
    seq: u64,
    estimate: McdEstimate,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.log_determinant
            .total_cmp(&other.log_determinant)
            .then(self.seq.cmp(&other.seq))
    }
}

/// The `capacity` lowest-determinant estimates; equal determinants are
/// ordered by insertion sequence.
struct CandidateHeap {
    capacity: usize,
    heap: BinaryHeap<Ranked>,
}

impl CandidateHeap {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            heap: BinaryHeap::new(),
        }
    }

    fn push(&mut self, seq: u64, estimate: McdEstimate) {
        self.heap.push(Ranked {
            log_determinant: estimate.log_determinant,
            seq,
            estimate,
        });
        if self.heap.len() > self.capacity {
            self.heap.pop();
        }
    }

    fn merge(&mut self, other: CandidateHeap) {
        for ranked in other.heap {
            self.push(ranked.seq, ranked.estimate);
        }
    }

    fn into_sorted(self) -> Vec<(u64, McdEstimate)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|r| (r.seq, r.estimate))
            .collect()
    }
}

/// Minimum Covariance Determinant estimator
#[derive(Debug, Clone, Default)]
pub struct Mcd {
    config: McdConfig,
}

impl Mcd {
    pub fn new(config: McdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &McdConfig {
        &self.config
    }

    /// Support size for `n` points in `p` dimensions. Requests outside
    /// `[ceil((n + p + 1) / 2), n]` fall back to the lower bound.
    pub fn support_size(&self, n: usize, p: usize) -> usize {
        let low = (n + p + 1).div_ceil(2).min(n);
        match self.config.h {
            None => low,
            Some(h) if (low..=n).contains(&h) => h,
            Some(h) => {
                warn!(requested = h, used = low, n, p, "MCD support size out of range, using lower bound");
                low
            }
        }
    }

    /// Estimate location and scatter of `points`
    pub fn fit(&self, points: ArrayView2<f64>) -> Result<McdEstimate> {
        self.config.parallel.install(|| self.fit_in_current_pool(points))?
    }

    pub(crate) fn fit_in_current_pool(&self, points: ArrayView2<f64>) -> Result<McdEstimate> {
        let (n, p) = points.dim();
        if n == 0 {
            return Err(AnomalyError::InvalidInput("MCD of an empty point set".to_string()));
        }
        let h = self.support_size(n, p);
        if h == n {
            return McdEstimate::from_support(points, (0..n).collect());
        }

        let base_seed = self.config.seed.unwrap_or_else(rand::random);
        let all: Vec<usize> = (0..n).collect();
        let candidates = if n <= self.config.fast_mcd_threshold {
            debug!(n, p, h, "Running MCD");
            self.initial_candidates(points, &all, h, self.config.iterations, base_seed, 0)?
        } else {
            self.fast_candidates(points, h, base_seed)?
        };

        let converged: Vec<(u64, McdEstimate)> = candidates
            .into_sorted()
            .into_par_iter()
            .map(|(seq, estimate)| self.converge(points, &all, estimate, h).map(|e| (seq, e)))
            .collect::<Result<_>>()?;

        converged
            .into_iter()
            .min_by(|a, b| {
                a.1.log_determinant
                    .total_cmp(&b.1.log_determinant)
                    .then(a.0.cmp(&b.0))
            })
            .map(|(_, estimate)| estimate)
            .ok_or_else(|| AnomalyError::ComputationError("MCD produced no candidate".to_string()))
    }

    /// One C-step over `rows`: keep the `h` rows nearest to `estimate`
    pub fn c_step(points: ArrayView2<f64>, rows: &[usize], estimate: &McdEstimate, h: usize) -> Result<McdEstimate> {
        let metric = estimate.covariance.mahalanobis()?;
        let mut ranked: Vec<(f64, usize)> = rows
            .iter()
            .map(|&r| (metric.squared_distance(points.row(r)), r))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut support: Vec<usize> = ranked.into_iter().take(h).map(|(_, r)| r).collect();
        support.sort_unstable();
        McdEstimate::from_support(points, support)
    }

    /// Repeat C-steps until the determinant stops decreasing
    fn converge(&self, points: ArrayView2<f64>, rows: &[usize], start: McdEstimate, h: usize) -> Result<McdEstimate> {
        let mut current = start;
        for _ in 0..self.config.max_c_steps {
            if current.log_determinant == f64::NEG_INFINITY {
                break;
            }
            let next = Self::c_step(points, rows, &current, h)?;
            if next.log_determinant >= current.log_determinant {
                break;
            }
            current = next;
        }
        Ok(current)
    }

    /// Random seeds refined by two C-steps, split across workers
    fn initial_candidates(
        &self,
        points: ArrayView2<f64>,
        rows: &[usize],
        h: usize,
        runs: usize,
        seed: u64,
        seq_base: u64,
    ) -> Result<CandidateHeap> {
        let workers = self.config.parallel.num_threads();
        let constant = has_constant_dimension(points, rows);
        let shares = split_ranges(runs.max(1), workers);

        let heaps: Vec<CandidateHeap> = shares
            .into_par_iter()
            .enumerate()
            .map(|(worker, share)| {
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(worker as u64));
                let mut heap = CandidateHeap::new(self.config.candidates);
                for run in share {
                    let start = seed_estimate(points, rows, constant, &mut rng)?;
                    let once = Self::c_step(points, rows, &start, h)?;
                    let twice = Self::c_step(points, rows, &once, h)?;
                    heap.push(seq_base + run as u64, twice);
                }
                Ok(heap)
            })
            .collect::<Result<_>>()?;

        let mut merged = CandidateHeap::new(self.config.candidates);
        for heap in heaps {
            merged.merge(heap);
        }
        Ok(merged)
    }

    fn fast_candidates(&self, points: ArrayView2<f64>, h: usize, seed: u64) -> Result<CandidateHeap> {
        let n = points.nrows();
        let n_subsets = (n / self.config.subset_size.max(1)).clamp(1, self.config.subset_count.max(1));
        let subset_len = (n / n_subsets).min(self.config.subset_size.max(1));

        let mut shuffled: Vec<usize> = (0..n).collect();
        shuffled.shuffle(&mut Xoshiro256PlusPlus::seed_from_u64(seed));
        let subsets: Vec<Vec<usize>> = shuffled
            .chunks(subset_len)
            .take(n_subsets)
            .map(|c| c.to_vec())
            .collect();
        debug!(n, n_subsets, subset_len, "Running fastMCD");

        let runs = (self.config.iterations / n_subsets).max(1);
        let mut pooled = CandidateHeap::new(self.config.candidates * n_subsets);
        for (s, rows) in subsets.iter().enumerate() {
            let h_sub = scaled_support(rows.len(), h, n);
            let stage_seed = seed.wrapping_add(((s as u64) + 1) << 32);
            pooled.merge(self.initial_candidates(points, rows, h_sub, runs, stage_seed, (s * runs) as u64)?);
        }

        let merged: Vec<usize> = subsets.concat();
        let h_merged = scaled_support(merged.len(), h, n);
        debug!(merged = merged.len(), h_merged, "Refining fastMCD candidates on merged subset");

        let refined: Vec<(u64, McdEstimate)> = pooled
            .into_sorted()
            .into_par_iter()
            .map(|(seq, estimate)| {
                let once = Self::c_step(points, &merged, &estimate, h_merged)?;
                Self::c_step(points, &merged, &once, h_merged).map(|e| (seq, e))
            })
            .collect::<Result<_>>()?;

        let mut best = CandidateHeap::new(self.config.candidates);
        for (seq, estimate) in refined {
            best.push(seq, estimate);
        }
        Ok(best)
    }
}

/// `ceil(len * h / n)`, at least `min(len, 1)`
fn scaled_support(len: usize, h: usize, n: usize) -> usize {
    (len * h).div_ceil(n.max(1)).clamp(len.min(1), len)
}

fn has_constant_dimension(points: ArrayView2<f64>, rows: &[usize]) -> bool {
    let Some(&first) = rows.first() else {
        return false;
    };
    (0..points.ncols()).any(|j| {
        let v = points[[first, j]];
        rows.iter().all(|&r| points[[r, j]] == v)
    })
}

/// Covariance of `p + 1` random rows, grown one random row at a time until
/// it is non-singular. Data with a constant dimension gets the minimal
/// ridge instead.
fn seed_estimate<R: Rng>(points: ArrayView2<f64>, rows: &[usize], constant: bool, rng: &mut R) -> Result<McdEstimate> {
    let m = rows.len();
    let p = points.ncols();
    let mut taken = vec![false; m];
    let mut chosen: Vec<usize> = Vec::with_capacity(p + 1);
    for pos in index::sample(rng, m, (p + 1).min(m)) {
        taken[pos] = true;
        chosen.push(rows[pos]);
    }

    let mut covariance = CovarianceMatrix::from_points(points.select(Axis(0), &chosen).view())?;
    if constant {
        covariance.add_minimum();
    } else {
        while covariance.log_determinant() == f64::NEG_INFINITY {
            if chosen.len() == m {
                covariance.add_minimum();
                break;
            }
            let mut pos = rng.gen_range(0..m);
            while taken[pos] {
                pos = rng.gen_range(0..m);
            }
            taken[pos] = true;
            chosen.push(rows[pos]);
            covariance = CovarianceMatrix::from_points(points.select(Axis(0), &chosen).view())?;
        }
    }

    Ok(McdEstimate {
        log_determinant: covariance.log_determinant(),
        covariance,
        support: chosen,
    })
}
