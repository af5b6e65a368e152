//! Incremental k-nearest-neighbor collection
//!
//! Each point keeps an ascending list of at most `k` neighbors plus a side
//! list of points lying exactly at its current k-distance. The union of both
//! lists is the tie-inclusive k-neighborhood used by LOF-style algorithms:
//! every point at or within the k-th smallest distance belongs to it.

use serde::{Deserialize, Serialize};

use crate::error::{AnomalyError, Result};

/// A single neighbor entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Index of the neighbor point
    pub index: usize,
    /// Distance to the neighbor
    pub distance: f64,
}

/// Sorted neighbor list of one point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborList {
    neighbors: Vec<Neighbor>,
    ties: Vec<usize>,
}

impl NeighborList {
    fn with_capacity(k: usize) -> Self {
        Self {
            neighbors: Vec::with_capacity(k),
            ties: Vec::new(),
        }
    }

    /// Neighbors in ascending distance order
    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    /// Points tied with the current k-distance but not stored in
    /// [`neighbors`](Self::neighbors)
    pub fn ties(&self) -> &[usize] {
        &self.ties
    }

    /// Number of stored neighbors
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Distance to the farthest stored neighbor, 0 when empty
    pub fn k_distance(&self) -> f64 {
        self.neighbors.last().map_or(0.0, |n| n.distance)
    }

    /// Offer `other` at `distance` to this list with capacity `k`.
    pub(crate) fn offer(&mut self, k: usize, other: usize, distance: f64) {
        let count = self.neighbors.len();
        if count == 0 {
            self.neighbors.push(Neighbor { index: other, distance });
            return;
        }

        let max = self.neighbors[count - 1].distance;
        if count >= k {
            if distance > max {
                return;
            }
            if distance == max {
                self.ties.push(other);
                return;
            }
            // A strictly closer point evicts the current maximum.
            if count > 1 && self.neighbors[count - 2].distance == max {
                self.ties.push(self.neighbors[count - 1].index);
            } else {
                self.ties.clear();
            }
            self.neighbors.pop();
        }

        let pos = self.neighbors.partition_point(|n| n.distance <= distance);
        self.neighbors.insert(pos, Neighbor { index: other, distance });
    }

    /// Drop stored neighbors beyond `k`, one at a time, keeping the tie list
    /// consistent with the new k-distance.
    fn truncate(&mut self, k: usize) {
        while self.neighbors.len() > k {
            let removed = match self.neighbors.pop() {
                Some(n) => n,
                None => return,
            };
            match self.neighbors.last() {
                Some(last) if last.distance == removed.distance => self.ties.push(removed.index),
                _ => self.ties.clear(),
            }
        }
    }
}

/// Per-point sorted top-k neighbor structure with duplicate weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnCollection {
    k: usize,
    weight: Vec<usize>,
    lists: Vec<NeighborList>,
    generation: u64,
}

impl KnnCollection {
    /// Create an empty collection for `weight.len()` points with capacity `k`
    pub fn new(k: usize, weight: Vec<usize>) -> Self {
        let lists = (0..weight.len()).map(|_| NeighborList::with_capacity(k)).collect();
        Self {
            k,
            weight,
            lists,
            generation: 0,
        }
    }

    /// Create an empty collection where every point has weight one
    pub fn unweighted(k: usize, n: usize) -> Self {
        Self::new(k, vec![1; n])
    }

    pub(crate) fn from_parts(k: usize, weight: Vec<usize>, lists: Vec<NeighborList>) -> Self {
        Self {
            k,
            weight,
            lists,
            generation: 0,
        }
    }

    pub(crate) fn into_lists(self) -> Vec<NeighborList> {
        self.lists
    }

    pub(crate) fn lists_mut(&mut self) -> &mut [NeighborList] {
        &mut self.lists
    }

    /// Current neighborhood size
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Multiplicity of every point
    pub fn weight(&self) -> &[usize] {
        &self.weight
    }

    /// Neighbor list of point `i`
    pub fn list(&self, i: usize) -> &NeighborList {
        &self.lists[i]
    }

    /// Stored neighbors of point `i`, ascending by distance
    pub fn neighbors(&self, i: usize) -> &[Neighbor] {
        self.lists[i].neighbors()
    }

    /// Points tied with the k-distance of point `i`
    pub fn ties(&self, i: usize) -> &[usize] {
        self.lists[i].ties()
    }

    /// k-distance of point `i`
    pub fn k_distance(&self, i: usize) -> f64 {
        self.lists[i].k_distance()
    }

    /// Incremented on every destructive shrink; lets holders of scores
    /// detect that the collection has moved on since they were computed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Offer `p2` at `distance` as a neighbor of `p1`.
    ///
    /// Only `p1`'s view is updated; an undirected computation calls this for
    /// both directions.
    pub fn update_nearest_neighbors(&mut self, p1: usize, p2: usize, distance: f64) {
        if p1 == p2 {
            return;
        }
        let k = self.k;
        self.lists[p1].offer(k, p2, distance);
    }

    /// Reduce k by one, dropping every point's farthest stored neighbor.
    pub fn shrink(&mut self) -> Result<()> {
        self.shrink_by(1)
    }

    /// Reduce k by `step`. A step that would leave k at zero is rejected.
    pub fn shrink_by(&mut self, step: usize) -> Result<()> {
        if step == 0 {
            return Ok(());
        }
        if step >= self.k {
            return Err(AnomalyError::ShrinkExceedsK { requested: step, k: self.k });
        }
        for _ in 0..step {
            self.k -= 1;
            let k = self.k;
            for list in &mut self.lists {
                list.truncate(k);
            }
        }
        self.generation += 1;
        Ok(())
    }

    /// Deep copy; alias of [`Clone::clone`] kept for readability at call
    /// sites that are about to shrink the copy.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}
