//! # Similarity Index
//!
//! K-nearest-neighbour search over a vector [`Snapshot`], under Euclidean
//! distance or cosine similarity.
//!
//! Two interchangeable strategies implement [`NeighborSearch`]:
//!
//! - [`ExactSearch`]: scores every row (in parallel with rayon).
//! - [`VpTree`]: a vantage-point tree built once per snapshot generation.
//!   Cosine trees are built over unit-normalised rows, where Euclidean order
//!   equals cosine order. The tree only narrows the candidate set; the final
//!   ranking is computed with the same scoring as the exact strategy, so both
//!   return the same results.
//!
//! Results are ordered best first (ascending distance, descending
//! similarity), ties broken by ascending track id, and never include the
//! excluded (query) track.

use crate::error::{EngineError, EngineResult};
use crate::features::l2_norm;
use crate::vector_store::Snapshot;
use clap::ValueEnum;
use log::{debug, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, PoisonError, RwLock};

/// Slack applied to tree pruning so float error never drops a true
/// neighbour.
const PRUNE_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    #[default]
    Cosine,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Exact,
    Approximate,
    /// Exact below the configured catalog size, tree above it.
    #[default]
    Auto,
}

/// One search hit. `score` is a distance for [`Metric::Euclidean`] and a
/// similarity for [`Metric::Cosine`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub track_id: String,
    pub score: f32,
}

/// A nearest-neighbour strategy over one snapshot.
pub trait NeighborSearch {
    /// Up to `k` nearest rows to `query`, skipping the row whose id equals
    /// `exclude`.
    ///
    /// # Errors
    ///
    /// [`EngineError::IndexUnavailable`] on an empty snapshot,
    /// [`EngineError::DimensionMismatch`] when `query` has the wrong length.
    fn search(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        exclude: Option<&str>,
    ) -> EngineResult<Vec<Neighbor>>;
}

/// f32 with a total order, for heaps and sorting.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Distance(f32);

impl Eq for Distance {}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A validated query.
struct Query<'a> {
    values: &'a [f32],
    norm: f32,
}

/// Check the snapshot and query. `Ok(None)` means the query can have no
/// result (zero or non-finite vector under cosine, non-finite values).
fn prepare<'a>(metric: Metric, snapshot: &Snapshot, query: &'a [f32]) -> EngineResult<Option<Query<'a>>> {
    if snapshot.is_empty() {
        return Err(EngineError::IndexUnavailable);
    }
    if query.len() != snapshot.dimension() {
        return Err(EngineError::DimensionMismatch {
            expected: snapshot.dimension(),
            got: query.len(),
        });
    }

    let norm = l2_norm(query);
    if !norm.is_finite() || (metric == Metric::Cosine && norm <= 0.0) {
        trace!("Query vector has no usable norm; no results");
        return Ok(None);
    }
    Ok(Some(Query { values: query, norm }))
}

/// Ranking key of `row`, smaller is better, with the reported score.
/// `None` when the row cannot be ranked (zero norm under cosine).
fn rank(metric: Metric, snapshot: &Snapshot, query: &Query<'_>, row: usize) -> Option<(f32, f32)> {
    let stored = snapshot.row(row);
    let (key, score) = match metric {
        Metric::Euclidean => {
            let distance = euclidean(query.values, stored);
            (distance, distance)
        }
        Metric::Cosine => {
            let norm = snapshot.norm(row);
            if norm <= 0.0 {
                return None;
            }
            let similarity = dot(query.values, stored) / (query.norm * norm);
            (-similarity, similarity)
        }
    };
    key.is_finite().then_some((key, score))
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn by_key_then_id(snapshot: &Snapshot) -> impl Fn(&(f32, f32, usize), &(f32, f32, usize)) -> Ordering + '_ {
    move |a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| snapshot.id(a.2).cmp(snapshot.id(b.2)))
    }
}

/// Keep the best `wanted` of `scored`, then drop `exclude` and cut to `k`.
fn finish(
    snapshot: &Snapshot,
    mut scored: Vec<(f32, f32, usize)>,
    k: usize,
    exclude: Option<&str>,
) -> Vec<Neighbor> {
    let wanted = k.saturating_add(1);
    let order = by_key_then_id(snapshot);
    if scored.len() > wanted {
        scored.select_nth_unstable_by(wanted - 1, &order);
        scored.truncate(wanted);
    }
    scored.sort_unstable_by(&order);

    scored
        .into_iter()
        .filter(|&(_, _, row)| Some(snapshot.id(row)) != exclude)
        .take(k)
        .map(|(_, score, row)| Neighbor {
            track_id: snapshot.id(row).to_string(),
            score,
        })
        .collect()
}

/// Brute-force scan of every row.
#[derive(Debug, Clone, Copy)]
pub struct ExactSearch {
    pub metric: Metric,
}

impl NeighborSearch for ExactSearch {
    fn search(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        exclude: Option<&str>,
    ) -> EngineResult<Vec<Neighbor>> {
        let Some(query) = prepare(self.metric, snapshot, query)? else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let scored: Vec<(f32, f32, usize)> = (0..snapshot.len())
            .into_par_iter()
            .filter_map(|row| rank(self.metric, snapshot, &query, row).map(|(key, score)| (key, score, row)))
            .collect();

        Ok(finish(snapshot, scored, k, exclude))
    }
}

#[derive(Debug, Clone)]
struct VpNode {
    row: usize,
    radius: f32,
    inside: Option<usize>,
    outside: Option<usize>,
}

/// Vantage-point tree over one snapshot generation.
#[derive(Debug)]
pub struct VpTree {
    metric: Metric,
    generation: u64,
    dimension: usize,
    /// Tree-space points indexed by snapshot row. Rows that cannot be ranked
    /// are left out of the tree.
    points: Vec<f32>,
    nodes: Vec<VpNode>,
    root: Option<usize>,
}

impl VpTree {
    pub fn build(metric: Metric, snapshot: &Snapshot) -> Self {
        let dimension = snapshot.dimension();
        let mut points = Vec::with_capacity(snapshot.len() * dimension);
        let mut rows = Vec::with_capacity(snapshot.len());

        for row in 0..snapshot.len() {
            let values = snapshot.row(row);
            let norm = snapshot.norm(row);
            let usable = norm.is_finite() && (metric == Metric::Euclidean || norm > 0.0);
            match metric {
                Metric::Euclidean => points.extend_from_slice(values),
                Metric::Cosine if usable => points.extend(values.iter().map(|v| v / norm)),
                Metric::Cosine => points.extend(std::iter::repeat(0.0).take(dimension)),
            }
            if usable {
                rows.push(row);
            }
        }

        let mut tree = Self {
            metric,
            generation: snapshot.generation(),
            dimension,
            points,
            nodes: Vec::with_capacity(rows.len()),
            root: None,
        };
        tree.root = tree.build_node(rows);
        debug!(
            "Built {:?} vantage-point tree over {} rows (generation {})",
            metric,
            tree.nodes.len(),
            tree.generation
        );
        tree
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn point(&self, row: usize) -> &[f32] {
        let start = row * self.dimension;
        &self.points[start..start + self.dimension]
    }

    fn build_node(&mut self, mut rows: Vec<usize>) -> Option<usize> {
        let vantage = rows.pop()?;
        let idx = self.nodes.len();
        self.nodes.push(VpNode {
            row: vantage,
            radius: 0.0,
            inside: None,
            outside: None,
        });
        if rows.is_empty() {
            return Some(idx);
        }

        let mut by_distance: Vec<(f32, usize)> = rows
            .into_iter()
            .map(|row| (euclidean(self.point(vantage), self.point(row)), row))
            .collect();
        let mid = (by_distance.len() - 1) / 2;
        by_distance.select_nth_unstable_by(mid, |a, b| a.0.total_cmp(&b.0));
        let radius = by_distance[mid].0;

        let outside: Vec<usize> = by_distance[mid + 1..].iter().map(|&(_, row)| row).collect();
        by_distance.truncate(mid + 1);
        let inside: Vec<usize> = by_distance.into_iter().map(|(_, row)| row).collect();

        let inside = self.build_node(inside);
        let outside = self.build_node(outside);
        let node = &mut self.nodes[idx];
        node.radius = radius;
        node.inside = inside;
        node.outside = outside;
        Some(idx)
    }

    /// Collect every row that may be among the `wanted` nearest to `target`.
    fn collect(
        &self,
        node: Option<usize>,
        target: &[f32],
        wanted: usize,
        best: &mut BinaryHeap<Distance>,
        candidates: &mut Vec<usize>,
    ) {
        let Some(idx) = node else {
            return;
        };
        let node = &self.nodes[idx];
        let distance = euclidean(target, self.point(node.row));

        if distance <= tau(best, wanted) + PRUNE_EPSILON {
            candidates.push(node.row);
            best.push(Distance(distance));
            if best.len() > wanted {
                best.pop();
            }
        }

        if distance < node.radius {
            self.collect(node.inside, target, wanted, best, candidates);
            if distance + tau(best, wanted) + PRUNE_EPSILON >= node.radius {
                self.collect(node.outside, target, wanted, best, candidates);
            }
        } else {
            self.collect(node.outside, target, wanted, best, candidates);
            if distance - tau(best, wanted) - PRUNE_EPSILON <= node.radius {
                self.collect(node.inside, target, wanted, best, candidates);
            }
        }
    }
}

/// Current pruning radius: distance of the worst kept neighbour, or infinity
/// while fewer than `wanted` have been seen.
fn tau(best: &BinaryHeap<Distance>, wanted: usize) -> f32 {
    if best.len() < wanted {
        f32::INFINITY
    } else {
        best.peek().map_or(f32::INFINITY, |d| d.0)
    }
}

impl NeighborSearch for VpTree {
    fn search(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        exclude: Option<&str>,
    ) -> EngineResult<Vec<Neighbor>> {
        let Some(query) = prepare(self.metric, snapshot, query)? else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if snapshot.generation() != self.generation {
            // Stale tree: answer exactly rather than from the wrong rows.
            return ExactSearch { metric: self.metric }.search(snapshot, query.values, k, exclude);
        }

        let target: Vec<f32> = match self.metric {
            Metric::Euclidean => query.values.to_vec(),
            Metric::Cosine => query.values.iter().map(|v| v / query.norm).collect(),
        };

        // The excluded row may take one slot.
        let wanted = k.min(snapshot.len()) + 1;
        let mut best = BinaryHeap::with_capacity(wanted + 1);
        let mut candidates = Vec::new();
        self.collect(self.root, &target, wanted, &mut best, &mut candidates);
        trace!("Tree search visited {} candidates for k={k}", candidates.len());

        let scored = candidates
            .into_iter()
            .filter_map(|row| rank(self.metric, snapshot, &query, row).map(|(key, score)| (key, score, row)))
            .collect();
        Ok(finish(snapshot, scored, k, exclude))
    }
}

/// Strategy selection plus a per-generation tree cache.
#[derive(Debug)]
pub struct SimilarityIndex {
    metric: Metric,
    strategy: SearchStrategy,
    approximate_threshold: usize,
    tree: RwLock<Option<Arc<VpTree>>>,
}

impl SimilarityIndex {
    pub fn new(metric: Metric, strategy: SearchStrategy, approximate_threshold: usize) -> Self {
        Self {
            metric,
            strategy,
            approximate_threshold,
            tree: RwLock::new(None),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn strategy(&self) -> SearchStrategy {
        self.strategy
    }

    /// Whether searches on `snapshot` go through the tree.
    pub fn uses_tree(&self, snapshot: &Snapshot) -> bool {
        match self.strategy {
            SearchStrategy::Exact => false,
            SearchStrategy::Approximate => true,
            SearchStrategy::Auto => snapshot.len() >= self.approximate_threshold,
        }
    }

    /// Nearest neighbours of `query` in `snapshot`.
    pub fn search(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        exclude: Option<&str>,
    ) -> EngineResult<Vec<Neighbor>> {
        if self.uses_tree(snapshot) && !snapshot.is_empty() {
            self.tree_for(snapshot).search(snapshot, query, k, exclude)
        } else {
            ExactSearch { metric: self.metric }.search(snapshot, query, k, exclude)
        }
    }

    /// Nearest neighbours of a stored track, excluding the track itself.
    pub fn search_track(&self, snapshot: &Snapshot, track_id: &str, k: usize) -> EngineResult<Vec<Neighbor>> {
        if snapshot.is_empty() {
            return Err(EngineError::IndexUnavailable);
        }
        let query = snapshot
            .embedding(track_id)
            .ok_or_else(|| EngineError::TrackNotFound(track_id.to_string()))?;
        self.search(snapshot, query, k, Some(track_id))
    }

    /// Tree for `snapshot`'s generation, building it on first use.
    pub fn tree_for(&self, snapshot: &Snapshot) -> Arc<VpTree> {
        if let Some(tree) = self.tree.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if tree.generation() == snapshot.generation() {
                return Arc::clone(tree);
            }
        }

        let tree = Arc::new(VpTree::build(self.metric, snapshot));
        let mut slot = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            // Another request built the same generation first.
            Some(existing) if existing.generation() == snapshot.generation() => Arc::clone(existing),
            _ => {
                *slot = Some(Arc::clone(&tree));
                tree
            }
        }
    }

    /// Drop the cached tree.
    pub fn invalidate(&self) {
        *self.tree.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
