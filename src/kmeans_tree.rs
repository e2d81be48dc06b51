//! Clustering-partitioning index: a hierarchical k-means tree.
//!
//! The point set is recursively partitioned by k-means into `branching`
//! clusters per node. Search is best-first over unexplored branches, with
//! `cb_index` trading cluster-boundary re-exploration against speed: branch
//! priority is the distance to the cluster center minus `cb_index` times the
//! cluster radius, so wide clusters near the query get revisited earlier.

use std::collections::BinaryHeap;
use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::distance::DistanceMetric;
use crate::error::{AmbitError, Result};
use crate::index::{CentersInit, EnsembleParams, PartitioningIndex, SearchParams};
use crate::matrix::Matrix;
use crate::persist::{
    self, decode_metric, encode_metric, read_params, write_params, PersistError, PersistResult,
    KMEANS_TREE_MAGIC,
};
use crate::points::PointSet;
use crate::random::UniqueRandom;
use crate::result::KnnResultSet;

#[derive(Debug, Clone, PartialEq)]
struct KmNode {
    center: Vec<f32>,
    /// Max distance from `center` to any member point.
    radius: f32,
    /// Interior: one child per non-empty cluster. Empty for leaves.
    children: Vec<KmNode>,
    /// Leaf: member slot indices. Empty for interior nodes.
    indices: Vec<usize>,
}

/// Hierarchical k-means tree index.
#[derive(Debug, Clone)]
pub struct KMeansTreeIndex {
    points: PointSet,
    metric: DistanceMetric,
    params: EnsembleParams,
    root: Option<KmNode>,
    /// Live size at the last full build; the rebuild threshold base.
    built_size: usize,
    built: bool,
}

/// Unexplored branch in the best-first traversal. Orders a `BinaryHeap`
/// as a min-heap on priority.
struct Branch<'a> {
    priority: f32,
    node: &'a KmNode,
}

impl PartialEq for Branch<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Branch<'_> {}

impl PartialOrd for Branch<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.priority.total_cmp(&self.priority)
    }
}

impl KMeansTreeIndex {
    /// Create an empty index to be populated later.
    pub fn new(veclen: usize, metric: DistanceMetric, params: EnsembleParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            points: PointSet::new(veclen)?,
            metric,
            params,
            root: None,
            built_size: 0,
            built: false,
        })
    }

    /// Create an index over an initial point matrix. Call
    /// [`PartitioningIndex::build`] before searching.
    pub fn with_data(data: &Matrix, metric: DistanceMetric, params: EnsembleParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            points: PointSet::from_matrix(data)?,
            metric,
            params,
            root: None,
            built_size: 0,
            built: false,
        })
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn params(&self) -> &EnsembleParams {
        &self.params
    }

    fn make_rng(&self) -> StdRng {
        match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rng().random()),
        }
    }

    fn centroid(&self, indices: &[usize]) -> Vec<f32> {
        let mut center = vec![0.0f32; self.points.veclen()];
        for &i in indices {
            for (c, &v) in center.iter_mut().zip(self.points.get(i)) {
                *c += v;
            }
        }
        let count = indices.len() as f32;
        for c in center.iter_mut() {
            *c /= count;
        }
        center
    }

    fn build_node(&self, indices: Vec<usize>, rng: &mut StdRng) -> KmNode {
        let center = self.centroid(&indices);
        let radius = indices
            .iter()
            .map(|&i| self.metric.distance(self.points.get(i), &center))
            .fold(0.0f32, f32::max);

        if indices.len() <= self.params.branching {
            return KmNode {
                center,
                radius,
                children: Vec::new(),
                indices,
            };
        }

        let k = self.params.branching;
        let mut centers = self.initial_centers(&indices, k, rng);
        if centers.len() < 2 {
            return KmNode {
                center,
                radius,
                children: Vec::new(),
                indices,
            };
        }

        // Lloyd refinement, bounded by the iteration cap.
        let mut assignment = vec![usize::MAX; indices.len()];
        for _ in 0..self.params.iterations.max(1) {
            let mut changed = false;
            for (slot, &idx) in indices.iter().enumerate() {
                let p = self.points.get(idx);
                let mut best = 0;
                let mut best_d = f32::INFINITY;
                for (ci, c) in centers.iter().enumerate() {
                    let d = self.metric.distance(p, c);
                    if d < best_d {
                        best_d = d;
                        best = ci;
                    }
                }
                if assignment[slot] != best {
                    assignment[slot] = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            // recompute centers; empty clusters keep their old center
            let mut sums = vec![vec![0.0f32; self.points.veclen()]; centers.len()];
            let mut counts = vec![0usize; centers.len()];
            for (slot, &idx) in indices.iter().enumerate() {
                let c = assignment[slot];
                counts[c] += 1;
                for (s, &v) in sums[c].iter_mut().zip(self.points.get(idx)) {
                    *s += v;
                }
            }
            for (ci, sum) in sums.into_iter().enumerate() {
                if counts[ci] > 0 {
                    let n = counts[ci] as f32;
                    centers[ci] = sum.into_iter().map(|v| v / n).collect();
                }
            }
        }

        let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); centers.len()];
        for (slot, &idx) in indices.iter().enumerate() {
            clusters[assignment[slot]].push(idx);
        }
        clusters.retain(|c| !c.is_empty());

        // Degenerate clustering (e.g. all points identical): stop splitting.
        if clusters.len() < 2 {
            return KmNode {
                center,
                radius,
                children: Vec::new(),
                indices,
            };
        }

        let children = clusters
            .into_iter()
            .map(|cluster| self.build_node(cluster, rng))
            .collect();

        KmNode {
            center,
            radius,
            children,
            indices: Vec::new(),
        }
    }

    fn initial_centers(&self, indices: &[usize], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let k = k.min(indices.len());
        match self.params.centers_init {
            CentersInit::Random => {
                let draw = UniqueRandom::with_seed(indices.len(), rng.random());
                draw.take(k)
                    .map(|slot| self.points.get(indices[slot]).to_vec())
                    .collect()
            }
            CentersInit::Gonzales => self.gonzales_centers(indices, k, rng),
            CentersInit::KMeansPp => self.kmeans_pp_centers(indices, k, rng),
        }
    }

    /// Farthest-point selection: each new center maximizes the distance to
    /// its nearest already-chosen center.
    fn gonzales_centers(&self, indices: &[usize], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let mut centers: Vec<Vec<f32>> = Vec::with_capacity(k);
        let first = indices[rng.random_range(0..indices.len())];
        centers.push(self.points.get(first).to_vec());

        let mut nearest: Vec<f32> = indices
            .iter()
            .map(|&i| self.metric.distance(self.points.get(i), &centers[0]))
            .collect();

        while centers.len() < k {
            let (best_slot, &best_d) = nearest
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .expect("non-empty candidate set");
            if best_d <= 0.0 {
                break; // every remaining point coincides with a center
            }
            let chosen = self.points.get(indices[best_slot]).to_vec();
            for (slot, &i) in indices.iter().enumerate() {
                let d = self.metric.distance(self.points.get(i), &chosen);
                if d < nearest[slot] {
                    nearest[slot] = d;
                }
            }
            centers.push(chosen);
        }
        centers
    }

    /// k-means++: centers sampled proportionally to squared distance from
    /// the nearest already-chosen center.
    fn kmeans_pp_centers(&self, indices: &[usize], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let mut centers: Vec<Vec<f32>> = Vec::with_capacity(k);
        let first = indices[rng.random_range(0..indices.len())];
        centers.push(self.points.get(first).to_vec());

        let mut nearest: Vec<f32> = indices
            .iter()
            .map(|&i| self.metric.distance(self.points.get(i), &centers[0]))
            .collect();

        while centers.len() < k {
            let total: f64 = nearest.iter().map(|&d| f64::from(d.max(0.0))).sum();
            if total <= 0.0 {
                break;
            }
            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen_slot = indices.len() - 1;
            for (slot, &d) in nearest.iter().enumerate() {
                cumulative += f64::from(d.max(0.0));
                if cumulative >= threshold {
                    chosen_slot = slot;
                    break;
                }
            }
            let chosen = self.points.get(indices[chosen_slot]).to_vec();
            for (slot, &i) in indices.iter().enumerate() {
                let d = self.metric.distance(self.points.get(i), &chosen);
                if d < nearest[slot] {
                    nearest[slot] = d;
                }
            }
            centers.push(chosen);
        }
        centers
    }

    /// Descend from `node` to the closest leaf, feeding leaf points to the
    /// collector and queueing every sibling branch passed on the way down.
    fn traverse<'a>(
        &'a self,
        mut node: &'a KmNode,
        query: &[f32],
        result: &mut KnnResultSet,
        heap: &mut BinaryHeap<Branch<'a>>,
        checks: &mut usize,
    ) {
        loop {
            if node.children.is_empty() {
                for &i in &node.indices {
                    if self.points.is_removed(i) {
                        continue;
                    }
                    result.push(i, self.metric.distance(self.points.get(i), query));
                    *checks += 1;
                }
                return;
            }

            let dists: SmallVec<[f32; 32]> = node
                .children
                .iter()
                .map(|child| self.metric.distance(query, &child.center))
                .collect();
            let best = dists
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);

            for (ci, child) in node.children.iter().enumerate() {
                if ci != best {
                    heap.push(Branch {
                        priority: dists[ci] - self.params.cb_index * child.radius,
                        node: child,
                    });
                }
            }
            node = &node.children[best];
        }
    }

    fn node_memory(node: &KmNode) -> usize {
        std::mem::size_of::<KmNode>()
            + node.center.len() * std::mem::size_of::<f32>()
            + node.indices.len() * std::mem::size_of::<usize>()
            + node.children.iter().map(Self::node_memory).sum::<usize>()
    }

    fn write_node(&self, w: &mut dyn Write, node: &KmNode) -> PersistResult<()> {
        persist::write_f32_slice(w, &node.center)?;
        persist::write_f32(w, node.radius)?;
        persist::write_u32(w, node.children.len() as u32)?;
        if node.children.is_empty() {
            persist::write_usize_slice(w, &node.indices)?;
        } else {
            for child in &node.children {
                self.write_node(w, child)?;
            }
        }
        Ok(())
    }

    fn read_node(r: &mut dyn Read, veclen: usize) -> PersistResult<KmNode> {
        let center = persist::read_f32_vec(r, veclen)?;
        let radius = persist::read_f32(r)?;
        let child_count = persist::read_u32(r)? as usize;
        if child_count == 0 {
            let indices = persist::read_usize_vec(r)?;
            return Ok(KmNode {
                center,
                radius,
                children: Vec::new(),
                indices,
            });
        }
        let mut children = Vec::with_capacity(child_count.min(1 << 16));
        for _ in 0..child_count {
            children.push(Self::read_node(r, veclen)?);
        }
        Ok(KmNode {
            center,
            radius,
            children,
            indices: Vec::new(),
        })
    }

    /// Parse a complete index from a stream. Nothing is observable until the
    /// whole block parsed cleanly.
    pub(crate) fn read_from(r: &mut dyn Read) -> PersistResult<Self> {
        persist::check_magic(r, &KMEANS_TREE_MAGIC, "k-means tree")?;
        let metric = decode_metric(persist::read_u8(r)?)?;
        let params = read_params(r)?;
        let built = persist::read_u8(r)? != 0;
        let built_size = persist::read_usize(r)?;
        let points = PointSet::read_from(r)?;
        let root = match persist::read_u8(r)? {
            0 => None,
            1 => Some(Self::read_node(r, points.veclen())?),
            tag => {
                return Err(PersistError::Format(format!(
                    "invalid tree presence tag {tag}"
                )))
            }
        };
        if built && root.is_none() {
            return Err(PersistError::Format(
                "index marked built but carries no tree".to_string(),
            ));
        }
        Ok(Self {
            points,
            metric,
            params,
            root,
            built_size,
            built,
        })
    }
}

impl PartitioningIndex for KMeansTreeIndex {
    fn build(&mut self) -> Result<()> {
        if self.points.len() == 0 {
            return Err(AmbitError::EmptyIndex);
        }
        let mut rng = self.make_rng();
        let indices = self.points.live_indices();
        self.root = Some(self.build_node(indices, &mut rng));
        self.built = true;
        self.built_size = self.points.len();
        Ok(())
    }

    fn add_points(&mut self, points: &Matrix, rebuild_threshold: f32) -> Result<()> {
        let range = self.points.append(points)?;
        if !self.built {
            return Ok(());
        }
        if (self.points.len() as f32) > rebuild_threshold * self.built_size as f32 {
            log::info!(
                "k-means tree grew past rebuild threshold, rebuilding over {} points",
                self.points.len()
            );
            return self.build();
        }
        let metric = self.metric;
        for i in range {
            if let Some(root) = self.root.as_mut() {
                insert_point(root, self.points.get(i), i, metric);
            }
        }
        Ok(())
    }

    fn remove_point(&mut self, index: usize) -> Result<()> {
        self.points.remove(index)
    }

    fn find_neighbors(
        &self,
        result: &mut KnnResultSet,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<()> {
        if !self.built {
            return Err(AmbitError::NotBuilt);
        }
        if query.len() != self.points.veclen() {
            return Err(AmbitError::DimensionMismatch {
                expected: self.points.veclen(),
                actual: query.len(),
            });
        }
        let root = self.root.as_ref().ok_or(AmbitError::NotBuilt)?;

        let mut heap = BinaryHeap::new();
        let mut checks = 0usize;
        // Always complete at least one full descent before the budget applies.
        self.traverse(root, query, result, &mut heap, &mut checks);
        while let Some(branch) = heap.pop() {
            if checks >= params.checks && result.is_full() {
                break;
            }
            self.traverse(branch.node, query, result, &mut heap, &mut checks);
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.points.len()
    }

    fn veclen(&self) -> usize {
        self.points.veclen()
    }

    fn used_memory(&self) -> usize {
        self.points.memory_bytes() + self.root.as_ref().map_or(0, Self::node_memory)
    }

    fn save(&self, writer: &mut dyn Write) -> PersistResult<()> {
        persist::write_magic(writer, &KMEANS_TREE_MAGIC)?;
        persist::write_u8(writer, encode_metric(self.metric))?;
        write_params(writer, &self.params)?;
        persist::write_u8(writer, u8::from(self.built))?;
        persist::write_usize(writer, self.built_size)?;
        self.points.write_to(writer)?;
        match &self.root {
            None => persist::write_u8(writer, 0)?,
            Some(root) => {
                persist::write_u8(writer, 1)?;
                self.write_node(writer, root)?;
            }
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read) -> PersistResult<()> {
        *self = Self::read_from(reader)?;
        Ok(())
    }
}

/// Descend to the nearest leaf and attach the point, widening every visited
/// node's radius on the way.
fn insert_point(node: &mut KmNode, point: &[f32], index: usize, metric: DistanceMetric) {
    let d = metric.distance(point, &node.center);
    if d > node.radius {
        node.radius = d;
    }
    if node.children.is_empty() {
        node.indices.push(index);
        return;
    }
    let best = node
        .children
        .iter()
        .enumerate()
        .min_by(|a, b| {
            metric
                .distance(point, &a.1.center)
                .total_cmp(&metric.distance(point, &b.1.center))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    insert_point(&mut node.children[best], point, index, metric);
}
