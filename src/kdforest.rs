//! Tree-partitioning index: a forest of randomized kd-trees.
//!
//! Each tree splits on a dimension drawn at random from the highest-variance
//! dimensions of a node sample, so the trees decorrelate and miss different
//! neighbors. One search descends every tree, then keeps popping the
//! globally closest unexplored branch off a shared queue until the `checks`
//! budget runs out.
//!
//! Branch lower bounds accumulate squared coordinate differences, which is
//! only a valid bound for the L2 metric; for other metrics the forest
//! explores in heuristic order and relies on the checks budget alone.

use std::collections::BinaryHeap;
use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::DistanceMetric;
use crate::error::{AmbitError, Result};
use crate::index::{EnsembleParams, PartitioningIndex, SearchParams};
use crate::matrix::Matrix;
use crate::persist::{
    self, decode_metric, encode_metric, read_params, write_params, PersistError, PersistResult,
    KD_FOREST_MAGIC,
};
use crate::points::PointSet;
use crate::random::UniqueRandom;
use crate::result::KnnResultSet;

/// Leaf capacity before a node is split.
const MAX_LEAF_POINTS: usize = 8;
/// Points sampled when estimating per-dimension mean and variance.
const SPLIT_SAMPLE: usize = 100;
/// The split dimension is drawn among this many top-variance dimensions.
const DIM_CANDIDATES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
enum KdNode {
    Leaf {
        indices: Vec<usize>,
    },
    Split {
        dim: usize,
        value: f32,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

/// Randomized kd-forest index.
#[derive(Debug, Clone)]
pub struct KdForestIndex {
    points: PointSet,
    metric: DistanceMetric,
    params: EnsembleParams,
    trees: Vec<KdNode>,
    built_size: usize,
    built: bool,
}

/// Discarded branch with its accumulated lower bound. Min-heap ordering.
struct Branch<'a> {
    mindist: f32,
    node: &'a KdNode,
}

impl PartialEq for Branch<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.mindist == other.mindist
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
        other.mindist.total_cmp(&self.mindist)
    }
}

impl KdForestIndex {
    /// Create an empty index to be populated later.
    pub fn new(veclen: usize, metric: DistanceMetric, params: EnsembleParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            points: PointSet::new(veclen)?,
            metric,
            params,
            trees: Vec::new(),
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
            trees: Vec::new(),
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

    fn build_node(&self, indices: Vec<usize>, rng: &mut StdRng) -> KdNode {
        if indices.len() <= MAX_LEAF_POINTS {
            return KdNode::Leaf { indices };
        }

        let veclen = self.points.veclen();
        let sample = &indices[..indices.len().min(SPLIT_SAMPLE)];

        let mut mean = vec![0.0f32; veclen];
        for &i in sample {
            for (m, &v) in mean.iter_mut().zip(self.points.get(i)) {
                *m += v;
            }
        }
        let n = sample.len() as f32;
        for m in mean.iter_mut() {
            *m /= n;
        }

        let mut var = vec![0.0f32; veclen];
        for &i in sample {
            for ((v, &x), &m) in var.iter_mut().zip(self.points.get(i)).zip(&mean) {
                let d = x - m;
                *v += d * d;
            }
        }

        let mut dims: Vec<usize> = (0..veclen).collect();
        dims.sort_unstable_by(|&a, &b| var[b].total_cmp(&var[a]));

        // Draw the split dimension among the top-variance candidates, then
        // fall back through the remaining dimensions if the chosen one is
        // constant across the node.
        let candidates = DIM_CANDIDATES.min(veclen);
        let pick = rng.random_range(0..candidates);
        dims.swap(0, pick);

        for &dim in &dims {
            let (min, max) = indices.iter().fold(
                (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), &i| {
                    let v = self.points.get(i)[dim];
                    (lo.min(v), hi.max(v))
                },
            );
            if min >= max {
                continue;
            }
            let mut value = mean[dim];
            if value <= min || value > max {
                value = min + (max - min) * 0.5;
            }
            let (left, right): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .partition(|&&i| self.points.get(i)[dim] < value);
            if left.is_empty() || right.is_empty() {
                continue;
            }
            return KdNode::Split {
                dim,
                value,
                left: Box::new(self.build_node(left, rng)),
                right: Box::new(self.build_node(right, rng)),
            };
        }

        // Every dimension is constant: the points are identical.
        KdNode::Leaf { indices }
    }

    /// Descend to one leaf, queueing the far side of every split crossed.
    #[allow(clippy::too_many_arguments)]
    fn descend<'a>(
        &'a self,
        mut node: &'a KdNode,
        query: &[f32],
        mindist: f32,
        result: &mut KnnResultSet,
        heap: &mut BinaryHeap<Branch<'a>>,
        visited: &mut [bool],
        checks: &mut usize,
    ) {
        loop {
            match node {
                KdNode::Leaf { indices } => {
                    for &i in indices {
                        if visited[i] || self.points.is_removed(i) {
                            continue;
                        }
                        visited[i] = true;
                        result.push(i, self.metric.distance(self.points.get(i), query));
                        *checks += 1;
                    }
                    return;
                }
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let diff = query[*dim] - value;
                    let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                    // the near cell keeps the parent bound
                    heap.push(Branch {
                        mindist: mindist + diff * diff,
                        node: far,
                    });
                    node = near;
                }
            }
        }
    }

    fn node_memory(node: &KdNode) -> usize {
        match node {
            KdNode::Leaf { indices } => {
                std::mem::size_of::<KdNode>() + indices.len() * std::mem::size_of::<usize>()
            }
            KdNode::Split { left, right, .. } => {
                std::mem::size_of::<KdNode>() + Self::node_memory(left) + Self::node_memory(right)
            }
        }
    }

    fn write_node(w: &mut dyn Write, node: &KdNode) -> PersistResult<()> {
        match node {
            KdNode::Leaf { indices } => {
                persist::write_u8(w, 0)?;
                persist::write_usize_slice(w, indices)?;
            }
            KdNode::Split {
                dim,
                value,
                left,
                right,
            } => {
                persist::write_u8(w, 1)?;
                persist::write_usize(w, *dim)?;
                persist::write_f32(w, *value)?;
                Self::write_node(w, left)?;
                Self::write_node(w, right)?;
            }
        }
        Ok(())
    }

    fn read_node(r: &mut dyn Read, veclen: usize) -> PersistResult<KdNode> {
        match persist::read_u8(r)? {
            0 => Ok(KdNode::Leaf {
                indices: persist::read_usize_vec(r)?,
            }),
            1 => {
                let dim = persist::read_usize(r)?;
                if dim >= veclen {
                    return Err(PersistError::Format(format!(
                        "split dimension {dim} out of range for {veclen}-dimensional points"
                    )));
                }
                let value = persist::read_f32(r)?;
                let left = Self::read_node(r, veclen)?;
                let right = Self::read_node(r, veclen)?;
                Ok(KdNode::Split {
                    dim,
                    value,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            tag => Err(PersistError::Format(format!("invalid node tag {tag}"))),
        }
    }

    /// Parse a complete index from a stream. Nothing is observable until the
    /// whole block parsed cleanly.
    pub(crate) fn read_from(r: &mut dyn Read) -> PersistResult<Self> {
        persist::check_magic(r, &KD_FOREST_MAGIC, "kd-forest")?;
        let metric = decode_metric(persist::read_u8(r)?)?;
        let params = read_params(r)?;
        let built = persist::read_u8(r)? != 0;
        let built_size = persist::read_usize(r)?;
        let points = PointSet::read_from(r)?;
        let tree_count = persist::read_u32(r)? as usize;
        let mut trees = Vec::with_capacity(tree_count.min(1 << 10));
        for _ in 0..tree_count {
            trees.push(Self::read_node(r, points.veclen())?);
        }
        if built && trees.is_empty() {
            return Err(PersistError::Format(
                "index marked built but carries no trees".to_string(),
            ));
        }
        Ok(Self {
            points,
            metric,
            params,
            trees,
            built_size,
            built,
        })
    }
}

impl PartitioningIndex for KdForestIndex {
    fn build(&mut self) -> Result<()> {
        if self.points.len() == 0 {
            return Err(AmbitError::EmptyIndex);
        }
        let mut rng = self.make_rng();
        let mut trees = Vec::with_capacity(self.params.trees);
        for _ in 0..self.params.trees {
            // independent per-tree insertion order, so equal-variance ties
            // resolve differently across trees
            let order = UniqueRandom::with_seed(self.points.slots(), rng.random());
            let indices: Vec<usize> = order.filter(|&i| !self.points.is_removed(i)).collect();
            trees.push(self.build_node(indices, &mut rng));
        }
        self.trees = trees;
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
                "kd-forest grew past rebuild threshold, rebuilding over {} points",
                self.points.len()
            );
            return self.build();
        }
        for i in range {
            for t in 0..self.trees.len() {
                insert_point(&mut self.trees[t], self.points.get(i), i);
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

        let mut heap = BinaryHeap::new();
        let mut visited = vec![false; self.points.slots()];
        let mut checks = 0usize;
        let prunable = self.metric == DistanceMetric::L2;

        for tree in &self.trees {
            self.descend(tree, query, 0.0, result, &mut heap, &mut visited, &mut checks);
        }
        while let Some(branch) = heap.pop() {
            if checks >= params.checks && result.is_full() {
                break;
            }
            if prunable
                && result.is_full()
                && branch.mindist >= result.worst_dist() / (1.0 + params.eps)
            {
                continue;
            }
            self.descend(
                branch.node,
                query,
                branch.mindist,
                result,
                &mut heap,
                &mut visited,
                &mut checks,
            );
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
        self.points.memory_bytes() + self.trees.iter().map(Self::node_memory).sum::<usize>()
    }

    fn save(&self, writer: &mut dyn Write) -> PersistResult<()> {
        persist::write_magic(writer, &KD_FOREST_MAGIC)?;
        persist::write_u8(writer, encode_metric(self.metric))?;
        write_params(writer, &self.params)?;
        persist::write_u8(writer, u8::from(self.built))?;
        persist::write_usize(writer, self.built_size)?;
        self.points.write_to(writer)?;
        persist::write_u32(writer, self.trees.len() as u32)?;
        for tree in &self.trees {
            Self::write_node(writer, tree)?;
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read) -> PersistResult<()> {
        *self = Self::read_from(reader)?;
        Ok(())
    }
}

/// Route the point down every split to its leaf.
fn insert_point(node: &mut KdNode, point: &[f32], index: usize) {
    match node {
        KdNode::Leaf { indices } => indices.push(index),
        KdNode::Split {
            dim,
            value,
            left,
            right,
        } => {
            if point[*dim] < *value {
                insert_point(left, point, index);
            } else {
                insert_point(right, point, index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ground_truth::find_nearest;

    fn random_data(n: usize, dim: usize, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows: Vec<Vec<f32>> = (0..n)
            .map(|_| (0..dim).map(|_| rng.random::<f32>() * 10.0).collect())
            .collect();
        Matrix::from_rows(&rows).unwrap()
    }

    fn params() -> EnsembleParams {
        EnsembleParams::default().with_seed(11)
    }

    #[test]
    fn build_requires_data() {
        let mut index = KdForestIndex::new(4, DistanceMetric::L2, params()).unwrap();
        assert_eq!(index.build().unwrap_err(), AmbitError::EmptyIndex);
    }

    #[test]
    fn exhaustive_search_is_exact() {
        let data = random_data(300, 6, 21);
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();

        for qi in [3, 150, 299] {
            let query = data.row(qi);
            let mut result = KnnResultSet::new(7);
            index
                .find_neighbors(&mut result, query, &SearchParams::exhaustive())
                .unwrap();
            let exact = find_nearest(&data, query, 7, 0, DistanceMetric::L2).unwrap();
            assert_eq!(result.indices(), exact);
        }
    }

    #[test]
    fn bounded_checks_still_finds_close_neighbors() {
        let data = random_data(500, 4, 33);
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();

        let query = data.row(42);
        let mut result = KnnResultSet::new(1);
        index
            .find_neighbors(
                &mut result,
                query,
                &SearchParams {
                    checks: 64,
                    eps: 0.0,
                },
            )
            .unwrap();
        // the query is itself indexed; its leaf is always reached
        assert_eq!(result.neighbors()[0].index, 42);
    }

    #[test]
    fn removed_points_never_returned() {
        let data = random_data(120, 4, 5);
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();
        index.remove_point(60).unwrap();

        let mut result = KnnResultSet::new(120);
        index
            .find_neighbors(&mut result, data.row(60), &SearchParams::exhaustive())
            .unwrap();
        assert!(!result.indices().contains(&60));
        assert_eq!(
            index.remove_point(60).unwrap_err(),
            AmbitError::PointNotFound(60)
        );
    }

    #[test]
    fn add_points_rebuild_threshold() {
        let data = random_data(50, 4, 6);
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();

        // small growth inserts into existing trees
        let extra = random_data(5, 4, 7);
        index.add_points(&extra, 2.0).unwrap();
        assert_eq!(index.size(), 55);

        // large growth rebuilds
        let bulk = random_data(100, 4, 8);
        index.add_points(&bulk, 2.0).unwrap();
        assert_eq!(index.size(), 155);

        let query = bulk.row(99);
        let mut result = KnnResultSet::new(1);
        index
            .find_neighbors(&mut result, query, &SearchParams::exhaustive())
            .unwrap();
        assert_eq!(result.neighbors()[0].index, 154);
    }

    #[test]
    fn forest_has_requested_tree_count() {
        let data = random_data(100, 4, 9);
        let p = EnsembleParams {
            trees: 7,
            ..params()
        };
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, p).unwrap();
        index.build().unwrap();
        assert_eq!(index.trees.len(), 7);
    }

    #[test]
    fn identical_points_build_terminates() {
        let data = Matrix::from_rows(&vec![vec![2.0, 2.0]; 40]).unwrap();
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();

        let mut result = KnnResultSet::new(5);
        index
            .find_neighbors(&mut result, &[2.0, 2.0], &SearchParams::exhaustive())
            .unwrap();
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn save_load_round_trip() {
        let data = random_data(80, 5, 10);
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();
        index.remove_point(3).unwrap();

        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();

        let mut loaded = KdForestIndex::new(5, DistanceMetric::L2, params()).unwrap();
        loaded.load(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(loaded.size(), index.size());
        assert_eq!(loaded.trees, index.trees);

        let query = data.row(40);
        let mut a = KnnResultSet::new(5);
        let mut b = KnnResultSet::new(5);
        index
            .find_neighbors(&mut a, query, &SearchParams::exhaustive())
            .unwrap();
        loaded
            .find_neighbors(&mut b, query, &SearchParams::exhaustive())
            .unwrap();
        assert_eq!(a.indices(), b.indices());
    }

    #[test]
    fn truncated_stream_fails_cleanly() {
        let data = random_data(30, 4, 12);
        let mut index = KdForestIndex::with_data(&data, DistanceMetric::L2, params()).unwrap();
        index.build().unwrap();

        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);

        let mut target = KdForestIndex::new(4, DistanceMetric::L2, params()).unwrap();
        assert!(target.load(&mut std::io::Cursor::new(buf)).is_err());
        // target untouched by the failed load
        assert_eq!(target.size(), 0);
        assert!(!target.is_built());
    }
}
