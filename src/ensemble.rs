//! Ensemble index: one k-means tree plus one randomized kd-forest over the
//! same logical point set.
//!
//! The two partitioning heuristics miss different near-neighbors, so pooling
//! their candidates recovers higher recall than either structure alone at
//! comparable cost. The ensemble delegates every mutation to both
//! sub-indexes in a fixed order (k-means tree first, then kd-forest) and
//! verifies after each mutating call that both still agree on the live point
//! count. On divergence (one sub-index applied a mutation the other
//! rejected) the ensemble marks itself inconsistent and refuses all further
//! work instead of silently serving corrupt results. There is no rollback:
//! the sub-index contract exposes no snapshot to roll back to.

use std::io::{Read, Write};

use crate::distance::DistanceMetric;
use crate::error::{AmbitError, Result};
use crate::index::{EnsembleParams, PartitioningIndex, SearchParams};
use crate::kdforest::KdForestIndex;
use crate::kmeans_tree::KMeansTreeIndex;
use crate::matrix::Matrix;
use crate::persist::{PersistError, PersistResult};
use crate::result::{KnnResultSet, Neighbor};

/// Two differently-biased partitioning indexes behind one facade.
///
/// `Clone` produces a deep, fully independent copy: the clone owns its own
/// sub-indexes, and mutating one ensemble never affects the other.
#[derive(Debug, Clone)]
pub struct EnsembleIndex {
    kmeans: KMeansTreeIndex,
    kdforest: KdForestIndex,
    poisoned: bool,
}

impl EnsembleIndex {
    /// Create an empty ensemble to be populated with
    /// [`PartitioningIndex::add_points`].
    pub fn new(veclen: usize, metric: DistanceMetric, params: EnsembleParams) -> Result<Self> {
        params.validate()?;
        let (km, kd) = Self::split_params(params);
        Ok(Self {
            kmeans: KMeansTreeIndex::new(veclen, metric, km)?,
            kdforest: KdForestIndex::new(veclen, metric, kd)?,
            poisoned: false,
        })
    }

    /// Create an ensemble over an initial point matrix; both sub-indexes see
    /// the identical matrix, so they start consistent by construction.
    pub fn with_data(data: &Matrix, metric: DistanceMetric, params: EnsembleParams) -> Result<Self> {
        params.validate()?;
        let (km, kd) = Self::split_params(params);
        Ok(Self {
            kmeans: KMeansTreeIndex::with_data(data, metric, km)?,
            kdforest: KdForestIndex::with_data(data, metric, kd)?,
            poisoned: false,
        })
    }

    /// Both sub-indexes consume the shared bag, but with distinct derived
    /// seeds so their structures stay differently biased under a fixed seed.
    fn split_params(params: EnsembleParams) -> (EnsembleParams, EnsembleParams) {
        let kd = EnsembleParams {
            seed: params.seed.map(|s| s.wrapping_add(1)),
            ..params
        };
        (params, kd)
    }

    /// True once a mutation diverged the sub-indexes. A poisoned ensemble
    /// fails every operation with [`AmbitError::Inconsistent`].
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The parameter bag both sub-indexes were configured from.
    pub fn params(&self) -> &EnsembleParams {
        self.kmeans.params()
    }

    /// Live point counts of the k-means tree and the kd-forest, in that
    /// order. Equal unless the ensemble is poisoned.
    pub fn sub_sizes(&self) -> (usize, usize) {
        (self.kmeans.size(), self.kdforest.size())
    }

    /// Convenience wrapper: the `k` nearest neighbors of `query` from the
    /// pooled candidates of both sub-indexes, ascending by distance.
    pub fn knn_search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Neighbor>> {
        let mut result = KnnResultSet::new(k);
        self.find_neighbors(&mut result, query, params)?;
        Ok(result.neighbors().to_vec())
    }

    fn inconsistency(&self) -> AmbitError {
        AmbitError::Inconsistent {
            kmeans: self.kmeans.size(),
            kdforest: self.kdforest.size(),
        }
    }

    fn guard(&self) -> Result<()> {
        if self.poisoned {
            Err(self.inconsistency())
        } else {
            Ok(())
        }
    }

    /// Compare live point counts after a mutation; divergence poisons the
    /// ensemble permanently.
    fn check_consistency(&mut self) -> Result<()> {
        if self.kmeans.size() != self.kdforest.size() {
            self.poisoned = true;
            return Err(self.inconsistency());
        }
        Ok(())
    }
}

impl PartitioningIndex for EnsembleIndex {
    fn build(&mut self) -> Result<()> {
        self.guard()?;
        log::info!(
            "building k-means partition tree over {} points",
            self.kmeans.size()
        );
        self.kmeans.build()?;
        log::info!(
            "building randomized kd-forest over {} points",
            self.kdforest.size()
        );
        self.kdforest.build()?;
        Ok(())
    }

    fn add_points(&mut self, points: &Matrix, rebuild_threshold: f32) -> Result<()> {
        self.guard()?;
        // reject up front so neither sub-index mutates
        if points.cols() != self.veclen() {
            return Err(AmbitError::DimensionMismatch {
                expected: self.veclen(),
                actual: points.cols(),
            });
        }
        if let Err(e) = self.kmeans.add_points(points, rebuild_threshold) {
            self.check_consistency()?;
            return Err(e);
        }
        if let Err(e) = self.kdforest.add_points(points, rebuild_threshold) {
            self.check_consistency()?;
            return Err(e);
        }
        self.check_consistency()
    }

    fn remove_point(&mut self, index: usize) -> Result<()> {
        self.guard()?;
        if let Err(e) = self.kmeans.remove_point(index) {
            self.check_consistency()?;
            return Err(e);
        }
        if let Err(e) = self.kdforest.remove_point(index) {
            self.check_consistency()?;
            return Err(e);
        }
        self.check_consistency()
    }

    /// Search both sub-indexes into the same collector, k-means tree first.
    ///
    /// Candidates merge under the collector's insertion rule, so on an exact
    /// distance tie the k-means tree's candidate wins (it was inserted
    /// first).
    fn find_neighbors(
        &self,
        result: &mut KnnResultSet,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<()> {
        self.guard()?;
        self.kmeans.find_neighbors(result, query, params)?;
        self.kdforest.find_neighbors(result, query, params)?;
        Ok(())
    }

    /// Live point count, reported from the kd-forest. The consistency guard
    /// keeps both sub-indexes in agreement, so either would do.
    fn size(&self) -> usize {
        self.kdforest.size()
    }

    fn veclen(&self) -> usize {
        self.kdforest.veclen()
    }

    fn used_memory(&self) -> usize {
        self.kmeans.used_memory() + self.kdforest.used_memory()
    }

    /// Serialize both sub-indexes onto one stream: the k-means tree block,
    /// then the kd-forest block, with no extra framing in between.
    fn save(&self, writer: &mut dyn Write) -> PersistResult<()> {
        if self.poisoned {
            return Err(PersistError::Format(
                "refusing to serialize an inconsistent ensemble".to_string(),
            ));
        }
        log::debug!("serializing ensemble ({} points)", self.size());
        self.kmeans.save(writer)?;
        self.kdforest.save(writer)?;
        Ok(())
    }

    /// Load both blocks in the fixed order. The receiver only changes after
    /// both sub-indexes parsed cleanly and agree with each other.
    fn load(&mut self, reader: &mut dyn Read) -> PersistResult<()> {
        let kmeans = KMeansTreeIndex::read_from(reader)?;
        let kdforest = KdForestIndex::read_from(reader)?;
        if kmeans.size() != kdforest.size() || kmeans.veclen() != kdforest.veclen() {
            return Err(PersistError::Format(format!(
                "sub-index blocks disagree: k-means tree {}x{}, kd-forest {}x{}",
                kmeans.size(),
                kmeans.veclen(),
                kdforest.size(),
                kdforest.veclen()
            )));
        }
        self.kmeans = kmeans;
        self.kdforest = kdforest;
        self.poisoned = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_forwarded_with_derived_seeds() {
        let ensemble = EnsembleIndex::new(
            4,
            DistanceMetric::L2,
            EnsembleParams::default().with_seed(9),
        )
        .unwrap();
        assert_eq!(ensemble.kmeans.params().seed, Some(9));
        assert_eq!(ensemble.kdforest.params().seed, Some(10));
    }

    #[test]
    fn rejects_invalid_params() {
        let params = EnsembleParams {
            branching: 1,
            ..EnsembleParams::default()
        };
        assert!(EnsembleIndex::new(4, DistanceMetric::L2, params).is_err());
    }

    #[test]
    fn empty_ensemble_has_zero_size() {
        let ensemble =
            EnsembleIndex::new(16, DistanceMetric::L2, EnsembleParams::default()).unwrap();
        assert_eq!(ensemble.size(), 0);
        assert_eq!(ensemble.veclen(), 16);
        assert!(!ensemble.is_poisoned());
    }
}
