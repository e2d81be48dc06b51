//! The partitioning-index capability contract and its configuration.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matrix::Matrix;
use crate::persist::PersistResult;
use crate::result::KnnResultSet;

/// Capability set every partitioning index exposes.
///
/// All operations are synchronous and define no concurrency guarantees of
/// their own; callers wanting parallel access must serialize externally.
pub trait PartitioningIndex {
    /// Construct the internal structure from the current point set.
    ///
    /// Fails with [`crate::AmbitError::EmptyIndex`] if no data is present.
    fn build(&mut self) -> Result<()>;

    /// Append vectors to the point set.
    ///
    /// Triggers a full rebuild when the grown size exceeds
    /// `rebuild_threshold` times the size at the last build; otherwise the
    /// new points are inserted into the existing structure.
    fn add_points(&mut self, points: &Matrix, rebuild_threshold: f32) -> Result<()>;

    /// Logically delete one point. Subsequent queries never return it;
    /// physical compaction is implementation-defined.
    fn remove_point(&mut self, index: usize) -> Result<()>;

    /// Append search candidates for `query` into `result`.
    ///
    /// Never clears the collector, so several indexes can merge their
    /// candidates into one pool.
    fn find_neighbors(
        &self,
        result: &mut KnnResultSet,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<()>;

    /// Number of live points.
    fn size(&self) -> usize;

    /// Dimensionality of indexed vectors.
    fn veclen(&self) -> usize;

    /// Approximate memory used by the index, in bytes.
    fn used_memory(&self) -> usize;

    /// Serialize the index onto a sequential stream.
    fn save(&self, writer: &mut dyn Write) -> PersistResult<()>;

    /// Reconstruct the index from a stream previously produced by
    /// [`PartitioningIndex::save`].
    ///
    /// On failure the receiver is left untouched, never half-loaded.
    fn load(&mut self, reader: &mut dyn Read) -> PersistResult<()>;
}

/// Runtime search knobs, forwarded opaquely to every sub-index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Point evaluations budget per sub-index traversal. Higher means
    /// better recall and slower queries. `usize::MAX` degenerates to an
    /// exhaustive (exact) traversal.
    #[serde(default = "default_checks")]
    pub checks: usize,

    /// Approximation slack: a branch is pruned once its lower bound cannot
    /// beat `worst / (1 + eps)`. Zero keeps pruning exact.
    #[serde(default)]
    pub eps: f32,
}

fn default_checks() -> usize {
    32
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            checks: default_checks(),
            eps: 0.0,
        }
    }
}

impl SearchParams {
    /// Exhaustive traversal; useful for validation.
    pub fn exhaustive() -> Self {
        Self {
            checks: usize::MAX,
            eps: 0.0,
        }
    }
}

/// Strategy for picking initial cluster centers in the k-means tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CentersInit {
    /// Uniform draw of distinct points.
    #[default]
    Random,
    /// Farthest-point (Gonzales) selection.
    Gonzales,
    /// k-means++ D² weighting.
    KMeansPp,
}

/// Shared configuration for an ensemble and its two sub-indexes.
///
/// The bag is forwarded verbatim to both sub-indexes; each reads the fields
/// it consumes (the kd-forest reads `trees`, the k-means tree reads
/// `branching`, `iterations`, `centers_init` and `cb_index`). Deserializing
/// ignores unknown keys, and every missing key takes the default below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleParams {
    /// Number of randomized kd-trees.
    #[serde(default = "default_trees")]
    pub trees: usize,

    /// k-means tree branching factor.
    #[serde(default = "default_branching")]
    pub branching: usize,

    /// Iteration cap for one k-means refinement.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Initial cluster center selection policy.
    #[serde(default)]
    pub centers_init: CentersInit,

    /// Cluster-boundary trade-off applied when searching the k-means tree.
    /// Higher values re-explore cluster boundaries more eagerly.
    #[serde(default = "default_cb_index")]
    pub cb_index: f32,

    /// Seed for all randomized construction. `None` seeds from entropy;
    /// `Some(s)` makes builds reproducible (the two sub-indexes derive
    /// distinct streams from it so their structures stay differently
    /// biased).
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_trees() -> usize {
    4
}

fn default_branching() -> usize {
    32
}

fn default_iterations() -> usize {
    11
}

fn default_cb_index() -> f32 {
    0.2
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self {
            trees: default_trees(),
            branching: default_branching(),
            iterations: default_iterations(),
            centers_init: CentersInit::default(),
            cb_index: default_cb_index(),
            seed: None,
        }
    }
}

impl EnsembleParams {
    /// Fix a seed for reproducible builds.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject parameter values no index variant can consume.
    pub fn validate(&self) -> Result<()> {
        use crate::error::AmbitError;
        if self.trees == 0 {
            return Err(AmbitError::InvalidParameter(
                "trees must be at least 1".to_string(),
            ));
        }
        if self.branching < 2 {
            return Err(AmbitError::InvalidParameter(
                "branching must be at least 2".to_string(),
            ));
        }
        if !self.cb_index.is_finite() || self.cb_index < 0.0 {
            return Err(AmbitError::InvalidParameter(format!(
                "cb_index must be finite and non-negative, got {}",
                self.cb_index
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let p = EnsembleParams::default();
        assert_eq!(p.trees, 4);
        assert_eq!(p.branching, 32);
        assert_eq!(p.iterations, 11);
        assert_eq!(p.centers_init, CentersInit::Random);
        assert!((p.cb_index - 0.2).abs() < f32::EPSILON);
        assert_eq!(p.seed, None);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn unknown_keys_ignored_missing_keys_defaulted() {
        let p: EnsembleParams =
            serde_json::from_str(r#"{"branching": 64, "memory_weight": 0.5}"#).unwrap();
        assert_eq!(p.branching, 64);
        assert_eq!(p.trees, 4);
        assert_eq!(p.centers_init, CentersInit::Random);
    }

    #[test]
    fn centers_init_names_are_snake_case() {
        let p: EnsembleParams =
            serde_json::from_str(r#"{"centers_init": "k_means_pp"}"#).unwrap();
        assert_eq!(p.centers_init, CentersInit::KMeansPp);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut p = EnsembleParams::default();
        p.branching = 1;
        assert!(p.validate().is_err());

        let mut p = EnsembleParams::default();
        p.trees = 0;
        assert!(p.validate().is_err());

        let mut p = EnsembleParams::default();
        p.cb_index = f32::NAN;
        assert!(p.validate().is_err());
    }
}
