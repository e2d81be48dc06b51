//! ambit: ensemble approximate nearest-neighbor search.
//!
//! The core idea: different partitioning heuristics miss different
//! near-neighbors. [`EnsembleIndex`] owns two independently-built indexes
//! over the same point set (a hierarchical k-means tree and a forest of
//! randomized kd-trees), forwards every mutation to both, and pools their
//! search candidates into one collector, recovering higher recall than
//! either structure alone at comparable cost.
//!
//! Modules:
//!
//! - `ensemble`: the coordinating [`EnsembleIndex`]
//! - `kmeans_tree` / `kdforest`: the two partitioning variants
//! - `index`: the [`PartitioningIndex`] capability contract and parameters
//! - `ground_truth`: exact top-k computation for validating approximate
//!   results
//! - `random`: [`UniqueRandom`], sampling without replacement for randomized
//!   construction
//! - `result`: [`KnnResultSet`], the bounded ascending candidate collector
//! - `matrix` / `distance` / `persist`: row storage, metrics, stream formats
//!
//! # Example
//!
//! ```
//! use ambit::{
//!     DistanceMetric, EnsembleIndex, EnsembleParams, Matrix, PartitioningIndex, SearchParams,
//! };
//!
//! let data = Matrix::from_rows(&[
//!     vec![0.0, 0.0],
//!     vec![1.0, 0.0],
//!     vec![0.0, 1.0],
//!     vec![5.0, 5.0],
//! ])?;
//! let mut index = EnsembleIndex::with_data(
//!     &data,
//!     DistanceMetric::L2,
//!     EnsembleParams::default().with_seed(42),
//! )?;
//! index.build()?;
//!
//! let hits = index.knn_search(&[0.1, 0.1], 2, &SearchParams::default())?;
//! assert_eq!(hits[0].index, 0);
//! # Ok::<(), ambit::AmbitError>(())
//! ```

pub mod distance;
pub mod ensemble;
pub mod error;
pub mod ground_truth;
pub mod index;
pub mod kdforest;
pub mod kmeans_tree;
pub mod matrix;
pub mod persist;
pub mod random;
pub mod result;

mod points;

pub use distance::DistanceMetric;
pub use ensemble::EnsembleIndex;
pub use error::{AmbitError, Result};
pub use ground_truth::{compute_ground_truth, find_nearest};
pub use index::{CentersInit, EnsembleParams, PartitioningIndex, SearchParams};
pub use kdforest::KdForestIndex;
pub use kmeans_tree::KMeansTreeIndex;
pub use matrix::Matrix;
pub use persist::PersistError;
pub use random::UniqueRandom;
pub use result::{KnnResultSet, Neighbor};
