//! Error types for ambit.

use std::fmt;

/// Errors that can occur during index construction, mutation and search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmbitError {
    /// Operation requires data but the index holds no points.
    EmptyIndex,
    /// The index must be built before searching.
    NotBuilt,
    /// Dimension mismatch between supplied vectors and the index.
    DimensionMismatch { expected: usize, actual: usize },
    /// Point index out of range or already removed.
    PointNotFound(usize),
    /// Invalid parameter value.
    InvalidParameter(String),
    /// The two sub-indexes of an ensemble disagree on the live point count.
    ///
    /// Once observed the ensemble is unusable; every subsequent operation
    /// returns the same error. See [`crate::EnsembleIndex`].
    Inconsistent { kmeans: usize, kdforest: usize },
}

impl fmt::Display for AmbitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmbitError::EmptyIndex => write!(f, "Index is empty"),
            AmbitError::NotBuilt => write!(f, "Index has not been built"),
            AmbitError::DimensionMismatch { expected, actual } => write!(
                f,
                "Dimension mismatch: index expects {expected} dimensions, got {actual}",
            ),
            AmbitError::PointNotFound(index) => {
                write!(f, "Point {index} is out of range or already removed")
            }
            AmbitError::InvalidParameter(msg) => write!(f, "Invalid parameter: {msg}"),
            AmbitError::Inconsistent { kmeans, kdforest } => write!(
                f,
                "Ensemble sub-indexes diverged: k-means tree holds {kmeans} points, kd-forest holds {kdforest}",
            ),
        }
    }
}

impl std::error::Error for AmbitError {}

pub type Result<T> = std::result::Result<T, AmbitError>;
