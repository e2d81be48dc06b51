//! Exact nearest-neighbor computation.
//!
//! Approximate indexes are validated against exact answers. These routines
//! scan the reference set once per query through a bounded sorted shortlist,
//! `O(m * (nn + skip))` worst case and `O(m)` in the common case where most
//! candidates do not beat the current worst.

use crate::distance::DistanceMetric;
use crate::error::{AmbitError, Result};
use crate::matrix::Matrix;
use crate::result::KnnResultSet;

/// Exact `nn` nearest rows of `dataset` to `query`, skipping the closest
/// `skip` matches.
///
/// `skip` is typically used to exclude a query's own identity when the query
/// is itself a member of the reference set (`skip = 1`).
///
/// If the dataset holds fewer than `nn + skip` rows the result is shorter
/// than `nn`: exactly `min(m, nn + skip) - skip` indices (never negative).
/// Returned indices are ordered ascending by distance.
pub fn find_nearest(
    dataset: &Matrix,
    query: &[f32],
    nn: usize,
    skip: usize,
    metric: DistanceMetric,
) -> Result<Vec<usize>> {
    if dataset.is_empty() {
        return Err(AmbitError::EmptyIndex);
    }
    if query.len() != dataset.cols() {
        return Err(AmbitError::DimensionMismatch {
            expected: dataset.cols(),
            actual: query.len(),
        });
    }

    let mut shortlist = KnnResultSet::new(nn + skip);
    for (i, row) in dataset.iter_rows().enumerate() {
        shortlist.push(i, metric.distance(row, query));
    }

    Ok(shortlist
        .neighbors()
        .iter()
        .skip(skip)
        .map(|n| n.index)
        .collect())
}

/// Exact neighbors for every row of `testset`.
///
/// Row `i` of the output is identical to
/// `find_nearest(dataset, testset.row(i), nn, skip, metric)`.
pub fn compute_ground_truth(
    dataset: &Matrix,
    testset: &Matrix,
    nn: usize,
    skip: usize,
    metric: DistanceMetric,
) -> Result<Vec<Vec<usize>>> {
    testset
        .iter_rows()
        .map(|query| find_nearest(dataset, query, nn, skip, metric))
        .collect()
}
