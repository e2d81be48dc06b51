//! Distance metrics for dense vectors.
//!
//! All index structures in this crate order candidates by the values these
//! functions return, so any monotone transform of a metric is acceptable.
//! [`l2_distance`] returns the *squared* Euclidean distance for that reason.

use serde::{Deserialize, Serialize};

/// Distance metric for dense vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    /// Squared Euclidean (L2) distance.
    #[default]
    L2,
    /// Cosine distance `1 - cos(a, b)`.
    Cosine,
    /// Inner product distance `-<a, b>` (for maximum inner product search).
    InnerProduct,
}

impl DistanceMetric {
    /// Compute the distance between two vectors.
    ///
    /// If dimensions mismatch, this returns `f32::INFINITY` so the pair is
    /// never selected as a nearest neighbor.
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => l2_distance(a, b),
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::InnerProduct => inner_product_distance(a, b),
        }
    }
}

/// Squared L2 (Euclidean) distance.
#[inline]
#[must_use]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Dot product.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine distance `1 - cos(a, b)`.
///
/// Computes the norms itself, so inputs do not need to be pre-normalized.
/// Zero vectors get distance `1.0` (treated as maximally dissimilar).
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / (norm_a * norm_b)
}

/// Inner product distance `-<a, b>`.
#[inline]
#[must_use]
pub fn inner_product_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    -dot(a, b)
}
