//! Internal point storage shared by the index variants.

use std::io::{Read, Write};
use std::ops::Range;

use crate::error::{AmbitError, Result};
use crate::matrix::Matrix;
use crate::persist::{self, PersistResult};

/// Flat row-major store with logical (tombstone) removal.
///
/// Slot indices are stable for the lifetime of the store: removal marks a
/// slot dead without shifting later points, so indexes can keep referring to
/// points by slot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PointSet {
    data: Vec<f32>,
    veclen: usize,
    removed: Vec<bool>,
    removed_count: usize,
}

impl PointSet {
    pub(crate) fn new(veclen: usize) -> Result<Self> {
        if veclen == 0 {
            return Err(AmbitError::InvalidParameter(
                "vector dimensionality must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            data: Vec::new(),
            veclen,
            removed: Vec::new(),
            removed_count: 0,
        })
    }

    pub(crate) fn from_matrix(points: &Matrix) -> Result<Self> {
        let mut set = Self::new(points.cols())?;
        set.append(points)?;
        Ok(set)
    }

    /// Append all rows, returning the slot range they were assigned.
    pub(crate) fn append(&mut self, points: &Matrix) -> Result<Range<usize>> {
        if points.cols() != self.veclen {
            return Err(AmbitError::DimensionMismatch {
                expected: self.veclen,
                actual: points.cols(),
            });
        }
        let start = self.removed.len();
        self.data.extend_from_slice(points.as_slice());
        self.removed.extend(std::iter::repeat(false).take(points.rows()));
        Ok(start..self.removed.len())
    }

    /// Mark one slot dead.
    pub(crate) fn remove(&mut self, index: usize) -> Result<()> {
        if index >= self.removed.len() || self.removed[index] {
            return Err(AmbitError::PointNotFound(index));
        }
        self.removed[index] = true;
        self.removed_count += 1;
        Ok(())
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &[f32] {
        let start = index * self.veclen;
        &self.data[start..start + self.veclen]
    }

    #[inline]
    pub(crate) fn is_removed(&self, index: usize) -> bool {
        self.removed[index]
    }

    /// Total slots, dead ones included.
    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.removed.len()
    }

    /// Live point count.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.removed.len() - self.removed_count
    }

    #[inline]
    pub(crate) fn veclen(&self) -> usize {
        self.veclen
    }

    /// Slot indices of live points, in order.
    pub(crate) fn live_indices(&self) -> Vec<usize> {
        (0..self.slots()).filter(|&i| !self.removed[i]).collect()
    }

    pub(crate) fn memory_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>() + self.removed.len()
    }

    pub(crate) fn write_to(&self, w: &mut dyn Write) -> PersistResult<()> {
        persist::write_usize(w, self.veclen)?;
        persist::write_usize(w, self.slots())?;
        for &dead in &self.removed {
            persist::write_u8(w, u8::from(dead))?;
        }
        persist::write_f32_slice(w, &self.data)?;
        Ok(())
    }

    pub(crate) fn read_from(r: &mut dyn Read) -> PersistResult<Self> {
        use crate::persist::PersistError;

        let veclen = persist::read_usize(r)?;
        if veclen == 0 {
            return Err(PersistError::Format(
                "point set with zero dimensionality".to_string(),
            ));
        }
        let slots = persist::read_usize(r)?;
        let mut removed = Vec::with_capacity(slots.min(1 << 24));
        let mut removed_count = 0;
        for _ in 0..slots {
            let dead = persist::read_u8(r)? != 0;
            removed_count += usize::from(dead);
            removed.push(dead);
        }
        let data = persist::read_f32_vec(r, slots * veclen)?;
        Ok(Self {
            data,
            veclen,
            removed,
            removed_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_remove() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let mut set = PointSet::from_matrix(&m).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1), &[3.0, 4.0]);

        set.remove(0).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.is_removed(0));
        assert_eq!(set.live_indices(), vec![1]);
        // removing twice is an error
        assert_eq!(set.remove(0).unwrap_err(), AmbitError::PointNotFound(0));
        // slots stay stable
        assert_eq!(set.slots(), 2);
        assert_eq!(set.get(1), &[3.0, 4.0]);
    }

    #[test]
    fn append_rejects_wrong_width() {
        let mut set = PointSet::new(3).unwrap();
        let m = Matrix::from_rows(&[vec![1.0, 2.0]]).unwrap();
        assert!(set.append(&m).is_err());
    }

    #[test]
    fn round_trip() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let mut set = PointSet::from_matrix(&m).unwrap();
        set.remove(1).unwrap();

        let mut buf = Vec::new();
        set.write_to(&mut buf).unwrap();
        let loaded = PointSet::read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(loaded, set);
    }
}
