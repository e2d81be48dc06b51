//! Stream persistence primitives.
//!
//! Index formats in this crate are sequential little-endian blocks, each
//! opening with four magic bytes and a format version. Readers validate
//! magic and version before touching any payload, and every loader
//! reconstructs a complete index value before the target is replaced, so a
//! malformed or truncated stream never leaves a partially-populated index
//! behind.

use std::io::{self, Read, Write};
use thiserror::Error;

use crate::distance::DistanceMetric;
use crate::index::{CentersInit, EnsembleParams};

/// Errors that can occur while saving or loading an index.
#[derive(Debug, Error)]
pub enum PersistError {
    /// I/O error (file operations, truncated streams)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Format error (bad magic bytes, corrupt payload)
    #[error("format error: {0}")]
    Format(String),

    /// Version mismatch
    #[error("unsupported format version: found {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Result type for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Magic bytes opening a serialized k-means tree block.
pub const KMEANS_TREE_MAGIC: [u8; 4] = *b"AMKM";

/// Magic bytes opening a serialized kd-forest block.
pub const KD_FOREST_MAGIC: [u8; 4] = *b"AMKD";

/// Current block format version.
pub const FORMAT_VERSION: u32 = 1;

pub(crate) fn write_magic(w: &mut dyn Write, magic: &[u8; 4]) -> PersistResult<()> {
    w.write_all(magic)?;
    write_u32(w, FORMAT_VERSION)
}

pub(crate) fn check_magic(r: &mut dyn Read, expected: &[u8; 4], what: &str) -> PersistResult<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != expected {
        return Err(PersistError::Format(format!(
            "bad magic bytes for {what}: expected {expected:?}, found {magic:?}"
        )));
    }
    let version = read_u32(r)?;
    if version != FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    Ok(())
}

pub(crate) fn write_u8(w: &mut dyn Write, v: u8) -> PersistResult<()> {
    w.write_all(&[v])?;
    Ok(())
}

pub(crate) fn read_u8(r: &mut dyn Read) -> PersistResult<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn write_u32(w: &mut dyn Write, v: u32) -> PersistResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u32(r: &mut dyn Read) -> PersistResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn write_u64(w: &mut dyn Write, v: u64) -> PersistResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u64(r: &mut dyn Read) -> PersistResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_usize(w: &mut dyn Write, v: usize) -> PersistResult<()> {
    write_u64(w, v as u64)
}

pub(crate) fn read_usize(r: &mut dyn Read) -> PersistResult<usize> {
    let v = read_u64(r)?;
    usize::try_from(v).map_err(|_| PersistError::Format(format!("length {v} overflows usize")))
}

pub(crate) fn write_f32(w: &mut dyn Write, v: f32) -> PersistResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_f32(r: &mut dyn Read) -> PersistResult<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub(crate) fn write_f32_slice(w: &mut dyn Write, values: &[f32]) -> PersistResult<()> {
    for &v in values {
        write_f32(w, v)?;
    }
    Ok(())
}

pub(crate) fn read_f32_vec(r: &mut dyn Read, len: usize) -> PersistResult<Vec<f32>> {
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(read_f32(r)?);
    }
    Ok(values)
}

pub(crate) fn write_usize_slice(w: &mut dyn Write, values: &[usize]) -> PersistResult<()> {
    write_usize(w, values.len())?;
    for &v in values {
        write_usize(w, v)?;
    }
    Ok(())
}

pub(crate) fn read_usize_vec(r: &mut dyn Read) -> PersistResult<Vec<usize>> {
    let len = read_usize(r)?;
    let mut values = Vec::with_capacity(len.min(1 << 20));
    for _ in 0..len {
        values.push(read_usize(r)?);
    }
    Ok(values)
}

pub(crate) fn encode_metric(metric: DistanceMetric) -> u8 {
    match metric {
        DistanceMetric::L2 => 0,
        DistanceMetric::Cosine => 1,
        DistanceMetric::InnerProduct => 2,
    }
}

pub(crate) fn decode_metric(tag: u8) -> PersistResult<DistanceMetric> {
    match tag {
        0 => Ok(DistanceMetric::L2),
        1 => Ok(DistanceMetric::Cosine),
        2 => Ok(DistanceMetric::InnerProduct),
        other => Err(PersistError::Format(format!(
            "unknown distance metric tag {other}"
        ))),
    }
}

pub(crate) fn write_params(w: &mut dyn Write, params: &EnsembleParams) -> PersistResult<()> {
    write_usize(w, params.trees)?;
    write_usize(w, params.branching)?;
    write_usize(w, params.iterations)?;
    write_u8(
        w,
        match params.centers_init {
            CentersInit::Random => 0,
            CentersInit::Gonzales => 1,
            CentersInit::KMeansPp => 2,
        },
    )?;
    write_f32(w, params.cb_index)?;
    match params.seed {
        None => write_u8(w, 0)?,
        Some(seed) => {
            write_u8(w, 1)?;
            write_u64(w, seed)?;
        }
    }
    Ok(())
}

pub(crate) fn read_params(r: &mut dyn Read) -> PersistResult<EnsembleParams> {
    let trees = read_usize(r)?;
    let branching = read_usize(r)?;
    let iterations = read_usize(r)?;
    let centers_init = match read_u8(r)? {
        0 => CentersInit::Random,
        1 => CentersInit::Gonzales,
        2 => CentersInit::KMeansPp,
        other => {
            return Err(PersistError::Format(format!(
                "unknown centers_init tag {other}"
            )))
        }
    };
    let cb_index = read_f32(r)?;
    let seed = match read_u8(r)? {
        0 => None,
        1 => Some(read_u64(r)?),
        other => {
            return Err(PersistError::Format(format!(
                "invalid seed presence tag {other}"
            )))
        }
    };
    Ok(EnsembleParams {
        trees,
        branching,
        iterations,
        centers_init,
        cb_index,
        seed,
    })
}
