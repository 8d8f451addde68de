//! The rechunking planner.
//!
//! [`rechunking_plan`] chooses the chunk shapes used to read from the source, stage intermediate data and write to the target.
//! Every chosen shape holds at most `max_mem` bytes, so no single copy task needs more memory than that.

use crate::{Error, Result};

/// Read, intermediate and write chunk shapes for a single array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechunkPlan {
    pub read_chunks: Vec<u64>,
    pub int_chunks: Vec<u64>,
    pub write_chunks: Vec<u64>,
}

impl RechunkPlan {
    /// Whether an intermediate array is needed to decouple reads from writes.
    pub fn needs_staging(&self) -> bool {
        self.read_chunks != self.write_chunks && self.read_chunks != self.int_chunks
    }
}

fn chunk_mem(chunks: &[u64], item_size: usize) -> u128 {
    chunks
        .iter()
        .fold(item_size as u128, |acc, &c| acc * u128::from(c))
}

fn check_rank(what: &'static str, expected: usize, chunks: &[u64]) -> Result<()> {
    if chunks.len() == expected {
        Ok(())
    } else {
        Err(Error::RankMismatch {
            what,
            expected,
            actual: chunks.len(),
        })
    }
}

/// Clamp chunk extents larger than the array to the array extent.
///
/// Zero-length axes keep a chunk extent of 1.
/// Zero chunk extents are an error.
pub fn normalize_chunks(what: &'static str, shape: &[u64], chunks: &[u64]) -> Result<Vec<u64>> {
    check_rank(what, shape.len(), chunks)?;
    chunks
        .iter()
        .zip(shape)
        .enumerate()
        .map(|(axis, (&c, &s))| {
            if c == 0 {
                Err(Error::ZeroChunk { what, axis })
            } else {
                Ok(c.min(s.max(1)))
            }
        })
        .collect()
}

/// Grow `chunks` into larger blocks of at most `max_mem` bytes.
///
/// Axes are grown greedily from the last to the first.
/// On each axis the block becomes the largest multiple of the chunk extent that fits in the remaining memory and does not exceed `min(limit, shape)`.
/// A block reaching the full axis takes the axis length, even if that is not a multiple of the chunk extent.
/// Axes with a `None` limit are not grown.
pub fn consolidate_chunks(
    shape: &[u64],
    chunks: &[u64],
    item_size: usize,
    max_mem: u64,
    chunk_limits: &[Option<u64>],
) -> Result<Vec<u64>> {
    check_rank("chunks", shape.len(), chunks)?;
    if chunk_limits.len() != shape.len() {
        return Err(Error::RankMismatch {
            what: "chunk limits",
            expected: shape.len(),
            actual: chunk_limits.len(),
        });
    }

    let mem = chunk_mem(chunks, item_size);
    if mem > u128::from(max_mem) {
        return Err(Error::SourceChunkExceedsMaxMem {
            chunk_mem: mem,
            max_mem,
        });
    }

    let mut new_chunks = chunks.to_vec();
    for axis in (0..shape.len()).rev() {
        let Some(limit) = chunk_limits[axis] else {
            continue;
        };
        let chunk = chunks[axis];
        let others = new_chunks
            .iter()
            .enumerate()
            .filter(|&(other, _)| other != axis)
            .fold(item_size.max(1) as u128, |acc, (_, &c)| acc * u128::from(c));
        let fit = u128::from(max_mem) / others;
        let upper = limit.min(shape[axis]);
        let extent = u64::try_from(fit.min(u128::from(upper))).unwrap_or(upper);
        new_chunks[axis] = if extent >= shape[axis] {
            shape[axis].max(chunk)
        } else {
            (extent / chunk * chunk).max(chunk)
        };
    }
    Ok(new_chunks)
}

/// Compute the read, intermediate and write chunk shapes for rechunking an array.
///
/// - `shape`: the array shape.
/// - `source_chunks`: the chunk shape of the source array.
/// - `target_chunks`: the desired chunk shape of the target array.
/// - `item_size`: bytes per element.
/// - `max_mem`: the maximum number of bytes any single read, staged or written block may hold.
/// - `consolidate_reads`: whether reads may span several source chunks.
///
/// Chunk extents larger than the array are clamped to the array extent.
///
/// # Errors
/// Returns an error if the ranks do not match, a chunk extent is zero, or a single source or target chunk does not fit in `max_mem`.
pub fn rechunking_plan(
    shape: &[u64],
    source_chunks: &[u64],
    target_chunks: &[u64],
    item_size: usize,
    max_mem: u64,
    consolidate_reads: bool,
) -> Result<RechunkPlan> {
    let source_chunks = normalize_chunks("source chunks", shape, source_chunks)?;
    let target_chunks = normalize_chunks("target chunks", shape, target_chunks)?;

    let source_chunk_mem = chunk_mem(&source_chunks, item_size);
    if source_chunk_mem > u128::from(max_mem) {
        return Err(Error::SourceChunkExceedsMaxMem {
            chunk_mem: source_chunk_mem,
            max_mem,
        });
    }
    let target_chunk_mem = chunk_mem(&target_chunks, item_size);
    if target_chunk_mem > u128::from(max_mem) {
        return Err(Error::TargetChunkExceedsMaxMem {
            chunk_mem: target_chunk_mem,
            max_mem,
        });
    }

    let write_limits: Vec<Option<u64>> = shape.iter().copied().map(Some).collect();
    let write_chunks =
        consolidate_chunks(shape, &target_chunks, item_size, max_mem, &write_limits)?;

    let read_chunks = if consolidate_reads {
        // Grow reads along an axis only up to the write block, and only where writes are coarser.
        let read_limits: Vec<Option<u64>> = source_chunks
            .iter()
            .zip(&write_chunks)
            .map(|(&sc, &wc)| Some(if wc > sc { wc } else { sc }))
            .collect();
        consolidate_chunks(shape, &source_chunks, item_size, max_mem, &read_limits)?
    } else {
        source_chunks
    };

    let int_chunks = read_chunks
        .iter()
        .zip(&write_chunks)
        .map(|(&rc, &wc)| rc.min(wc))
        .collect();

    let plan = RechunkPlan {
        read_chunks,
        int_chunks,
        write_chunks,
    };
    log::debug!(
        "rechunking plan for shape {shape:?}: read {:?}, intermediate {:?}, write {:?}",
        plan.read_chunks,
        plan.int_chunks,
        plan.write_chunks
    );
    Ok(plan)
}
