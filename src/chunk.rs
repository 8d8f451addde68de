//! Regular block grids over an array shape.
//!
//! A [`BlockGrid`] partitions an array of some shape into rectangular blocks, each an [`ArraySubset`].
//! Blocks along the upper edge of an axis may be partial when the block shape does not divide the array shape.

use zarrs::array::{ArraySubset, ArraySubsetTraits};

use crate::{Error, Result};

/// A regular grid of blocks covering an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGrid {
    shape: Vec<u64>,
    block_shape: Vec<u64>,
    grid: ArraySubset,
}

impl BlockGrid {
    /// Create a grid of `block_shape` blocks over an array of `shape`.
    ///
    /// Block extents must be non-zero and match the array rank.
    pub fn new(shape: &[u64], block_shape: &[u64]) -> Result<Self> {
        if shape.len() != block_shape.len() {
            return Err(Error::RankMismatch {
                what: "block shape",
                expected: shape.len(),
                actual: block_shape.len(),
            });
        }
        if let Some(axis) = block_shape.iter().position(|&b| b == 0) {
            return Err(Error::ZeroChunk {
                what: "block shape",
                axis,
            });
        }
        let grid_shape = shape
            .iter()
            .zip(block_shape)
            .map(|(&s, &b)| s.div_ceil(b))
            .collect();
        Ok(Self {
            shape: shape.to_vec(),
            block_shape: block_shape.to_vec(),
            grid: ArraySubset::new_with_shape(grid_shape),
        })
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn block_shape(&self) -> &[u64] {
        &self.block_shape
    }

    /// Number of blocks along each axis.
    pub fn grid_shape(&self) -> &[u64] {
        self.grid.shape()
    }

    /// Total number of blocks.
    pub fn num_blocks(&self) -> u64 {
        self.grid.num_elements()
    }

    /// The subset of the array covered by the block at `indices`, clamped to the array shape.
    ///
    /// Returns [`None`] if the indices are outside the grid.
    pub fn subset(&self, indices: &[u64]) -> Option<ArraySubset> {
        if indices.len() != self.shape.len() || !self.grid.contains(indices) {
            return None;
        }
        let start = indices
            .iter()
            .zip(&self.block_shape)
            .map(|(&i, &b)| i * b)
            .collect();
        ArraySubset::new_with_start_shape(start, self.block_shape.clone())
            .and_then(|block| block.bound(&self.shape))
            .ok()
    }

    /// Iterate over all block indices in C order (last axis fastest).
    pub fn blocks(&self) -> impl Iterator<Item = Vec<u64>> + use<> {
        self.grid.indices().into_iter().map(|indices| indices.to_vec())
    }
}

/// Whether `subset` starts on a chunk boundary on every axis and ends on one or at the array edge.
pub fn is_chunk_aligned(subset: &ArraySubset, shape: &[u64], chunks: &[u64]) -> bool {
    subset.dimensionality() == chunks.len()
        && subset
            .start()
            .iter()
            .zip(subset.end_exc())
            .zip(shape.iter().zip(chunks))
            .all(|((&start, end), (&s, &c))| start % c == 0 && (end % c == 0 || end == s))
}

/// The whole of an array of `shape`.
pub fn whole(shape: &[u64]) -> ArraySubset {
    ArraySubset::new_with_shape(shape.to_vec())
}
