//! Decomposition of copy specs into ordered stages of independent block copies.

use std::{fmt, sync::Arc};

use crate::{
    Error, Result,
    chunk::BlockGrid,
    storage::ArrayHandle,
    types::{CopySpec, Intermediate},
};

/// Copies every block of `grid` from `source` to `destination`.
///
/// Blocks of a stage are independent and may be copied in any order.
pub struct Stage {
    pub name: String,
    pub source: ArrayHandle,
    pub destination: ArrayHandle,
    pub grid: BlockGrid,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("source", &self.source.path())
            .field("destination", &self.destination.path())
            .field("block_shape", &self.grid.block_shape())
            .finish()
    }
}

impl Stage {
    pub fn num_tasks(&self) -> u64 {
        self.grid.num_blocks()
    }

    /// The copy tasks of this stage in C order.
    pub fn tasks(self: &Arc<Self>) -> impl Iterator<Item = CopyTask> + '_ {
        self.grid.blocks().map(|block| CopyTask {
            stage: self.clone(),
            block,
        })
    }
}

/// Stages of a single array, run in order.
pub type Pipeline = Vec<Arc<Stage>>;

/// Independent pipelines, one per array.
pub type ParallelPipelines = Vec<Pipeline>;

/// A single block copy.
#[derive(Debug, Clone)]
pub struct CopyTask {
    pub stage: Arc<Stage>,
    pub block: Vec<u64>,
}

impl CopyTask {
    /// Copy the block, wrapping failures with the array, stage and block.
    pub fn run(&self) -> Result<()> {
        copy_block(&self.stage, &self.block)
    }
}

/// Read a block from the stage source and overwrite the same region of the destination.
///
/// Idempotent, so a failed block may simply be copied again.
pub fn copy_block(stage: &Stage, block: &[u64]) -> Result<()> {
    let task_error = |source: Error| Error::Task {
        array: stage.destination.path(),
        stage: stage.name.clone(),
        block: block.to_vec(),
        source: Box::new(source),
    };
    let subset = stage
        .grid
        .subset(block)
        .ok_or_else(|| task_error(Error::general("block index outside the grid")))?;
    log::trace!("{}: copying block {block:?} ({subset})", stage.name);
    let data = stage.source.read_region(&subset).map_err(task_error)?;
    stage
        .destination
        .write_region(&subset, &data)
        .map_err(task_error)
}

/// Decompose a copy spec into its stages.
///
/// A direct copy is one stage over the write grid.
/// A staged copy first fills the intermediate array over the intermediate grid, then copies it to the target over the write grid.
pub fn spec_to_pipeline(spec: &CopySpec) -> Result<Pipeline> {
    let shape = spec.shape();
    let source = spec.read().array.clone();
    let target = spec.write().array.clone();
    let stages = match spec.intermediate() {
        Intermediate::Direct { .. } => vec![Stage {
            name: format!("copy {} to {}", source.path(), target.path()),
            grid: BlockGrid::new(&shape, &spec.write().chunks)?,
            source,
            destination: target,
        }],
        Intermediate::Staged(proxy) => vec![
            Stage {
                name: format!("stage {} to {}", source.path(), proxy.array.path()),
                grid: BlockGrid::new(&shape, &proxy.chunks)?,
                source,
                destination: proxy.array.clone(),
            },
            Stage {
                name: format!("copy {} to {}", proxy.array.path(), target.path()),
                grid: BlockGrid::new(&shape, &spec.write().chunks)?,
                source: proxy.array.clone(),
                destination: target,
            },
        ],
    };
    Ok(stages.into_iter().map(Arc::new).collect())
}

pub fn specs_to_pipelines(specs: &[CopySpec]) -> Result<ParallelPipelines> {
    specs.iter().map(spec_to_pipeline).collect()
}
