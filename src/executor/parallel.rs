use std::sync::Arc;

use rayon::{ThreadPoolBuilder, prelude::*};

use super::{
    CopySpecExecutor, ExecuteOptions, ExecutionPlan, ExecutorPlugin, RegisteredExecutor, run_task,
};
use crate::{
    Error, Result,
    pipeline::{CopyTask, ParallelPipelines, Pipeline, specs_to_pipelines},
    types::CopySpec,
};

inventory::submit! {
    ExecutorPlugin::new::<RayonExecutor>()
}

/// Runs arrays in parallel, and the blocks of each stage in parallel, on a rayon thread pool.
///
/// Stages of the same array are separated by a barrier.
#[derive(Debug, Clone, Default)]
pub struct RayonExecutor {
    num_threads: Option<usize>,
}

impl RayonExecutor {
    /// Run on a dedicated pool of `num_threads` threads rather than the global pool.
    #[must_use]
    pub fn with_num_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
        }
    }
}

#[derive(Debug)]
pub struct RayonPlan {
    pub pipelines: ParallelPipelines,
}

impl RegisteredExecutor for RayonExecutor {
    const NAME: &'static str = "rayon";
    const ALIASES: &'static [&'static str] = &["threads"];

    fn create() -> Arc<dyn CopySpecExecutor> {
        Arc::new(Self::default())
    }
}

fn run_pipeline(pipeline: &Pipeline, options: &ExecuteOptions) -> Result<()> {
    for stage in pipeline {
        let tasks: Vec<CopyTask> = stage.tasks().collect();
        log::debug!("{}: {} tasks", stage.name, tasks.len());
        tasks
            .into_par_iter()
            .try_for_each(|task| run_task(&task, options))?;
    }
    Ok(())
}

impl CopySpecExecutor for RayonExecutor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare_plan(&self, specs: &[CopySpec]) -> Result<ExecutionPlan> {
        let pipelines = specs_to_pipelines(specs)?;
        let num_tasks = pipelines.iter().flatten().map(|s| s.num_tasks()).sum();
        Ok(ExecutionPlan::new(
            Self::NAME,
            num_tasks,
            RayonPlan { pipelines },
        ))
    }

    fn execute_plan(&self, plan: &ExecutionPlan, options: &ExecuteOptions) -> Result<()> {
        let rayon_plan: &RayonPlan = plan.downcast_for(Self::NAME)?;
        log::info!(
            "executing {} tasks over {} arrays",
            plan.num_tasks(),
            rayon_plan.pipelines.len()
        );
        let run = || {
            rayon_plan
                .pipelines
                .par_iter()
                .try_for_each(|pipeline| run_pipeline(pipeline, options))
        };
        match self.num_threads {
            Some(num_threads) => ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| Error::ThreadPool(e.to_string()))?
                .install(run)?,
            None => run()?,
        }
        log::info!("finished executing {} tasks", plan.num_tasks());
        Ok(())
    }
}
