use std::sync::Arc;

use super::{
    CopySpecExecutor, ExecuteOptions, ExecutionPlan, ExecutorPlugin, RegisteredExecutor, run_task,
};
use crate::{
    Result,
    pipeline::{CopyTask, specs_to_pipelines},
    types::CopySpec,
};

inventory::submit! {
    ExecutorPlugin::new::<SequentialExecutor>()
}

/// Runs every block copy in order on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

/// All tasks of all arrays, in execution order.
#[derive(Debug)]
pub struct SequentialPlan {
    pub tasks: Vec<CopyTask>,
}

impl RegisteredExecutor for SequentialExecutor {
    const NAME: &'static str = "sequential";

    fn create() -> Arc<dyn CopySpecExecutor> {
        Arc::new(Self)
    }
}

impl CopySpecExecutor for SequentialExecutor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare_plan(&self, specs: &[CopySpec]) -> Result<ExecutionPlan> {
        let tasks: Vec<CopyTask> = specs_to_pipelines(specs)?
            .iter()
            .flatten()
            .flat_map(|stage| stage.tasks())
            .collect();
        let num_tasks = tasks.len() as u64;
        Ok(ExecutionPlan::new(
            Self::NAME,
            num_tasks,
            SequentialPlan { tasks },
        ))
    }

    fn execute_plan(&self, plan: &ExecutionPlan, options: &ExecuteOptions) -> Result<()> {
        let plan: &SequentialPlan = plan.downcast_for(Self::NAME)?;
        log::info!("executing {} tasks sequentially", plan.tasks.len());
        for task in &plan.tasks {
            run_task(task, options)?;
        }
        log::info!("finished executing {} tasks", plan.tasks.len());
        Ok(())
    }
}
