//! Execution backends for copy specs.
//!
//! A backend compiles copy specs into an [`ExecutionPlan`] without doing any I/O, then runs the plan.
//! Backends register themselves with [`inventory`] so that they can be selected by name with [`get_executor`].

use std::{any::Any, fmt, sync::Arc};

use crate::{Error, Result, pipeline::CopyTask, types::CopySpec};

mod parallel;
mod sequential;

pub use parallel::{RayonExecutor, RayonPlan};
pub use sequential::{SequentialExecutor, SequentialPlan};

/// A backend which copies the blocks described by copy specs.
pub trait CopySpecExecutor: Send + Sync + fmt::Debug {
    /// The registered name of this backend.
    fn name(&self) -> &'static str;

    /// Compile copy specs into a plan.
    ///
    /// Pure and synchronous; nothing is read or written.
    fn prepare_plan(&self, specs: &[CopySpec]) -> Result<ExecutionPlan>;

    /// Run every task of a plan, honouring stage order within each array.
    ///
    /// Tasks are idempotent, so a plan may be executed again after a failure.
    fn execute_plan(&self, plan: &ExecutionPlan, options: &ExecuteOptions) -> Result<()>;
}

/// A backend specific plan.
pub struct ExecutionPlan {
    backend: &'static str,
    num_tasks: u64,
    inner: Box<dyn Any + Send + Sync>,
}

impl ExecutionPlan {
    pub fn new<T: Any + Send + Sync>(backend: &'static str, num_tasks: u64, inner: T) -> Self {
        Self {
            backend,
            num_tasks,
            inner: Box::new(inner),
        }
    }

    /// The name of the backend which prepared this plan.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Total number of block copies.
    pub fn num_tasks(&self) -> u64 {
        self.num_tasks
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    pub(crate) fn downcast_for<T: Any>(&self, backend: &'static str) -> Result<&T> {
        self.downcast_ref().ok_or(Error::PlanMismatch(backend))
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("backend", &self.backend)
            .field("num_tasks", &self.num_tasks)
            .finish_non_exhaustive()
    }
}

/// Options for [`CopySpecExecutor::execute_plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// How many times a failed block copy is retried before giving up.
    pub retries: u32,
}

impl ExecuteOptions {
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Run a task, retrying failures as configured.
pub fn run_task(task: &CopyTask, options: &ExecuteOptions) -> Result<()> {
    let mut attempt = 0;
    loop {
        match task.run() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < options.retries => {
                attempt += 1;
                log::warn!("{e}; retrying ({attempt}/{})", options.retries);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Implemented by backends which can be registered with an [`ExecutorPlugin`].
pub trait RegisteredExecutor: CopySpecExecutor + 'static {
    const NAME: &'static str;
    const ALIASES: &'static [&'static str] = &[];

    fn create() -> Arc<dyn CopySpecExecutor>;
}

/// A named executor backend.
pub struct ExecutorPlugin {
    name: &'static str,
    aliases: &'static [&'static str],
    create: fn() -> Arc<dyn CopySpecExecutor>,
}

impl ExecutorPlugin {
    pub const fn new<T: RegisteredExecutor>() -> Self {
        Self {
            name: T::NAME,
            aliases: T::ALIASES,
            create: T::create,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn matches(&self, name: &str) -> bool {
        std::iter::once(&self.name)
            .chain(self.aliases)
            .any(|n| n.eq_ignore_ascii_case(name))
    }
}

inventory::collect!(ExecutorPlugin);

/// Create the executor registered as `name` (case-insensitive).
///
/// # Errors
/// Returns [`Error::UnknownExecutor`] if no executor is registered with that name or alias.
pub fn get_executor(name: &str) -> Result<Arc<dyn CopySpecExecutor>> {
    inventory::iter::<ExecutorPlugin>
        .into_iter()
        .find(|plugin| plugin.matches(name))
        .map(|plugin| (plugin.create)())
        .ok_or_else(|| Error::UnknownExecutor(name.to_string()))
}

/// Create the executor registered as `name`, on a dedicated pool of `threads` threads if it is [`RayonExecutor`].
///
/// Other executors ignore `threads`.
///
/// # Errors
/// Returns [`Error::UnknownExecutor`] if no executor is registered with that name or alias.
pub fn get_executor_with_threads(
    name: &str,
    threads: Option<usize>,
) -> Result<Arc<dyn CopySpecExecutor>> {
    let executor = get_executor(name)?;
    match threads {
        Some(threads) if executor.name() == RayonExecutor::NAME => {
            Ok(Arc::new(RayonExecutor::with_num_threads(threads)))
        }
        _ => Ok(executor),
    }
}

/// The names of all registered executors.
pub fn registered_executors() -> Vec<&'static str> {
    let mut names: Vec<_> = inventory::iter::<ExecutorPlugin>
        .into_iter()
        .map(ExecutorPlugin::name)
        .collect();
    names.sort_unstable();
    names
}

/// An executor given by name or as an object.
#[derive(Debug, Clone)]
pub enum ExecutorSelector {
    Name(String),
    Executor(Arc<dyn CopySpecExecutor>),
}

impl Default for ExecutorSelector {
    fn default() -> Self {
        Self::Name(RayonExecutor::NAME.to_string())
    }
}

impl From<&str> for ExecutorSelector {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for ExecutorSelector {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<Arc<dyn CopySpecExecutor>> for ExecutorSelector {
    fn from(value: Arc<dyn CopySpecExecutor>) -> Self {
        Self::Executor(value)
    }
}

impl ExecutorSelector {
    pub fn resolve(&self) -> Result<Arc<dyn CopySpecExecutor>> {
        match self {
            Self::Name(name) => get_executor(name),
            Self::Executor(executor) => Ok(executor.clone()),
        }
    }
}
