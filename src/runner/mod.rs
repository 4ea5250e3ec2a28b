//! # Runners
//!
//! Execution backends for the two pipeline stages.
//!
//! | Runner | `single` | `parallel` |
//! |--------|----------|------------|
//! | [`LocalRunner`] | child process | bounded worker pool |
//! | [`BatchQueueRunner`] (PBS) | `qsub` job script | `qsub -t 1-N` array job |
//! | [`BatchQueueRunner`] (Slurm) | `sbatch` job script | `sbatch --array=1-N` |
//!
//! Every backend follows the same completion protocol: each dispatched task
//! ends by appending its exit code to a marker file in the workdir, and the
//! runner waits for all markers with [`crate::watch::wait_for_markers`].
//!
//! ## Child nodes
//!
//! Before a fan-out is dispatched the batch node gets one child per task
//! (`{node}-{index}`, 1-based), every child is reported WAITING and the batch
//! node RUNNING. Children end SUCCESS or ERROR from their exit code.

pub mod local;
pub mod queue;
pub mod script;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

pub use local::LocalRunner;
pub use queue::{BatchQueueRunner, CommandSubmitter, Submission, Submitter};
pub use script::{QueueDialect, QueueResources};

use crate::config::PipelineConfig;
use crate::error::{BatchError, Result, TaskFailure};
use crate::notify::{NodeState, Notifier};
use crate::registry::TempFileRegistry;
use crate::task::{new_task_id, read_work_items, ParallelSpec, Task, TaskBatch};
use crate::watch::{read_exit_code, WaitOptions};

/// Backend selector, parsed case-insensitively from `scheduler`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    Local,
    Pbs,
    Slurm,
}

impl RunnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Pbs => "pbs",
            RunnerKind::Slurm => "slurm",
        }
    }

    /// Queue dialect, `None` for the local backend
    pub fn dialect(self) -> Option<QueueDialect> {
        match self {
            RunnerKind::Local => None,
            RunnerKind::Pbs => Some(QueueDialect::Pbs),
            RunnerKind::Slurm => Some(QueueDialect::Slurm),
        }
    }
}

impl FromStr for RunnerKind {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(RunnerKind::Local),
            "pbs" => Ok(RunnerKind::Pbs),
            "slurm" => Ok(RunnerKind::Slurm),
            _ => Err(BatchError::UnknownBackend {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a runner needs besides the task itself, built once per run
#[derive(Clone)]
pub struct RunContext {
    pub workdir: PathBuf,
    /// Shell lines run before each task
    pub pre_commands: Option<String>,
    pub notifier: Arc<dyn Notifier>,
    pub registry: Arc<TempFileRegistry>,
    pub wait: WaitOptions,
}

impl RunContext {
    pub fn new(
        workdir: impl Into<PathBuf>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<TempFileRegistry>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            pre_commands: None,
            notifier,
            registry,
            wait: WaitOptions::default(),
        }
    }

    pub fn with_pre_commands(mut self, pre_commands: Option<String>) -> Self {
        self.pre_commands = pre_commands.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_wait(mut self, wait: WaitOptions) -> Self {
        self.wait = wait;
        self
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("workdir", &self.workdir)
            .field("pre_commands", &self.pre_commands)
            .field("pipeline_url", &self.notifier.pipeline_url())
            .field("wait", &self.wait)
            .finish()
    }
}

/// Outcome of a successful fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: String,
    /// Number of tasks dispatched
    pub tasks: usize,
}

/// Execution backend
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one task and wait for its marker
    async fn single(&self, task: &Task, ctx: &RunContext) -> Result<()>;

    /// Run one task per work item and wait for every marker
    async fn parallel(&self, spec: &ParallelSpec, ctx: &RunContext) -> Result<BatchSummary>;
}

/// Build the runner selected by configuration
pub fn create_runner(kind: RunnerKind, config: &PipelineConfig) -> Arc<dyn Runner> {
    match kind.dialect() {
        None => Arc::new(LocalRunner::new(config.worker_count())),
        Some(dialect) => {
            let mut runner = BatchQueueRunner::new(dialect, QueueResources::from(&config.queue));
            if let Some(program) = &config.queue.submit_command {
                runner = runner.with_submit_program(program.clone());
            }
            Arc::new(runner)
        }
    }
}

/// Payload log of a single task: `{workdir}/out-{id}.txt`
pub fn task_log(workdir: &Path, task_id: &str) -> PathBuf {
    workdir.join(format!("out-{}.txt", task_id))
}

/// Payload log of one batch element: `{workdir}/out-{batch}-{index}.txt`
pub fn array_task_log(workdir: &Path, batch_id: &str, index: usize) -> PathBuf {
    workdir.join(format!("out-{}-{}.txt", batch_id, index))
}

/// Read the work-item list and build the batch under a fresh id
pub(crate) fn prepare_batch(spec: &ParallelSpec) -> Result<TaskBatch> {
    let items = read_work_items(&spec.work_items)?;
    TaskBatch::build(new_task_id(), spec, &items)
}

/// Register children, report each WAITING, then the batch node RUNNING
pub(crate) async fn announce_batch(ctx: &RunContext, spec: &ParallelSpec, batch: &TaskBatch) {
    let children: Vec<String> = (1..=batch.len()).map(|i| spec.child_node(i)).collect();
    ctx.notifier.set_children(&spec.node, children.clone()).await;
    for child in &children {
        ctx.notifier.set_state(child, NodeState::Waiting).await;
    }
    ctx.notifier.set_state(&spec.node, NodeState::Running).await;
    info!(node = %spec.node, batch = %batch.id, tasks = batch.len(), "dispatching batch");
}

/// Exit code of a marker, `None` when unreadable
pub(crate) async fn marker_exit_code(marker: &Path) -> Option<i32> {
    match read_exit_code(marker).await {
        Ok(code) => Some(code),
        Err(e) => {
            warn!(marker = %marker.display(), error = %e, "cannot read exit code");
            None
        }
    }
}

/// Report a child node from its exit code; returns the failure, if any
pub(crate) async fn report_child(
    ctx: &RunContext,
    spec: &ParallelSpec,
    index: usize,
    exit_code: Option<i32>,
) -> Option<TaskFailure> {
    let state = if exit_code == Some(0) {
        NodeState::Success
    } else {
        NodeState::Error
    };
    ctx.notifier.set_state(&spec.child_node(index), state).await;
    (state == NodeState::Error).then_some(TaskFailure {
        index: Some(index),
        exit_code,
    })
}

/// Finish a fan-out once every marker has been read
pub(crate) async fn conclude_batch(
    ctx: &RunContext,
    spec: &ParallelSpec,
    batch: &TaskBatch,
    mut failures: Vec<TaskFailure>,
) -> Result<BatchSummary> {
    if !failures.is_empty() {
        failures.sort_by_key(|f| f.index);
        return Err(BatchError::TaskFailed {
            task: spec.node.clone(),
            failures,
        });
    }
    ctx.notifier.set_state(&spec.node, NodeState::Success).await;
    info!(node = %spec.node, batch = %batch.id, tasks = batch.len(), "batch complete");
    Ok(BatchSummary {
        batch_id: batch.id.clone(),
        tasks: batch.len(),
    })
}

/// Empty work-item list: nothing to dispatch, the stage trivially succeeds
pub(crate) async fn empty_batch(
    ctx: &RunContext,
    spec: &ParallelSpec,
    batch: &TaskBatch,
) -> BatchSummary {
    info!(node = %spec.node, "empty work-item list, nothing to dispatch");
    ctx.notifier.set_state(&spec.node, NodeState::Success).await;
    BatchSummary {
        batch_id: batch.id.clone(),
        tasks: 0,
    }
}
