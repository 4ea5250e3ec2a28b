//! Orchestrator - drives the two-stage run
//!
//! ```text
//! Init → PrepRunning → PrepDone → WorkersRunning → DoneSuccess
//!            │                          │
//!            └──────────────┬───────────┘
//!                           ▼
//!                       DoneError
//! ```
//!
//! The prep stage writes a JSON list of work items; the worker stage fans
//! out one task per item. The temp-file registry is closed on every exit
//! path, before the result is returned.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::notify::{self, NodeState, Notifier, PipelineDefinition, PREP_NODE, ROOT_NODE, WORKERS_NODE};
use crate::registry::TempFileRegistry;
use crate::runner::{create_runner, RunContext, Runner};
use crate::task::{new_task_id, ParallelSpec, Task, TaskArgs};

/// Argument receiving each work item in the worker stage
pub const WORK_ITEM_ARG: &str = "spectra_listfile";
/// Argument made distinct per worker (`output-1`, `output-2`, ...)
pub const SEQUENCE_ARG: &str = "output_dir";
/// Base of the per-worker sequence argument
pub const SEQUENCE_BASE: &str = "output-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Init,
    PrepRunning,
    PrepDone,
    WorkersRunning,
    DoneSuccess,
    DoneError,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::DoneSuccess | RunState::DoneError)
    }

    /// Pipeline node whose stage is active in this state
    fn stage_node(self) -> Option<&'static str> {
        match self {
            RunState::PrepRunning => Some(PREP_NODE),
            RunState::WorkersRunning => Some(WORKERS_NODE),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::PrepRunning => "PREP_RUNNING",
            RunState::PrepDone => "PREP_DONE",
            RunState::WorkersRunning => "WORKERS_RUNNING",
            RunState::DoneSuccess => "DONE_SUCCESS",
            RunState::DoneError => "DONE_ERROR",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    /// Every state visited, starting with `Init`
    pub history: Vec<RunState>,
    /// Prep task plus every worker task
    pub tasks_dispatched: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Progress {
    history: Vec<RunState>,
}

impl Progress {
    fn new() -> Self {
        Self {
            history: vec![RunState::Init],
        }
    }

    fn state(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Init)
    }

    fn advance(&mut self, next: RunState) {
        debug!(from = %self.state(), to = %next, "run state");
        self.history.push(next);
    }
}

/// Runs the prep stage then the worker stage with one runner and one notifier
pub struct Orchestrator {
    config: PipelineConfig,
    runner: Arc<dyn Runner>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<TempFileRegistry>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, runner: Arc<dyn Runner>, notifier: Arc<dyn Notifier>) -> Self {
        let registry = Arc::new(TempFileRegistry::with_keep(config.keep_temp_files()));
        Self {
            config,
            runner,
            notifier,
            registry,
        }
    }

    /// Validate `config`, build its runner and register the pipeline.
    ///
    /// Configuration errors surface here, before any task runs. A failed
    /// registration degrades to the no-op notifier.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let runner = create_runner(config.runner_kind()?, &config);
        let definition = PipelineDefinition::standard_run();
        let notifier = notify::connect(config.notification_url.as_deref(), &definition).await;
        Ok(Self::new(config, runner, notifier))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn registry(&self) -> &Arc<TempFileRegistry> {
        &self.registry
    }

    /// Context handed to the runner for both stages
    pub fn run_context(&self) -> RunContext {
        RunContext::new(
            self.config.workdir(),
            Arc::clone(&self.notifier),
            Arc::clone(&self.registry),
        )
        .with_pre_commands(self.config.pre_commands.clone())
        .with_wait(self.config.wait_options())
    }

    fn common_args(&self) -> Result<TaskArgs> {
        let level = self.config.log_level()?;
        TaskArgs::new()
            .with("workdir", self.config.workdir().display())?
            .with("logdir", self.config.logdir().display())?
            .with("loglevel", level)
    }

    /// Prep task writing the work-item list to `bunch_list`
    pub fn prep_task(&self, bunch_list: &Path) -> Result<Task> {
        let mut args = self.common_args()?;
        if let Some(size) = self.config.bunch_size {
            args.insert("bunch_size", size)?;
        }
        args.insert("spectra_path", &self.config.spectra_path)?;
        args.insert("bunch_list", bunch_list.display())?;
        Ok(Task::new(self.config.commands.pre_process.as_str(), args))
    }

    /// Worker fan-out over the items listed in `bunch_list`
    pub fn worker_spec(&self, bunch_list: &Path) -> Result<ParallelSpec> {
        let mut args = self.common_args()?;
        args.insert("spectra_path", &self.config.spectra_path)?;
        args.insert(SEQUENCE_ARG, SEQUENCE_BASE)?;
        Ok(ParallelSpec::new(
            WORKERS_NODE,
            self.config.commands.process_spectra.as_str(),
            bunch_list,
            WORK_ITEM_ARG,
            args,
        )
        .with_sequence_arg(SEQUENCE_ARG))
    }

    /// Run both stages to completion
    #[instrument(skip(self), fields(runner = self.runner.name()))]
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let mut progress = Progress::new();

        let outcome = self.drive(&mut progress).await;

        let outcome = match outcome {
            Ok(tasks_dispatched) => {
                progress.advance(RunState::DoneSuccess);
                Ok(tasks_dispatched)
            }
            Err(e) => {
                if let Some(node) = progress.state().stage_node() {
                    self.notifier.set_state(node, NodeState::Error).await;
                }
                self.notifier.set_state(ROOT_NODE, NodeState::Error).await;
                error!(state = %progress.state(), error = %e, "run failed");
                progress.advance(RunState::DoneError);
                Err(e)
            }
        };

        let removed = self.registry.close();
        debug!(removed, "temp files cleaned up");

        let tasks_dispatched = outcome?;
        let elapsed = started.elapsed();
        info!(tasks = tasks_dispatched, elapsed_ms = elapsed.as_millis() as u64, "run complete");
        Ok(RunReport {
            state: progress.state(),
            history: progress.history,
            tasks_dispatched,
            elapsed,
        })
    }

    async fn drive(&self, progress: &mut Progress) -> Result<usize> {
        let ctx = self.run_context();
        tokio::fs::create_dir_all(self.config.logdir()).await?;

        let bunch_list = ctx.workdir.join(format!("list_{}.json", new_task_id()));
        self.registry.add(&bunch_list);
        let prep = self.prep_task(&bunch_list)?;

        progress.advance(RunState::PrepRunning);
        self.notifier.set_state(ROOT_NODE, NodeState::Running).await;
        self.notifier.set_state(PREP_NODE, NodeState::Running).await;
        info!(command = %prep.command, "prep stage started");
        self.runner.single(&prep, &ctx).await?;
        self.notifier.set_state(PREP_NODE, NodeState::Success).await;
        progress.advance(RunState::PrepDone);

        let spec = self.worker_spec(&bunch_list)?;
        progress.advance(RunState::WorkersRunning);
        info!(command = %spec.command, "worker stage started");
        let summary = self.runner.parallel(&spec, &ctx).await?;

        self.notifier.set_state(ROOT_NODE, NodeState::Success).await;
        Ok(summary.tasks + 1)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runner", &self.runner.name())
            .field("workdir", &self.config.workdir())
            .field("pipeline_url", &self.notifier.pipeline_url())
            .finish()
    }
}
