//! Local runner - tasks as child processes of this one
//!
//! `single` spawns the command directly (or through `sh -c` when pre-commands
//! are configured) and synthesizes the marker from the exit status.
//! `parallel` runs the batch through a bounded pool built on
//! `buffer_unordered`; the whole pool is bounded by the wait timeout, and
//! children still running at that point are killed.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::script::command_line;
use super::{
    announce_batch, array_task_log, conclude_batch, empty_batch, marker_exit_code,
    prepare_batch, report_child, task_log, BatchSummary, RunContext, Runner,
};
use crate::error::{BatchError, Result, TaskFailure};
use crate::notify::NodeState;
use crate::task::{new_task_id, ParallelSpec, Task};
use crate::watch::{array_marker, single_marker, wait_for_markers, write_exit_code};

/// Exit code recorded when a task could not be launched at all
const LAUNCH_FAILURE_EXIT: i32 = 127;

/// Runs tasks on this machine
#[derive(Debug, Clone)]
pub struct LocalRunner {
    max_workers: usize,
}

impl LocalRunner {
    /// `max_workers` is clamped to at least one
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run one batch element to completion, record its marker and report
    /// its child node
    async fn run_child(
        &self,
        task: &Task,
        spec: &ParallelSpec,
        batch_id: &str,
        ctx: &RunContext,
    ) -> Result<Option<TaskFailure>> {
        let index = task.index.unwrap_or_default();
        ctx.notifier
            .set_state(&spec.child_node(index), NodeState::Running)
            .await;

        let log = array_task_log(&ctx.workdir, batch_id, index);
        let code = launch(task, ctx, &log).await;
        write_exit_code(&array_marker(&ctx.workdir, batch_id, index), code).await?;
        debug!(index, code, "task exited");
        Ok(report_child(ctx, spec, index, Some(code)).await)
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Spawn `task` with output appended to `log`, wait for it, return its exit code
async fn spawn_and_wait(task: &Task, ctx: &RunContext, log: &Path) -> Result<i32> {
    let stdout = OpenOptions::new().create(true).append(true).open(log)?;
    let stderr = stdout.try_clone()?;

    let mut command = match &ctx.pre_commands {
        Some(pre) => {
            let mut c = Command::new("sh");
            c.arg("-c")
                .arg(format!("{}\nexec {}", pre.trim_end(), command_line(task)));
            c
        }
        None => {
            let mut c = Command::new(&task.command);
            c.args(task.args.to_flags());
            c
        }
    };

    let status = command
        .current_dir(&ctx.workdir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| BatchError::Spawn {
            command: task.command.clone(),
            reason: e.to_string(),
        })?;

    Ok(exit_code(status))
}

/// Like `spawn_and_wait`, but a task that cannot be launched exits 127
async fn launch(task: &Task, ctx: &RunContext, log: &Path) -> i32 {
    match spawn_and_wait(task, ctx, log).await {
        Ok(code) => code,
        Err(e) => {
            warn!(command = %task.command, error = %e, "task could not be launched");
            LAUNCH_FAILURE_EXIT
        }
    }
}

fn missing_markers(markers: &[PathBuf]) -> Vec<PathBuf> {
    markers.iter().filter(|m| !m.exists()).cloned().collect()
}

#[async_trait]
impl Runner for LocalRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, ctx), fields(command = %task.command))]
    async fn single(&self, task: &Task, ctx: &RunContext) -> Result<()> {
        let id = new_task_id();
        let marker = single_marker(&ctx.workdir, &id);
        let log = task_log(&ctx.workdir, &id);
        ctx.registry.add(&marker);

        let code = match tokio::time::timeout(ctx.wait.timeout, launch(task, ctx, &log)).await {
            Ok(code) => code,
            Err(_) => {
                return Err(BatchError::Timeout {
                    missing: vec![marker],
                    waited_secs: ctx.wait.timeout.as_secs(),
                })
            }
        };
        write_exit_code(&marker, code).await?;

        wait_for_markers(std::slice::from_ref(&marker), &ctx.wait).await?;
        match marker_exit_code(&marker).await {
            Some(0) => Ok(()),
            exit_code => Err(BatchError::TaskFailed {
                task: task.command.clone(),
                failures: vec![TaskFailure {
                    index: None,
                    exit_code,
                }],
            }),
        }
    }

    #[instrument(skip(self, spec, ctx), fields(node = %spec.node, workers = self.max_workers))]
    async fn parallel(&self, spec: &ParallelSpec, ctx: &RunContext) -> Result<BatchSummary> {
        let batch = prepare_batch(spec)?;
        if batch.is_empty() {
            return Ok(empty_batch(ctx, spec, &batch).await);
        }
        announce_batch(ctx, spec, &batch).await;

        let markers: Vec<PathBuf> = (1..=batch.len())
            .map(|i| array_marker(&ctx.workdir, &batch.id, i))
            .collect();
        for marker in &markers {
            ctx.registry.add(marker);
        }

        let children: Vec<_> = batch
            .tasks
            .iter()
            .map(|task| self.run_child(task, spec, &batch.id, ctx))
            .collect();
        let pool = stream::iter(children)
            .buffer_unordered(self.max_workers)
            .collect::<Vec<_>>();

        let finished = match tokio::time::timeout(ctx.wait.timeout, pool).await {
            Ok(results) => results,
            Err(_) => {
                return Err(BatchError::Timeout {
                    missing: missing_markers(&markers),
                    waited_secs: ctx.wait.timeout.as_secs(),
                })
            }
        };
        let mut failures = Vec::new();
        for result in finished {
            failures.extend(result?);
        }

        wait_for_markers(&markers, &ctx.wait).await?;
        conclude_batch(ctx, spec, &batch, failures).await
    }
}
