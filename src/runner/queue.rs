//! Batch-queue runner - PBS and Slurm
//!
//! Work is handed to the cluster as generated shell scripts. The runner
//! writes the scripts into the workdir, submits them through a
//! [`Submitter`], then only polls for markers: the cluster does the
//! parallelism.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::script::{
    job_name, render_array_script, render_executor_script, render_single_script, JobHeader,
    QueueDialect, QueueResources,
};
use super::{
    announce_batch, conclude_batch, empty_batch, marker_exit_code, prepare_batch, report_child,
    task_log, BatchSummary, RunContext, Runner,
};
use crate::error::{BatchError, Result, TaskFailure};
use crate::task::{new_task_id, ParallelSpec, Task};
use crate::watch::{array_marker, single_marker, wait_for_markers};

/// One job handed to the queue
#[derive(Debug, Clone)]
pub struct Submission {
    /// Submission program (`qsub`, `sbatch` or a configured override)
    pub program: String,
    /// Job script to submit
    pub script: PathBuf,
    /// Tasks the job runs, in index order
    pub tasks: Vec<Task>,
    /// Markers the job is expected to write, one per task
    pub markers: Vec<PathBuf>,
}

/// Hands a rendered job to the queue
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, submission: &Submission) -> Result<()>;
}

/// Runs the submission program with the script path as its only argument
#[derive(Debug, Clone, Default)]
pub struct CommandSubmitter;

#[async_trait]
impl Submitter for CommandSubmitter {
    async fn submit(&self, submission: &Submission) -> Result<()> {
        let failed = |reason: String| BatchError::SubmissionFailed {
            program: submission.program.clone(),
            script: submission.script.clone(),
            reason,
        };

        let mut command = Command::new(&submission.program);
        command.arg(&submission.script);
        if let Some(dir) = submission.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = match output.status.code() {
                Some(code) if stderr.is_empty() => format!("exit status {}", code),
                Some(code) => format!("exit status {}: {}", code, stderr),
                None => format!("terminated by signal: {}", stderr),
            };
            return Err(failed(reason));
        }

        let job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(program = %submission.program, job = %job_id, tasks = submission.tasks.len(), "job submitted");
        Ok(())
    }
}

/// Runner for PBS and Slurm clusters
pub struct BatchQueueRunner {
    dialect: QueueDialect,
    resources: QueueResources,
    submit_program: String,
    submitter: Arc<dyn Submitter>,
}

impl BatchQueueRunner {
    pub fn new(dialect: QueueDialect, resources: QueueResources) -> Self {
        Self {
            dialect,
            resources,
            submit_program: dialect.submit_program().to_string(),
            submitter: Arc::new(CommandSubmitter),
        }
    }

    /// Replace `qsub` / `sbatch`
    pub fn with_submit_program(mut self, program: impl Into<String>) -> Self {
        self.submit_program = program.into();
        self
    }

    pub fn with_submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn dialect(&self) -> QueueDialect {
        self.dialect
    }

    pub fn submit_program(&self) -> &str {
        &self.submit_program
    }

    fn script_path(&self, workdir: &Path, kind: &str, id: &str) -> PathBuf {
        workdir.join(format!("{}_{}_{}.sh", self.dialect, kind, id))
    }

    async fn submit(&self, script: PathBuf, tasks: Vec<Task>, markers: Vec<PathBuf>) -> Result<()> {
        let submission = Submission {
            program: self.submit_program.clone(),
            script,
            tasks,
            markers,
        };
        debug!(script = %submission.script.display(), "submitting");
        self.submitter.submit(&submission).await
    }
}

impl std::fmt::Debug for BatchQueueRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueueRunner")
            .field("dialect", &self.dialect)
            .field("resources", &self.resources)
            .field("submit_program", &self.submit_program)
            .finish()
    }
}

/// Write a job script and register it as a temp file
async fn write_script(ctx: &RunContext, path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    ctx.registry.add(path);
    Ok(())
}

#[async_trait]
impl Runner for BatchQueueRunner {
    fn name(&self) -> &'static str {
        self.dialect.as_str()
    }

    #[instrument(skip(self, ctx), fields(backend = %self.dialect, command = %task.command))]
    async fn single(&self, task: &Task, ctx: &RunContext) -> Result<()> {
        let id = new_task_id();
        let marker = single_marker(&ctx.workdir, &id);
        let log = task_log(&ctx.workdir, &id);
        let script_path = self.script_path(&ctx.workdir, "script", &id);

        let name = job_name(&task.command);
        let header = JobHeader {
            name: &name,
            workdir: &ctx.workdir,
            pre_commands: ctx.pre_commands.as_deref(),
        };
        let script = render_single_script(self.dialect, &self.resources, &header, task, &marker, &log);
        write_script(ctx, &script_path, &script).await?;
        ctx.registry.add(&marker);

        self.submit(script_path, vec![task.clone()], vec![marker.clone()])
            .await?;

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

    #[instrument(skip(self, spec, ctx), fields(backend = %self.dialect, node = %spec.node))]
    async fn parallel(&self, spec: &ParallelSpec, ctx: &RunContext) -> Result<BatchSummary> {
        let batch = prepare_batch(spec)?;
        if batch.is_empty() {
            return Ok(empty_batch(ctx, spec, &batch).await);
        }

        let executor_path = self.script_path(&ctx.workdir, "executor", &batch.id);
        write_script(ctx, &executor_path, &render_executor_script(&batch, &ctx.workdir)).await?;

        let name = job_name(&spec.command);
        let header = JobHeader {
            name: &name,
            workdir: &ctx.workdir,
            pre_commands: ctx.pre_commands.as_deref(),
        };
        let array_path = self.script_path(&ctx.workdir, "script", &batch.id);
        let array_script = render_array_script(
            self.dialect,
            &self.resources,
            &header,
            &executor_path,
            batch.len(),
        );
        write_script(ctx, &array_path, &array_script).await?;

        let markers: Vec<PathBuf> = (1..=batch.len())
            .map(|i| array_marker(&ctx.workdir, &batch.id, i))
            .collect();
        for marker in &markers {
            ctx.registry.add(marker);
        }

        announce_batch(ctx, spec, &batch).await;
        self.submit(array_path, batch.tasks.clone(), markers.clone())
            .await?;

        wait_for_markers(&markers, &ctx.wait).await?;

        let mut failures = Vec::new();
        for (pos, marker) in markers.iter().enumerate() {
            let code = marker_exit_code(marker).await;
            if let Some(failure) = report_child(ctx, spec, pos + 1, code).await {
                failures.push(failure);
            }
        }
        conclude_batch(ctx, spec, &batch, failures).await
    }
}
