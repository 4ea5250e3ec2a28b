//! Job script rendering for batch queues
//!
//! Pure functions from tasks and a resource request to script text. Nothing
//! here touches the filesystem; [`super::queue`] writes and submits the
//! result.
//!
//! ## Array jobs
//!
//! A fan-out is submitted as one array job whose range is `1-N`. Each array
//! element runs the executor script with the scheduler's index variable. The
//! executor holds an explicit `case` table from index to command line and
//! marker, so an index outside `1..=N` exits with
//! [`UNKNOWN_INDEX_EXIT`](crate::util::constants::UNKNOWN_INDEX_EXIT) and
//! never writes a marker for a task that does not exist.

use std::fmt;
use std::fmt::Write as _;
use std::path::Path;

use crate::config::QueueConfig;
use crate::task::{Task, TaskBatch};
use crate::util::constants::UNKNOWN_INDEX_EXIT;
use crate::util::{DEFAULT_ARRAY_WALLTIME, DEFAULT_SINGLE_WALLTIME};
use crate::watch::array_marker;

use super::array_task_log;

/// Batch scheduler flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDialect {
    Pbs,
    Slurm,
}

impl QueueDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueDialect::Pbs => "pbs",
            QueueDialect::Slurm => "slurm",
        }
    }

    /// Default submission program
    pub fn submit_program(self) -> &'static str {
        match self {
            QueueDialect::Pbs => "qsub",
            QueueDialect::Slurm => "sbatch",
        }
    }

    /// Environment variable holding the array element index
    pub fn array_index_var(self) -> &'static str {
        match self {
            QueueDialect::Pbs => "PBS_ARRAYID",
            QueueDialect::Slurm => "SLURM_ARRAY_TASK_ID",
        }
    }

    fn header(self, name: &str, resources: &QueueResources, walltime: &str) -> String {
        match self {
            QueueDialect::Pbs => format!(
                "#PBS -N {}\n#PBS -l nodes={}:ppn={}\n#PBS -l walltime={}\n",
                name, resources.nodes, resources.cpus, walltime
            ),
            QueueDialect::Slurm => format!(
                "#SBATCH --job-name={}\n#SBATCH --nodes={}\n#SBATCH --cpus-per-task={}\n#SBATCH --time={}\n",
                name, resources.nodes, resources.cpus, walltime
            ),
        }
    }

    fn array_directive(self, size: usize) -> String {
        match self {
            QueueDialect::Pbs => format!("#PBS -t 1-{}\n", size),
            QueueDialect::Slurm => format!("#SBATCH --array=1-{}\n", size),
        }
    }
}

impl fmt::Display for QueueDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources requested for every job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueResources {
    pub nodes: u32,
    pub cpus: u32,
    pub single_walltime: String,
    pub array_walltime: String,
}

impl Default for QueueResources {
    fn default() -> Self {
        Self {
            nodes: 1,
            cpus: 1,
            single_walltime: DEFAULT_SINGLE_WALLTIME.to_string(),
            array_walltime: DEFAULT_ARRAY_WALLTIME.to_string(),
        }
    }
}

impl From<&QueueConfig> for QueueResources {
    fn from(config: &QueueConfig) -> Self {
        Self {
            nodes: config.nodes,
            cpus: config.cpus,
            single_walltime: config.single_walltime.clone(),
            array_walltime: config.array_walltime.clone(),
        }
    }
}

/// Parts shared by every generated job script
#[derive(Debug, Clone, Copy)]
pub struct JobHeader<'a> {
    pub name: &'a str,
    pub workdir: &'a Path,
    pub pre_commands: Option<&'a str>,
}

/// Queue job name derived from a command: its file name, restricted to
/// characters every scheduler accepts
pub fn job_name(command: &str) -> String {
    let base = Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);
    let name: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(15)
        .collect();
    if name.is_empty() {
        "batchpipe".to_string()
    } else {
        name
    }
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_./=:,+@%-".contains(c)
}

/// Quote `word` for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe_char) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

/// Quoted program followed by quoted `--key=value` flags
pub fn command_line(task: &Task) -> String {
    task.argv()
        .iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

fn preamble(out: &mut String, job: &JobHeader<'_>) {
    let _ = writeln!(out, "cd {} || exit 1", quote_path(job.workdir));
    if let Some(pre) = job.pre_commands.filter(|p| !p.trim().is_empty()) {
        out.push_str(pre.trim_end());
        out.push('\n');
    }
}

/// Script for one task: runs it, then appends its exit code to `marker`
pub fn render_single_script(
    dialect: QueueDialect,
    resources: &QueueResources,
    job: &JobHeader<'_>,
    task: &Task,
    marker: &Path,
    log: &Path,
) -> String {
    let mut out = String::from("#!/bin/bash\n");
    out.push_str(&dialect.header(job.name, resources, &resources.single_walltime));
    preamble(&mut out, job);
    let _ = writeln!(out, "{} >> {} 2>&1", command_line(task), quote_path(log));
    let _ = writeln!(out, "echo \"$?\" >> {}", quote_path(marker));
    out
}

/// Array job covering indices `1..=size`, each element running `executor`
pub fn render_array_script(
    dialect: QueueDialect,
    resources: &QueueResources,
    job: &JobHeader<'_>,
    executor: &Path,
    size: usize,
) -> String {
    let mut out = String::from("#!/bin/bash\n");
    out.push_str(&dialect.header(job.name, resources, &resources.array_walltime));
    out.push_str(&dialect.array_directive(size));
    preamble(&mut out, job);
    let _ = writeln!(
        out,
        "{} \"${{{}}}\"",
        quote_path(executor),
        dialect.array_index_var()
    );
    out
}

/// Executor mapping each index of `batch` to its command line and marker
pub fn render_executor_script(batch: &TaskBatch, workdir: &Path) -> String {
    let mut out = String::from("#!/bin/bash\n");
    let _ = writeln!(out, "# batch {}: {} tasks", batch.id, batch.len());
    out.push_str("case \"$1\" in\n");
    for (pos, task) in batch.tasks.iter().enumerate() {
        let index = task.index.unwrap_or(pos + 1);
        let log = array_task_log(workdir, &batch.id, index);
        let marker = array_marker(workdir, &batch.id, index);
        let _ = writeln!(out, "  {})", index);
        let _ = writeln!(out, "    {} >> {} 2>&1", command_line(task), quote_path(&log));
        let _ = writeln!(out, "    echo \"$?\" >> {}", quote_path(&marker));
        out.push_str("    ;;\n");
    }
    out.push_str("  *)\n");
    out.push_str("    echo \"unknown array index: $1\" >&2\n");
    let _ = writeln!(out, "    exit {}", UNKNOWN_INDEX_EXIT);
    out.push_str("    ;;\nesac\n");
    out
}
