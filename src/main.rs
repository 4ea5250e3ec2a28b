//! batchpipe CLI - two-stage batch pipeline dispatcher

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use batchpipe::config::{ConfigOverrides, PipelineConfig};
use batchpipe::error::{BatchError, FixSuggestion, Result};
use batchpipe::notify::WORKERS_NODE;
use batchpipe::orchestrator::Orchestrator;
use batchpipe::runner::script::{
    job_name, render_array_script, render_executor_script, JobHeader, QueueResources,
};
use batchpipe::runner::RunnerKind;
use batchpipe::task::{new_task_id, read_work_items, ParallelSpec, TaskArgs, TaskBatch};
use batchpipe::util::abspath;

#[derive(Parser)]
#[command(name = "batchpipe")]
#[command(about = "batchpipe - dispatch a prep task and its worker fan-out to local, PBS or Slurm")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run(RunArgs),

    /// Load and check the configuration without running anything
    Validate {
        /// Config file (default: ./batchpipe.yaml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the array job and executor scripts for a work-item list
    Render(RenderArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Config file (default: ./batchpipe.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend: local, pbs, slurm
    #[arg(short, long)]
    scheduler: Option<String>,

    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long)]
    logdir: Option<PathBuf>,

    /// CRITICAL, ERROR, WARNING, INFO or DEBUG
    #[arg(long)]
    loglevel: Option<String>,

    /// Shell lines run before each task
    #[arg(long)]
    pre_commands: Option<String>,

    #[arg(long)]
    spectra_path: Option<String>,

    #[arg(long)]
    bunch_size: Option<u32>,

    /// Base URL of the pipeline-tracking service
    #[arg(long)]
    notification_url: Option<String>,

    /// Keep job scripts, markers and lists after the run
    #[arg(long)]
    keep_temp: bool,
}

impl RunArgs {
    fn overrides(self) -> (Option<PathBuf>, ConfigOverrides) {
        (
            self.config,
            ConfigOverrides {
                scheduler: self.scheduler,
                workdir: self.workdir,
                logdir: self.logdir,
                loglevel: self.loglevel,
                pre_commands: self.pre_commands,
                spectra_path: self.spectra_path,
                bunch_size: self.bunch_size,
                notification_url: self.notification_url,
                keep_temp: self.keep_temp,
            },
        )
    }
}

#[derive(Args)]
struct RenderArgs {
    /// Queue backend: pbs or slurm
    #[arg(short, long)]
    scheduler: String,

    /// Worker command
    #[arg(long)]
    command: String,

    /// JSON array of work items
    #[arg(long)]
    work_items: PathBuf,

    /// Argument receiving each work item
    #[arg(long)]
    arg: String,

    /// Argument made distinct per task (base + index)
    #[arg(long)]
    seq_arg: Option<String>,

    /// Base argument, repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Config file providing queue resources and pre-commands
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => {
            let (config, overrides) = args.overrides();
            run_pipeline(config.as_deref(), overrides).await
        }
        Commands::Validate { config } => {
            init_tracing("warn");
            validate_config(config.as_deref())
        }
        Commands::Render(args) => {
            init_tracing("warn");
            render_scripts(args)
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    Ok(PipelineConfig::load(path)?.with_env())
}

async fn run_pipeline(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<()> {
    let config = overrides.apply(load_config(config_path)?);
    init_tracing(
        config
            .log_level()
            .map(|level| level.filter_directive())
            .unwrap_or("warn"),
    );

    println!(
        "{} Using scheduler: {} | workdir: {}",
        "→".cyan(),
        config.scheduler.cyan().bold(),
        config.workdir().display().to_string().cyan()
    );

    let orchestrator = Orchestrator::from_config(config).await?;
    if let Some(url) = orchestrator.notifier().pipeline_url() {
        println!("{} Tracking: {}", "→".cyan(), url);
    }

    let report = orchestrator.run().await?;
    println!(
        "{} Pipeline finished: {} tasks in {:.1}s",
        "✓".green(),
        report.tasks_dispatched,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;

    println!("{} Configuration is valid", "✓".green());
    println!("  Scheduler: {}", config.runner_kind()?);
    println!("  Workdir: {}", config.workdir().display());
    println!("  Logdir: {}", config.logdir().display());
    println!("  Log level: {}", config.log_level()?);
    println!(
        "  Notification: {}",
        config.notification_url.as_deref().unwrap_or("(disabled)")
    );
    println!("  Keep temp files: {}", config.keep_temp_files());
    Ok(())
}

fn parse_assignment(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=').ok_or_else(|| BatchError::Config {
        reason: format!("--set expects KEY=VALUE, got '{}'", raw),
    })
}

fn render_scripts(args: RenderArgs) -> Result<()> {
    let kind: RunnerKind = args.scheduler.parse()?;
    let dialect = kind.dialect().ok_or_else(|| BatchError::Config {
        reason: "render needs a queue backend (pbs or slurm)".to_string(),
    })?;

    let config = match args.config.as_deref() {
        Some(path) => Some(PipelineConfig::load(Some(path))?),
        None => None,
    };
    let resources = config
        .as_ref()
        .map(|c| QueueResources::from(&c.queue))
        .unwrap_or_default();
    let pre_commands = config.as_ref().and_then(|c| c.pre_commands.as_deref());

    let mut base = TaskArgs::new();
    for raw in &args.set {
        let (key, value) = parse_assignment(raw)?;
        base.insert(key, value)?;
    }

    let mut spec = ParallelSpec::new(
        WORKERS_NODE,
        args.command.as_str(),
        abspath(&args.work_items),
        args.arg.as_str(),
        base,
    );
    if let Some(seq) = args.seq_arg {
        spec = spec.with_sequence_arg(seq);
    }

    let items = read_work_items(&spec.work_items)?;
    if items.is_empty() {
        return Err(BatchError::WorkItems {
            path: spec.work_items.clone(),
            reason: "the list is empty, nothing to render".to_string(),
        });
    }
    let batch = TaskBatch::build(new_task_id(), &spec, &items)?;

    let workdir = abspath(&args.workdir);
    let executor = workdir.join(format!("{}_executor_{}.sh", dialect, batch.id));
    let name = job_name(&spec.command);
    let header = JobHeader {
        name: &name,
        workdir: &workdir,
        pre_commands,
    };

    println!("# ── {} ──", workdir.join(format!("{}_script_{}.sh", dialect, batch.id)).display());
    print!(
        "{}",
        render_array_script(dialect, &resources, &header, &executor, batch.len())
    );
    println!();
    println!("# ── {} ──", executor.display());
    print!("{}", render_executor_script(&batch, &workdir));
    Ok(())
}
