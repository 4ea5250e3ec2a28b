//! batchpipe Configuration Module
//!
//! Pipeline settings are read from a YAML file (`batchpipe.yaml` in the
//! current directory by default) and can be overridden from the environment
//! and the command line.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Command-line flags ([`ConfigOverrides`])
//! 2. Environment variables (`BATCHPIPE_NOTIFICATION_URL`)
//! 3. Config file
//! 4. Defaults

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};
use crate::runner::RunnerKind;
use crate::util::constants::NOTIFICATION_URL_ENV;
use crate::util::{abspath, DEFAULT_ARRAY_WALLTIME, DEFAULT_SINGLE_WALLTIME};
use crate::watch::WaitOptions;

/// Config file looked up in the current directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "batchpipe.yaml";

static WALLTIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+:[0-5]\d:[0-5]\d$").expect("valid regex"));

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Backend name: local, pbs or slurm
    pub scheduler: String,
    pub workdir: PathBuf,
    /// Defaults to `{workdir}/logdir`
    pub logdir: Option<PathBuf>,
    /// CRITICAL, ERROR, WARNING, INFO or DEBUG
    pub loglevel: String,
    /// Shell lines run before each task (module loads, venv activation)
    pub pre_commands: Option<String>,
    /// Where the payload finds its input, relative to workdir
    pub spectra_path: String,
    /// Maximum number of work items per fan-out task
    pub bunch_size: Option<u32>,
    /// Base URL of the pipeline-tracking service
    pub notification_url: Option<String>,
    /// Keep scripts, markers and lists after the run
    pub keep_temp: bool,
    /// Local worker pool size, defaults to the CPU count
    pub max_workers: Option<usize>,
    pub wait: WaitConfig,
    pub queue: QueueConfig,
    pub commands: StageCommands,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scheduler: "local".to_string(),
            workdir: PathBuf::from("."),
            logdir: None,
            loglevel: "WARNING".to_string(),
            pre_commands: None,
            spectra_path: "spectra".to_string(),
            bunch_size: None,
            notification_url: None,
            keep_temp: false,
            max_workers: None,
            wait: WaitConfig::default(),
            queue: QueueConfig::default(),
            commands: StageCommands::default(),
        }
    }
}

/// Completion watcher settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    pub poll_interval_secs: u64,
    /// Unbounded when absent
    pub timeout_secs: Option<u64>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            timeout_secs: None,
        }
    }
}

/// Batch queue resource request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Overrides `qsub` / `sbatch`
    pub submit_command: Option<String>,
    pub nodes: u32,
    pub cpus: u32,
    pub single_walltime: String,
    pub array_walltime: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            submit_command: None,
            nodes: 1,
            cpus: 1,
            single_walltime: DEFAULT_SINGLE_WALLTIME.to_string(),
            array_walltime: DEFAULT_ARRAY_WALLTIME.to_string(),
        }
    }
}

/// Commands run by each stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StageCommands {
    pub pre_process: String,
    pub process_spectra: String,
}

impl Default for StageCommands {
    fn default() -> Self {
        Self {
            pre_process: "pre_process".to_string(),
            process_spectra: "process_spectra".to_string(),
        }
    }
}

/// Log level names accepted in `loglevel`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    NotSet,
}

impl LogLevel {
    /// `tracing_subscriber::EnvFilter` directive for this level
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::NotSet => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" | "FATAL" => Ok(LogLevel::Critical),
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "NOTSET" => Ok(LogLevel::NotSet),
            _ => Err(BatchError::Config {
                reason: format!("unknown log level '{}'", s),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::NotSet => "NOTSET",
        };
        f.write_str(s)
    }
}

impl PipelineConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `./batchpipe.yaml` is used
    /// when present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) if !p.exists() => {
                return Err(BatchError::MissingPath {
                    what: "config file".to_string(),
                    path: p.to_path_buf(),
                })
            }
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|e| BatchError::Config {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| BatchError::Config {
            reason: format!("failed to parse config: {}", e),
        })
    }

    /// Merge with environment variables
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var(NOTIFICATION_URL_ENV) {
            if !url.is_empty() {
                self.notification_url = Some(url);
            }
        }
        self
    }

    /// Check every value that would otherwise fail mid-run
    pub fn validate(&self) -> Result<()> {
        self.runner_kind()?;
        self.log_level()?;

        for (name, value) in [
            ("queue.single_walltime", &self.queue.single_walltime),
            ("queue.array_walltime", &self.queue.array_walltime),
        ] {
            if !WALLTIME_RE.is_match(value) {
                return Err(BatchError::Config {
                    reason: format!("{} must look like HH:MM:SS, got '{}'", name, value),
                });
            }
        }

        if self.queue.nodes == 0 || self.queue.cpus == 0 {
            return Err(BatchError::Config {
                reason: "queue.nodes and queue.cpus must be at least 1".to_string(),
            });
        }
        if self.wait.poll_interval_secs == 0 {
            return Err(BatchError::Config {
                reason: "wait.poll_interval_secs must be at least 1".to_string(),
            });
        }
        if self.max_workers == Some(0) {
            return Err(BatchError::Config {
                reason: "max_workers must be at least 1".to_string(),
            });
        }
        if self.bunch_size == Some(0) {
            return Err(BatchError::Config {
                reason: "bunch_size must be at least 1".to_string(),
            });
        }
        for (name, command) in [
            ("commands.pre_process", &self.commands.pre_process),
            ("commands.process_spectra", &self.commands.process_spectra),
        ] {
            if command.trim().is_empty() {
                return Err(BatchError::Config {
                    reason: format!("{} must not be empty", name),
                });
            }
        }

        let workdir = self.workdir();
        if !workdir.is_dir() {
            return Err(BatchError::MissingPath {
                what: "workdir".to_string(),
                path: workdir,
            });
        }
        Ok(())
    }

    pub fn runner_kind(&self) -> Result<RunnerKind> {
        self.scheduler.parse()
    }

    pub fn log_level(&self) -> Result<LogLevel> {
        self.loglevel.parse()
    }

    /// Absolute, normalized working directory
    pub fn workdir(&self) -> PathBuf {
        abspath(&self.workdir)
    }

    /// Absolute, normalized log directory
    pub fn logdir(&self) -> PathBuf {
        match &self.logdir {
            Some(dir) => abspath(dir),
            None => self.workdir().join("logdir"),
        }
    }

    /// Keep temp files when asked to, or when debugging
    pub fn keep_temp_files(&self) -> bool {
        self.keep_temp || matches!(self.log_level(), Ok(LogLevel::Debug) | Ok(LogLevel::NotSet))
    }

    pub fn wait_options(&self) -> WaitOptions {
        let defaults = WaitOptions::default();
        WaitOptions {
            timeout: self
                .wait
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            poll_interval: Duration::from_secs(self.wait.poll_interval_secs),
        }
    }

    /// Local worker pool size
    pub fn worker_count(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Command-line overrides, applied on top of file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub scheduler: Option<String>,
    pub workdir: Option<PathBuf>,
    pub logdir: Option<PathBuf>,
    pub loglevel: Option<String>,
    pub pre_commands: Option<String>,
    pub spectra_path: Option<String>,
    pub bunch_size: Option<u32>,
    pub notification_url: Option<String>,
    pub keep_temp: bool,
}

impl ConfigOverrides {
    pub fn apply(self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(v) = self.scheduler {
            config.scheduler = v;
        }
        if let Some(v) = self.workdir {
            config.workdir = v;
        }
        if let Some(v) = self.logdir {
            config.logdir = Some(v);
        }
        if let Some(v) = self.loglevel {
            config.loglevel = v;
        }
        if let Some(v) = self.pre_commands {
            config.pre_commands = Some(v);
        }
        if let Some(v) = self.spectra_path {
            config.spectra_path = v;
        }
        if let Some(v) = self.bunch_size {
            config.bunch_size = Some(v);
        }
        if let Some(v) = self.notification_url {
            config.notification_url = Some(v);
        }
        if self.keep_temp {
            config.keep_temp = true;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.runner_kind().unwrap(), RunnerKind::Local);
        assert_eq!(config.log_level().unwrap(), LogLevel::Warning);
        assert!(!config.keep_temp_files());
    }

    #[test]
    fn parse_full_yaml() {
        let config = PipelineConfig::from_yaml(
            r#"
scheduler: pbs
workdir: /data/run1
loglevel: INFO
pre_commands: "source /opt/env.sh"
bunch_size: 8
notification_url: http://tracker:8080
wait:
  poll_interval_secs: 5
  timeout_secs: 3600
queue:
  nodes: 2
  cpus: 4
  array_walltime: "02:00:00"
commands:
  process_spectra: /opt/bin/process_spectra
"#,
        )
        .unwrap();

        assert_eq!(config.runner_kind().unwrap(), RunnerKind::Pbs);
        assert_eq!(config.bunch_size, Some(8));
        assert_eq!(config.queue.cpus, 4);
        assert_eq!(config.queue.single_walltime, DEFAULT_SINGLE_WALLTIME);
        assert_eq!(config.commands.pre_process, "pre_process");
        assert_eq!(config.commands.process_spectra, "/opt/bin/process_spectra");
        assert_eq!(config.logdir(), PathBuf::from("/data/run1/logdir"));

        let wait = config.wait_options();
        assert_eq!(wait.poll_interval, Duration::from_secs(5));
        assert_eq!(wait.timeout, Duration::from_secs(3600));
    }

    #[test]
    fn relative_dirs_are_made_absolute() {
        let config = PipelineConfig::from_yaml("workdir: sub/./run\nlogdir: logs\n").unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(config.workdir(), cwd.join("sub").join("run"));
        assert_eq!(config.logdir(), cwd.join("logs"));

        let config = PipelineConfig::default();
        assert!(config.workdir().is_absolute());
        assert_eq!(config.logdir(), config.workdir().join("logdir"));
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(
            PipelineConfig::from_yaml("").unwrap(),
            PipelineConfig::default()
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PipelineConfig::from_yaml("schedular: pbs").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn unknown_backend_fails_validation() {
        let config = PipelineConfig {
            scheduler: "condor".to_string(),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            BatchError::UnknownBackend { .. }
        ));
    }

    #[test]
    fn bad_walltime_fails_validation() {
        let mut config = PipelineConfig::default();
        config.queue.single_walltime = "5 minutes".to_string();
        assert!(config.validate().is_err());
        config.queue.single_walltime = "100:00:00".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn missing_workdir_fails_validation() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            workdir: dir.path().join("absent"),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            BatchError::MissingPath { .. }
        ));
    }

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("fatal".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Warning.filter_directive(), "warn");
    }

    #[test]
    fn debug_level_keeps_temp_files() {
        let config = PipelineConfig {
            loglevel: "DEBUG".to_string(),
            ..PipelineConfig::default()
        };
        assert!(config.keep_temp_files());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = PipelineConfig::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, BatchError::MissingPath { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batchpipe.yaml");
        std::fs::write(&path, "scheduler: slurm\nkeep_temp: true\n").unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.runner_kind().unwrap(), RunnerKind::Slurm);
        assert!(config.keep_temp_files());
    }

    #[test]
    fn overrides_win() {
        let overrides = ConfigOverrides {
            scheduler: Some("slurm".to_string()),
            bunch_size: Some(3),
            keep_temp: true,
            ..ConfigOverrides::default()
        };
        let config = overrides.apply(PipelineConfig::default());
        assert_eq!(config.scheduler, "slurm");
        assert_eq!(config.bunch_size, Some(3));
        assert!(config.keep_temp);
    }

    #[test]
    fn worker_count_defaults_to_cpus() {
        let config = PipelineConfig::default();
        assert!(config.worker_count() >= 1);
        let config = PipelineConfig {
            max_workers: Some(3),
            ..PipelineConfig::default()
        };
        assert_eq!(config.worker_count(), 3);
    }
}
