//! Error types with error codes and fix suggestions
//!
//! Error code ranges:
//! - BP-000-009: Configuration errors (fatal before any task runs)
//! - BP-010-019: Work-item list errors
//! - BP-020-029: Dispatch errors (submission, spawn)
//! - BP-030-039: Completion errors (timeout, failed tasks, markers)
//! - BP-040-049: Notification errors (never fatal)

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatchError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// One failed task inside a single or parallel stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// 1-based batch index, `None` for a single task
    pub index: Option<usize>,
    /// Exit code recorded in the marker, `None` when it could not be read
    pub exit_code: Option<i32>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.index, self.exit_code) {
            (Some(i), Some(code)) => write!(f, "index {} exited with {}", i, code),
            (Some(i), None) => write!(f, "index {} left an unreadable marker", i),
            (None, Some(code)) => write!(f, "exited with {}", code),
            (None, None) => write!(f, "left an unreadable marker"),
        }
    }
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum BatchError {
    // ═══════════════════════════════════════════
    // CONFIGURATION ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[BP-001] Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("[BP-002] Unknown scheduler backend '{name}'")]
    UnknownBackend { name: String },

    #[error("[BP-003] Missing {what}: {}", .path.display())]
    MissingPath { what: String, path: PathBuf },

    #[error("[BP-004] Invalid argument name '{name}'")]
    InvalidArgName { name: String },

    // ═══════════════════════════════════════════
    // WORK-ITEM ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[BP-010] Cannot read work-item list {}: {reason}", .path.display())]
    WorkItems { path: PathBuf, reason: String },

    // ═══════════════════════════════════════════
    // DISPATCH ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[BP-020] Submission of {} with '{program}' failed: {reason}", .script.display())]
    SubmissionFailed {
        program: String,
        script: PathBuf,
        reason: String,
    },

    #[error("[BP-021] Failed to launch '{command}': {reason}")]
    Spawn { command: String, reason: String },

    // ═══════════════════════════════════════════
    // COMPLETION ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[BP-030] Timed out after {waited_secs}s waiting for {}", join_paths(.missing))]
    Timeout {
        missing: Vec<PathBuf>,
        waited_secs: u64,
    },

    #[error("[BP-031] Task '{task}' failed: {}", join_failures(.failures))]
    TaskFailed {
        task: String,
        failures: Vec<TaskFailure>,
    },

    #[error("[BP-032] Marker {} does not end with an exit code: {content:?}", .path.display())]
    InvalidMarker { path: PathBuf, content: String },

    // ═══════════════════════════════════════════
    // NOTIFICATION ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[BP-040] Pipeline notification failed: {reason}")]
    Notification { reason: String },

    // ═══════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BatchError {
    /// Notification problems degrade to logging; everything else aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BatchError::Notification { .. })
    }

    /// Whether this error is raised before any side effect is performed
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BatchError::Config { .. }
                | BatchError::UnknownBackend { .. }
                | BatchError::MissingPath { .. }
                | BatchError::InvalidArgName { .. }
        )
    }

    /// Failures of a `TaskFailed` error, empty for every other variant
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            BatchError::TaskFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

impl FixSuggestion for BatchError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            BatchError::Config { .. } => Some("Check batchpipe.yaml and command-line overrides"),
            BatchError::UnknownBackend { .. } => Some("Use one of: local, pbs, slurm"),
            BatchError::MissingPath { .. } => Some("Check the path exists and is readable"),
            BatchError::InvalidArgName { .. } => {
                Some("Argument names may only contain letters, digits, '_' and '-'")
            }
            BatchError::WorkItems { .. } => {
                Some("The preparatory task must write a JSON array of work items")
            }
            BatchError::SubmissionFailed { .. } => {
                Some("Check the queue is reachable and the submit command is on PATH")
            }
            BatchError::Spawn { .. } => Some("Check the command is installed and executable"),
            BatchError::Timeout { .. } => {
                Some("Increase wait.timeout_secs or check the queue for stuck jobs")
            }
            BatchError::TaskFailed { .. } => Some("Inspect the out-*.txt logs in the workdir"),
            BatchError::InvalidMarker { .. } => {
                Some("Markers are written by the job script; check it was not edited")
            }
            BatchError::Notification { .. } => None,
            BatchError::Io(_) => Some("Check file path and permissions"),
            BatchError::Json(_) => Some("Check the JSON syntax"),
            BatchError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_codes() {
        let err = BatchError::UnknownBackend {
            name: "lsf".to_string(),
        };
        assert!(err.to_string().starts_with("[BP-002]"));
        assert!(err.to_string().contains("lsf"));
    }

    #[test]
    fn task_failed_lists_every_failure() {
        let err = BatchError::TaskFailed {
            task: "process_spectra".to_string(),
            failures: vec![
                TaskFailure {
                    index: Some(2),
                    exit_code: Some(1),
                },
                TaskFailure {
                    index: Some(5),
                    exit_code: None,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("index 2 exited with 1"));
        assert!(msg.contains("index 5 left an unreadable marker"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn timeout_lists_missing_paths() {
        let err = BatchError::Timeout {
            missing: vec![PathBuf::from("/tmp/a.done"), PathBuf::from("/tmp/b.done")],
            waited_secs: 5,
        };
        assert!(err.to_string().contains("/tmp/a.done, /tmp/b.done"));
    }

    #[test]
    fn only_notification_is_non_fatal() {
        let notify = BatchError::Notification {
            reason: "HTTP 500".to_string(),
        };
        assert!(!notify.is_fatal());
        assert!(notify.fix_suggestion().is_none());

        let config = BatchError::Config {
            reason: "bad".to_string(),
        };
        assert!(config.is_fatal());
        assert!(config.is_config_error());
    }
}
