//! batchpipe - two-stage batch pipeline dispatcher
//!
//! Runs a preparatory task, then fans out one worker task per work item on a
//! local pool or a PBS/Slurm cluster, and reports progress to a
//! pipeline-tracking service.
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      APPLICATION LAYER                       │
//! │  orchestrator  Run state machine (prep → workers)            │
//! │  runner/       Local, PBS and Slurm backends                 │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DOMAIN MODEL                          │
//! │  task          Task, TaskArgs, TaskBatch, work items         │
//! │  notify/       Pipeline node tree, Notifier trait            │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    INFRASTRUCTURE LAYER                      │
//! │  watch         Completion markers                            │
//! │  registry      Scoped temp files                             │
//! │  config        YAML configuration                            │
//! │  util/         Constants, path normalization                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`orchestrator`] | Drives both stages, notifies transitions, cleans up |
//! | [`runner`] | `single` / `parallel` per backend, job script rendering |
//! | [`task`] | Argument maps, batches, work-item lists |
//! | [`notify`] | Remote (HTTP) or no-op progress reporting |
//! | [`watch`] | Marker polling with timeout |
//! | [`registry`] | Deletes temp files at scope exit |
//! | [`config`] | `batchpipe.yaml`, environment, overrides |
//! | [`error`] | Error types with fix suggestions |

// ═══════════════════════════════════════════════════════════════
// APPLICATION LAYER
// ═══════════════════════════════════════════════════════════════
pub mod orchestrator;
pub mod runner;

// ═══════════════════════════════════════════════════════════════
// DOMAIN MODEL
// ═══════════════════════════════════════════════════════════════
pub mod notify;
pub mod task;

// ═══════════════════════════════════════════════════════════════
// INFRASTRUCTURE LAYER
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;
pub mod registry;
pub mod util;
pub mod watch;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod test_fixtures;

// ═══════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════
pub use config::{ConfigOverrides, LogLevel, PipelineConfig};
pub use error::{BatchError, FixSuggestion, Result, TaskFailure};
pub use notify::{NodeState, NoopNotifier, Notifier, PipelineDefinition, RemoteNotifier};
pub use orchestrator::{Orchestrator, RunReport, RunState};
pub use registry::TempFileRegistry;
pub use runner::{
    create_runner, BatchQueueRunner, BatchSummary, LocalRunner, RunContext, Runner, RunnerKind,
};
pub use task::{ParallelSpec, Task, TaskArgs, TaskBatch};
pub use watch::{wait_for_markers, WaitOptions};
