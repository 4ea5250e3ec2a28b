//! Pipeline Notifier - progress reporting to a pipeline-tracking service
//!
//! The workload is described as a tree of named nodes (see
//! [`PipelineDefinition`]); state transitions are pushed to the service as
//! they happen. Reporting is best-effort observability:
//!
//! - [`RemoteNotifier`]: registers the pipeline once, then one HTTP PUT per update
//! - [`NoopNotifier`]: used when no endpoint is configured or registration failed
//!
//! [`connect`] makes the Remote/Noop choice once at startup.

mod notifier;
mod pipeline;
mod remote;

pub use notifier::{connect, Notifier, NoopNotifier};
pub use pipeline::{
    NodeSpec, NodeState, NodeStates, NodeType, NodeUpdate, PipelineDefinition, PREP_NODE,
    ROOT_NODE, WORKERS_NODE,
};
pub use remote::RemoteNotifier;
