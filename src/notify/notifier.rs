//! Notifier trait - abstraction over pipeline progress reporting
//!
//! Enables dependency injection: [`RemoteNotifier`] in production,
//! [`NoopNotifier`] when tracking is off, a recording fake in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::pipeline::{NodeState, NodeUpdate, PipelineDefinition};
use super::remote::RemoteNotifier;

/// Sink for pipeline node updates. Delivery is best-effort: implementations
/// log failures and never return them.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push a partial update; empty updates are ignored
    async fn update(&self, update: NodeUpdate);

    /// URL of the registered pipeline, if any
    fn pipeline_url(&self) -> Option<&str> {
        None
    }

    async fn set_state(&self, node: &str, state: NodeState) {
        self.update(NodeUpdate::new(node).with_state(state)).await;
    }

    async fn set_children(&self, node: &str, children: Vec<String>) {
        self.update(NodeUpdate::new(node).with_children(children))
            .await;
    }
}

/// Notifier that does nothing
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl NoopNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for NoopNotifier {
    async fn update(&self, _update: NodeUpdate) {}
}

/// Pick the notifier for this run: Remote when `url` is set and registration
/// succeeds, Noop otherwise. Registration is attempted exactly once.
pub async fn connect(url: Option<&str>, definition: &PipelineDefinition) -> Arc<dyn Notifier> {
    let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
        debug!("no tracking endpoint configured, notifications disabled");
        return Arc::new(NoopNotifier::new());
    };

    match RemoteNotifier::register(url, definition).await {
        Ok(remote) => Arc::new(remote),
        Err(e) => {
            warn!(url, error = %e, "cannot register pipeline, using no-op notifier");
            Arc::new(NoopNotifier::new())
        }
    }
}
