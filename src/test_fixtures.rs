//! Test fixtures shared by unit and integration tests
//!
//! Enabled for `cfg(test)` and through the `test-fixtures` feature.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::notify::{NodeState, NodeStates, NodeUpdate, Notifier};

/// Notifier that records every non-empty update and tracks node states
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<NodeUpdate>>,
    states: NodeStates,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded updates, in order
    pub fn updates(&self) -> Vec<NodeUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// Updates addressed to `node`
    pub fn updates_for(&self, node: &str) -> Vec<NodeUpdate> {
        self.updates()
            .into_iter()
            .filter(|u| u.node == node)
            .collect()
    }

    /// States reported for `node`, in order
    pub fn states_of(&self, node: &str) -> Vec<NodeState> {
        self.updates_for(node)
            .into_iter()
            .filter_map(|u| u.state)
            .collect()
    }

    /// Last accepted state of `node`
    pub fn state_of(&self, node: &str) -> Option<NodeState> {
        self.states.get(node)
    }

    /// Last children list registered for `node`
    pub fn children_of(&self, node: &str) -> Option<Vec<String>> {
        self.updates_for(node)
            .into_iter()
            .filter_map(|u| u.children)
            .last()
    }

    /// Position of the first update matching `node` and `state`
    pub fn position(&self, node: &str, state: NodeState) -> Option<usize> {
        self.updates()
            .iter()
            .position(|u| u.node == node && u.state == Some(state))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn update(&self, update: NodeUpdate) {
        if update.is_empty() {
            return;
        }
        if let Some(state) = update.state {
            self.states.advance(&update.node, state);
        }
        self.updates.lock().unwrap().push(update);
    }
}
