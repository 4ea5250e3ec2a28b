//! Pipeline node tree and wire types for the tracking service

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Root of the standard two-stage tree
pub const ROOT_NODE: &str = "root";
/// Preparatory task node
pub const PREP_NODE: &str = "pre_process";
/// Fan-out node; its children are added when the stage starts
pub const WORKERS_NODE: &str = "process_spectra";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Serial,
    Parallel,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Waiting,
    Running,
    Success,
    Error,
}

impl NodeState {
    fn rank(self) -> u8 {
        match self {
            NodeState::Waiting => 0,
            NodeState::Running => 1,
            NodeState::Success | NodeState::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Success | NodeState::Error)
    }

    /// Monotone transitions: WAITING → RUNNING → SUCCESS | ERROR.
    /// Re-reporting the current state is allowed.
    pub fn can_advance_to(self, next: NodeState) -> bool {
        next == self || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Waiting => "WAITING",
            NodeState::Running => "RUNNING",
            NodeState::Success => "SUCCESS",
            NodeState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Static description of one node at registration time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "type")]
    pub kind: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl NodeSpec {
    pub fn new(kind: NodeType) -> Self {
        Self {
            kind,
            name: None,
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }
}

/// Registration body: `{name, nodes}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub nodes: BTreeMap<String, NodeSpec>,
}

impl PipelineDefinition {
    /// root (SERIAL) → pre_process (TASK), process_spectra (PARALLEL)
    pub fn standard(name: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_NODE.to_string(),
            NodeSpec::new(NodeType::Serial).with_children([PREP_NODE, WORKERS_NODE]),
        );
        nodes.insert(
            PREP_NODE.to_string(),
            NodeSpec::new(NodeType::Task).named(PREP_NODE),
        );
        nodes.insert(
            WORKERS_NODE.to_string(),
            NodeSpec::new(NodeType::Parallel).named(WORKERS_NODE),
        );
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Standard tree under a fresh `pfs-{uuid}` run name
    pub fn standard_run() -> Self {
        Self::standard(format!("pfs-{}", uuid::Uuid::new_v4()))
    }

    /// Every referenced child must be defined
    pub fn validate(&self) -> Result<()> {
        for (id, node) in &self.nodes {
            if let Some(missing) = node.children.iter().find(|c| !self.nodes.contains_key(*c)) {
                return Err(BatchError::Config {
                    reason: format!(
                        "pipeline node '{}' references undefined child '{}'",
                        id, missing
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Partial node update: `{_id, state?, children?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(rename = "_id")]
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NodeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
}

impl NodeUpdate {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: None,
            children: None,
        }
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = Some(children);
        self
    }

    /// An update carrying neither state nor children is a no-op
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.children.as_ref().map_or(true, Vec::is_empty)
    }
}

/// Local mirror of node states enforcing monotone transitions
#[derive(Debug, Default)]
pub struct NodeStates {
    states: DashMap<String, NodeState>,
}

impl NodeStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `state` for `node`; `false` (and no change) for a regression
    pub fn advance(&self, node: &str, state: NodeState) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.states.entry(node.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().can_advance_to(state) {
                    e.insert(state);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(state);
                true
            }
        }
    }

    pub fn get(&self, node: &str) -> Option<NodeState> {
        self.states.get(node).map(|s| *s.value())
    }
}
