//! Task model - commands, ordered arguments, batches
//!
//! A [`Task`] is a command plus an ordered set of named arguments, rendered
//! on the command line as `--key=value` flags. A [`TaskBatch`] pairs a base
//! task with every element of a work-item list to build the fan-out stage.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{BatchError, Result};

/// Argument names embedded in job scripts as `--name=value`
static ARG_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid regex"));

/// Keys carried in argument maps for the dispatcher only, never passed to tasks
pub const META_KEYS: &[&str] = &["pre_commands", "notifier"];

/// Validate an argument name
pub fn validate_arg_name(name: &str) -> Result<()> {
    if ARG_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(BatchError::InvalidArgName {
            name: name.to_string(),
        })
    }
}

/// Fresh collision-resistant id for a task or batch
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Insertion-ordered argument map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArgs {
    entries: Vec<(String, String)>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing an existing entry in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) -> Result<()> {
        let name = name.into();
        validate_arg_name(&name)?;
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        Ok(())
    }

    /// Builder form of [`TaskArgs::insert`]
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `--key=value` flags in insertion order, meta-only keys excluded
    pub fn to_flags(&self) -> Vec<String> {
        self.iter()
            .filter(|(k, _)| !META_KEYS.contains(k))
            .map(|(k, v)| format!("--{}={}", k, v))
            .collect()
    }
}

impl FromIterator<(String, String)> for TaskArgs {
    /// Collect without validation; use [`TaskArgs::insert`] for untrusted names
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut args = TaskArgs::new();
        for (k, v) in iter {
            match args.entries.iter_mut().find(|(name, _)| *name == k) {
                Some(entry) => entry.1 = v,
                None => args.entries.push((k, v)),
            }
        }
        args
    }
}

/// One unit of work: a command and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub command: String,
    pub args: TaskArgs,
    /// 1-based position inside a batch
    pub index: Option<usize>,
}

impl Task {
    pub fn new(command: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            command: command.into(),
            args,
            index: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Program followed by its flags
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.to_flags());
        argv
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Description of a fan-out stage, before the work-item list is read
#[derive(Debug, Clone)]
pub struct ParallelSpec {
    /// Pipeline node id of the batch
    pub node: String,
    pub command: String,
    /// JSON array file listing the work items
    pub work_items: PathBuf,
    /// Argument receiving each work item
    pub primary_arg: String,
    /// Argument receiving `base + index`, base taken from `args`
    pub sequence_arg: Option<String>,
    pub args: TaskArgs,
}

impl ParallelSpec {
    pub fn new(
        node: impl Into<String>,
        command: impl Into<String>,
        work_items: impl Into<PathBuf>,
        primary_arg: impl Into<String>,
        args: TaskArgs,
    ) -> Self {
        Self {
            node: node.into(),
            command: command.into(),
            work_items: work_items.into(),
            primary_arg: primary_arg.into(),
            sequence_arg: None,
            args,
        }
    }

    pub fn with_sequence_arg(mut self, name: impl Into<String>) -> Self {
        self.sequence_arg = Some(name.into());
        self
    }

    /// Pipeline node id of the child at `index`
    pub fn child_node(&self, index: usize) -> String {
        format!("{}-{}", self.node, index)
    }
}

/// Ordered tasks of one fan-out, indexed `1..=N`
#[derive(Debug, Clone)]
pub struct TaskBatch {
    pub id: String,
    pub tasks: Vec<Task>,
}

impl TaskBatch {
    /// Pair the base arguments of `spec` with every work item
    pub fn build(id: impl Into<String>, spec: &ParallelSpec, items: &[String]) -> Result<Self> {
        validate_arg_name(&spec.primary_arg)?;
        if let Some(seq) = &spec.sequence_arg {
            validate_arg_name(seq)?;
        }

        let seq_base = spec
            .sequence_arg
            .as_deref()
            .map(|name| spec.args.get(name).unwrap_or_default().to_string());

        let tasks = items
            .iter()
            .enumerate()
            .map(|(pos, item)| -> Result<Task> {
                let index = pos + 1;
                let mut args = spec.args.clone();
                if let Some(seq) = &spec.sequence_arg {
                    args.remove(seq);
                }
                args.insert(spec.primary_arg.as_str(), item)?;
                if let (Some(seq), Some(base)) = (&spec.sequence_arg, &seq_base) {
                    args.insert(seq.as_str(), sequence_value(base, index))?;
                }
                Ok(Task::new(spec.command.as_str(), args).with_index(index))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: id.into(),
            tasks,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// `base + index`: numeric when the base is an integer and the sum fits in
/// an `i64`, a suffix otherwise
pub fn sequence_value(base: &str, index: usize) -> String {
    let sum = base
        .trim()
        .parse::<i64>()
        .ok()
        .zip(i64::try_from(index).ok())
        .and_then(|(n, i)| n.checked_add(i));
    match sum {
        Some(n) => n.to_string(),
        None => format!("{}{}", base, index),
    }
}

/// Read a JSON array of work items
pub fn read_work_items(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| BatchError::WorkItems {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_work_items(&content).map_err(|reason| BatchError::WorkItems {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_work_items(content: &str) -> std::result::Result<Vec<String>, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let Value::Array(items) = value else {
        return Err("expected a JSON array".to_string());
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            Value::Null | Value::Object(_) | Value::Array(_) => {
                Err(format!("unsupported work item {}", item))
            }
            other => Ok(other.to_string()),
        })
        .collect()
}
