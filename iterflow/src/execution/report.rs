// Run Report
// Per execution node outcomes and the aggregate failure report of a run

use crate::execution::identity::{BranchId, NodeKey};
use crate::execution::join::JoinState;
use crate::runners::{Inputs, Outputs};
use crate::value::Value;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Why a node did not produce outputs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The interface raised a failure
    NodeFailed { message: String },
    /// Dispatch exceeded its timeout
    Timeout { after_ms: u64 },
    Cancelled,
    /// Outputs did not match the declared output fields
    TypeMismatch { message: String },
    /// The resource manager rejected or lost the job
    Dispatch { message: String },
    /// A direct or transitive input failed
    UpstreamFailure { origin: NodeKey },
    /// A join upstream failed under `fail-fast`
    UpstreamBranchFailure { join: NodeKey, branch: NodeKey },
}

impl FailureKind {
    pub fn node_failed(message: impl Into<String>) -> Self {
        Self::NodeFailed {
            message: message.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamFailure { .. } | Self::UpstreamBranchFailure { .. }
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFailed { message } => write!(f, "NodeFailed: {}", message),
            Self::Timeout { after_ms } => write!(f, "Timeout after {}ms", after_ms),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::TypeMismatch { message } => write!(f, "TypeMismatchError: {}", message),
            Self::Dispatch { message } => write!(f, "DispatchError: {}", message),
            Self::UpstreamFailure { origin } => write!(f, "UpstreamFailure from {}", origin),
            Self::UpstreamBranchFailure { join, branch } => {
                write!(f, "UpstreamBranchFailure at {} from {}", join, branch)
            }
        }
    }
}

/// Terminal status of an execution node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    /// Outputs reused from a stored record
    Cached,
    /// Dispatched and failed
    Failed(FailureKind),
    /// Never dispatched
    Skipped(FailureKind),
}

impl NodeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }

    pub fn failure(&self) -> Option<&FailureKind> {
        match self {
            Self::Failed(kind) | Self::Skipped(kind) => Some(kind),
            _ => None,
        }
    }

    /// Failure handed to consumers of the node `key` with this status
    pub fn downstream_failure(&self, key: &NodeKey) -> Option<FailureKind> {
        match self {
            Self::Succeeded | Self::Cached => None,
            Self::Skipped(kind) if kind.is_upstream() => Some(kind.clone()),
            Self::Failed(_) | Self::Skipped(_) => Some(FailureKind::UpstreamFailure {
                origin: key.clone(),
            }),
        }
    }
}

/// Outcome of one execution node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRun {
    pub key: NodeKey,
    pub status: NodeStatus,
    /// Resolved inputs, including assembled join collections
    pub inputs: Inputs,
    pub outputs: Outputs,
    /// Assembled collections, for join nodes that were released
    pub joined: BTreeMap<String, Value>,
    pub join_state: Option<JoinState>,
    /// Slot ordinals left out under `ignore-failures`
    pub omitted: Vec<usize>,
    pub duration: Duration,
}

/// Aggregate failure report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureReport {
    /// Every execution node that failed or was skipped, in execution order
    pub nodes: Vec<(NodeKey, FailureKind)>,
    /// Every join whose outcome was affected by a failure
    pub joins: Vec<NodeKey>,
}

impl FailureReport {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.joins.is_empty()
    }

    pub fn failure_of(&self, key: &NodeKey) -> Option<&FailureKind> {
        self.nodes.iter().find(|(k, _)| k == key).map(|(_, f)| f)
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} failed node(s)", self.nodes.len())?;
        for (key, kind) in &self.nodes {
            writeln!(f, "  {}: {}", key, kind)?;
        }
        for join in &self.joins {
            writeln!(f, "  affected join: {}", join)?;
        }
        Ok(())
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JoinState::Pending => "PENDING",
            JoinState::Collecting => "COLLECTING",
            JoinState::Ready => "READY",
            JoinState::PartialReady => "PARTIAL-READY",
            JoinState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Result of `Engine::run`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workflow: String,
    pub duration: Duration,
    nodes: Vec<NodeRun>,
    #[serde(skip)]
    index: HashMap<NodeKey, usize>,
}

impl RunReport {
    pub fn new(workflow: impl Into<String>, nodes: Vec<NodeRun>, duration: Duration) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.key.clone(), i))
            .collect();
        Self {
            workflow: workflow.into(),
            duration,
            nodes,
            index,
        }
    }

    /// All execution nodes, in execution-graph order
    pub fn nodes(&self) -> &[NodeRun] {
        &self.nodes
    }

    pub fn get(&self, key: &NodeKey) -> Option<&NodeRun> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    pub fn node(&self, template: &str, branch: &BranchId) -> Option<&NodeRun> {
        self.get(&NodeKey::new(template, branch.clone()))
    }

    /// Every execution node cloned from `template`, in ordinal order
    pub fn instances(&self, template: &str) -> Vec<&NodeRun> {
        let mut runs: Vec<&NodeRun> = self
            .nodes
            .iter()
            .filter(|n| n.key.template == template)
            .collect();
        runs.sort_by(|a, b| a.key.branch.cmp(&b.key.branch));
        runs
    }

    /// Outputs of every instance keyed by field, suffixed with the branch ordinals
    pub fn outputs_by_field(&self, template: &str) -> BTreeMap<String, Value> {
        self.collect_fields(template, |run| &run.outputs)
    }

    /// Resolved inputs of every instance, keyed like [`RunReport::outputs_by_field`]
    pub fn inputs_by_field(&self, template: &str) -> BTreeMap<String, Value> {
        self.collect_fields(template, |run| &run.inputs)
    }

    /// Assembled join collections of every instance
    pub fn joined_inputs(&self, template: &str) -> BTreeMap<String, Value> {
        self.collect_fields(template, |run| &run.joined)
    }

    fn collect_fields<F>(&self, template: &str, select: F) -> BTreeMap<String, Value>
    where
        F: Fn(&NodeRun) -> &BTreeMap<String, Value>,
    {
        let mut fields = BTreeMap::new();
        for run in self.instances(template) {
            let suffix = run.key.branch.ordinal_suffix();
            for (field, value) in select(run) {
                let name = if suffix.is_empty() {
                    field.clone()
                } else {
                    format!("{}_{}", field, suffix)
                };
                fields.insert(name, value.clone());
            }
        }
        fields
    }

    /// True when every node succeeded or was served from a record
    pub fn success(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_success())
    }

    pub fn count(&self, predicate: impl Fn(&NodeStatus) -> bool) -> usize {
        self.nodes.iter().filter(|n| predicate(&n.status)).count()
    }

    pub fn failures(&self) -> FailureReport {
        let nodes = self
            .nodes
            .iter()
            .filter_map(|n| n.status.failure().map(|f| (n.key.clone(), f.clone())))
            .collect();
        let joins = self
            .nodes
            .iter()
            .filter(|n| match n.join_state {
                Some(JoinState::Failed) | Some(JoinState::PartialReady) => true,
                Some(_) => !n.status.is_success(),
                None => false,
            })
            .map(|n| n.key.clone())
            .collect();
        FailureReport { nodes, joins }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
