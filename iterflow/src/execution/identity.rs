// Branch Identity
// Value-type keys for execution nodes created by expansion

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// One (splitter, ordinal) pair in a branch identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchStep {
    pub splitter: String,
    pub ordinal: usize,
}

impl BranchStep {
    pub fn new(splitter: impl Into<String>, ordinal: usize) -> Self {
        Self {
            splitter: splitter.into(),
            ordinal,
        }
    }
}

/// Ordered chain of (splitter, ordinal) pairs; empty for unexpanded nodes
///
/// Steps are kept in canonical order: by the topological rank of their splitter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(Vec<BranchStep>);

impl BranchId {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build an identity from steps that are already in canonical order
    pub fn from_steps(steps: Vec<BranchStep>) -> Self {
        Self(steps)
    }

    pub fn steps(&self) -> &[BranchStep] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ordinal_of(&self, splitter: &str) -> Option<usize> {
        self.0
            .iter()
            .find(|s| s.splitter == splitter)
            .map(|s| s.ordinal)
    }

    pub fn splitters(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.splitter.as_str())
    }

    /// Extend with a step for a splitter ranked after every existing step
    pub fn extended(&self, step: BranchStep) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        Self(steps)
    }

    /// Every step of `self` also appears in `other`
    pub fn is_subset_of(&self, other: &BranchId) -> bool {
        self.0.iter().all(|s| other.0.contains(s))
    }

    /// Drop the steps belonging to the given splitters
    pub fn without(&self, splitters: &BTreeSet<String>) -> Self {
        Self(
            self.0
                .iter()
                .filter(|s| !splitters.contains(&s.splitter))
                .cloned()
                .collect(),
        )
    }

    /// Consistent union of two identities, or `None` when they disagree on a splitter
    pub fn merge(&self, other: &BranchId, rank: &HashMap<String, usize>) -> Option<Self> {
        let mut steps = self.0.clone();
        for step in &other.0 {
            match self.ordinal_of(&step.splitter) {
                Some(ordinal) if ordinal != step.ordinal => return None,
                Some(_) => {}
                None => steps.push(step.clone()),
            }
        }
        steps.sort_by_key(|s| {
            (
                rank.get(&s.splitter).copied().unwrap_or(usize::MAX),
                s.splitter.clone(),
            )
        });
        Some(Self(steps))
    }

    /// Ordinals joined by `_`, used to suffix field names of expanded nodes
    pub fn ordinal_suffix(&self) -> String {
        self.0
            .iter()
            .map(|s| s.ordinal.to_string())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Filesystem-safe rendering
    pub fn slug(&self) -> String {
        if self.0.is_empty() {
            return "root".to_string();
        }
        self.0
            .iter()
            .map(|s| format!("{}-{}", sanitize(&s.splitter), s.ordinal))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|s| format!("{}={}", s.splitter, s.ordinal))
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// Identity of one execution node: its template plus its branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub template: String,
    pub branch: BranchId,
}

impl NodeKey {
    pub fn new(template: impl Into<String>, branch: BranchId) -> Self {
        Self {
            template: template.into(),
            branch,
        }
    }

    pub fn root(template: impl Into<String>) -> Self {
        Self::new(template, BranchId::root())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.branch.is_root() {
            write!(f, "{}", self.template)
        } else {
            write!(f, "{}{}", self.template, self.branch)
        }
    }
}
