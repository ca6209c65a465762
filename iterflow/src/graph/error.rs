// Build-time graph errors
// Every variant is fatal: a graph that fails to freeze never executes

use std::fmt;

/// Error raised while building, freezing or expanding a workflow graph
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// The template graph contains a cycle
    Cycle,
    /// An edge references a node or field that does not exist
    DanglingEdge,
    /// Iterable value sequences cannot form a domain
    IterableArity,
    /// A join names a source that is not an upstream splitter
    JoinSourceMismatch,
    /// A binding is incompatible with the declared field arity
    TypeMismatch,
    /// Two templates share a name
    DuplicateNode,
}

impl GraphErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            GraphErrorKind::Cycle => "CycleError",
            GraphErrorKind::DanglingEdge => "DanglingEdgeError",
            GraphErrorKind::IterableArity => "IterableArityError",
            GraphErrorKind::JoinSourceMismatch => "JoinSourceMismatchError",
            GraphErrorKind::TypeMismatch => "TypeMismatchError",
            GraphErrorKind::DuplicateNode => "DuplicateNodeError",
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cycle(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::Cycle,
        }
    }

    pub fn dangling_edge(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DanglingEdge,
        }
    }

    pub fn iterable_arity(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::IterableArity,
        }
    }

    pub fn join_source_mismatch(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::JoinSourceMismatch,
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::TypeMismatch,
        }
    }

    pub fn duplicate_node(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateNode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_uses_taxonomy_label() {
        let err = GraphError::iterable_arity("zip over 'x' (3) and 'y' (2)");
        assert_eq!(
            err.to_string(),
            "IterableArityError: zip over 'x' (3) and 'y' (2)"
        );
        assert_eq!(err.kind, GraphErrorKind::IterableArity);
    }
}
