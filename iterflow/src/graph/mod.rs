// Graph Module
// Node templates, the mutable builder and the frozen template graph

pub mod builder;
pub mod error;
pub mod template;

pub use builder::{Edge, FrozenGraph, WorkflowGraph};
pub use error::{GraphError, GraphErrorKind};
pub use template::{
    Arity, FailurePolicy, InputField, IterableSpec, IterationPolicy, JoinSpec, NodeTemplate,
};
