// Iterflow Library
// Fan-out/fan-in workflow engine: iterable expansion, ordered joins, scheduled dispatch

pub mod config;
pub mod error;
pub mod execution;
pub mod graph;
pub mod records;
pub mod runners;
pub mod value;

// Re-export commonly used types
pub use config::{ConcurrencyPolicy, ConfigError, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use value::Value;

// Re-export graph types
pub use graph::{
    Arity, FailurePolicy, FrozenGraph, GraphError, GraphErrorKind, IterationPolicy, NodeTemplate,
    WorkflowGraph,
};

// Re-export execution types
pub use execution::{
    progress_channel, BranchId, BranchStep, Cancellation, Engine, ExecutionEvent, ExecutionGraph,
    FailureKind, FailureReport, JoinState, NodeKey, NodeRun, NodeStatus, ProgressSender, RunReport,
};

pub use records::{NodeRecord, RecordError, RecordStore};

// Re-export runner types
pub use runners::{
    interface_fn, single_output, DispatchError, InProcessManager, Inputs, Interface,
    InterfaceError, Outputs, ResourceManager,
};
