// Execution Module
// Expansion into branches, join synchronization and scheduled dispatch

pub mod cancel;
pub mod domain;
pub mod engine;
pub mod events;
pub mod expansion;
pub mod identity;
pub mod join;
pub mod report;
pub mod scheduler;

// Re-export key types
pub use cancel::Cancellation;
pub use domain::IterationDomain;
pub use engine::Engine;
pub use events::{
    progress_channel, progress_stream, EventSender, ExecutionEvent, ProgressReceiver,
    ProgressSender,
};
pub use expansion::{EdgeTarget, ExecEdge, ExecNode, ExecutionGraph, Expander, JoinLayout};
pub use identity::{BranchId, BranchStep, NodeKey};
pub use join::{
    JoinProgress, JoinRelease, JoinSlotTable, JoinState, JoinSynchronizer, SlotResult, SlotState,
};
pub use report::{FailureKind, FailureReport, NodeRun, NodeStatus, RunReport};
pub use scheduler::Scheduler;
