// Engine errors
// Fatal conditions that stop a run; node failures are reported, not raised

use crate::config::ConfigError;
use crate::execution::identity::NodeKey;
use crate::graph::error::GraphError;
use crate::records::RecordError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A join slot was closed twice; indicates a scheduler bug
    #[error("DuplicateContributionError: slot {ordinal} of {join}.{field} is already closed")]
    DuplicateContribution {
        join: NodeKey,
        field: String,
        ordinal: usize,
    },

    #[error("no join slot table for {0}")]
    UnknownJoin(NodeKey),

    #[error("join {join} has no joinfield '{field}'")]
    UnknownJoinField { join: NodeKey, field: String },

    #[error("slot {ordinal} is out of range for join {join} of size {size}")]
    SlotOutOfRange {
        join: NodeKey,
        ordinal: usize,
        size: usize,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("record store error: {0}")]
    Record(#[from] RecordError),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("scheduler stalled with {0} unfinished nodes")]
    Stalled(usize),
}

pub type EngineResult<T> = Result<T, EngineError>;
