// Join Synchronizer
// Per-join slot tables that release a join node exactly once, in ordinal order

use crate::error::{EngineError, EngineResult};
use crate::execution::expansion::JoinLayout;
use crate::execution::identity::NodeKey;
use crate::graph::template::FailurePolicy;
use crate::value::Value;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// One branch's slot for one joinfield
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Pending,
    Filled(Value),
    Failed(String),
}

impl SlotState {
    pub fn is_closed(&self) -> bool {
        !matches!(self, SlotState::Pending)
    }
}

/// What a branch hands to a join slot
#[derive(Debug, Clone, PartialEq)]
pub enum SlotResult {
    Value(Value),
    Failed(String),
}

/// Lifecycle of a join node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinState {
    Pending,
    Collecting,
    Ready,
    PartialReady,
    Failed,
}

impl JoinState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JoinState::Ready | JoinState::PartialReady | JoinState::Failed
        )
    }
}

/// Assembled collections handed to the scheduler on release
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRelease {
    pub state: JoinState,
    /// Joinfield name to ordered collection
    pub inputs: BTreeMap<String, Value>,
    /// Ordinals left out under `ignore-failures`
    pub omitted: Vec<usize>,
}

/// Result of a single contribution
#[derive(Debug, Clone, PartialEq)]
pub enum JoinProgress {
    /// Slots remain open, or the join already reached a terminal state
    Waiting(JoinState),
    /// Every slot closed; the join node may execute
    Released(JoinRelease),
    /// First permanent failure under `fail-fast`
    Failed { ordinal: usize, reason: String },
}

/// Slot buffer for one join node instance
#[derive(Debug, Clone)]
pub struct JoinSlotTable {
    key: NodeKey,
    size: usize,
    policy: FailurePolicy,
    fields: BTreeMap<String, Vec<SlotState>>,
    state: JoinState,
}

impl JoinSlotTable {
    pub fn new(key: NodeKey, layout: &JoinLayout) -> Self {
        let size = layout.size();
        Self {
            key,
            size,
            policy: layout.failure_policy,
            fields: layout
                .joinfields
                .iter()
                .map(|f| (f.clone(), vec![SlotState::Pending; size]))
                .collect(),
            state: JoinState::Pending,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Every slot of every joinfield is filled or failed
    pub fn is_closed(&self) -> bool {
        self.fields
            .values()
            .all(|slots| slots.iter().all(SlotState::is_closed))
    }

    /// Close one slot
    pub fn contribute(
        &mut self,
        field: &str,
        ordinal: usize,
        result: SlotResult,
    ) -> EngineResult<JoinProgress> {
        let size = self.size;
        let slots = self
            .fields
            .get_mut(field)
            .ok_or_else(|| EngineError::UnknownJoinField {
                join: self.key.clone(),
                field: field.to_string(),
            })?;
        let slot = slots.get_mut(ordinal).ok_or_else(|| EngineError::SlotOutOfRange {
            join: self.key.clone(),
            ordinal,
            size,
        })?;
        if slot.is_closed() {
            return Err(EngineError::DuplicateContribution {
                join: self.key.clone(),
                field: field.to_string(),
                ordinal,
            });
        }

        let failure = match result {
            SlotResult::Value(value) => {
                *slot = SlotState::Filled(value);
                None
            }
            SlotResult::Failed(reason) => {
                *slot = SlotState::Failed(reason.clone());
                Some(reason)
            }
        };

        if self.state.is_terminal() {
            return Ok(JoinProgress::Waiting(self.state));
        }

        if let Some(reason) = failure {
            if self.policy == FailurePolicy::FailFast {
                warn!(join = %self.key, ordinal, field, "join failed fast");
                self.state = JoinState::Failed;
                return Ok(JoinProgress::Failed { ordinal, reason });
            }
        }

        if !self.is_closed() {
            self.state = JoinState::Collecting;
            return Ok(JoinProgress::Waiting(self.state));
        }

        Ok(JoinProgress::Released(self.assemble()))
    }

    /// Build the ordered collections; only called once every slot is closed
    fn assemble(&mut self) -> JoinRelease {
        let omitted: BTreeSet<usize> = self
            .fields
            .values()
            .flat_map(|slots| {
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| matches!(s, SlotState::Failed(_)))
                    .map(|(i, _)| i)
            })
            .collect();

        let inputs = self
            .fields
            .iter()
            .map(|(field, slots)| {
                let collection = slots
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !omitted.contains(i))
                    .filter_map(|(_, s)| match s {
                        SlotState::Filled(v) => Some(v.clone()),
                        _ => None,
                    })
                    .collect();
                (field.clone(), Value::Array(collection))
            })
            .collect();

        self.state = if omitted.is_empty() {
            JoinState::Ready
        } else {
            JoinState::PartialReady
        };
        debug!(join = %self.key, state = ?self.state, omitted = omitted.len(), "join released");

        JoinRelease {
            state: self.state,
            inputs,
            omitted: omitted.into_iter().collect(),
        }
    }
}

/// Owns the slot tables of every join instance in a run
#[derive(Debug, Default)]
pub struct JoinSynchronizer {
    tables: Mutex<HashMap<NodeKey, Arc<Mutex<JoinSlotTable>>>>,
}

impl JoinSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the slot table for a join instance
    pub fn register(&self, key: NodeKey, layout: &JoinLayout) {
        let table = JoinSlotTable::new(key.clone(), layout);
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(Mutex::new(table)));
    }

    /// Close slot `ordinal` of `field` on `join`
    ///
    /// The table is dropped once every slot is closed.
    pub fn contribute(
        &self,
        join: &NodeKey,
        field: &str,
        ordinal: usize,
        result: SlotResult,
    ) -> EngineResult<JoinProgress> {
        let table = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(join)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJoin(join.clone()))?;

        let (progress, closed) = {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            let progress = table.contribute(field, ordinal, result)?;
            (progress, table.is_closed())
        };

        if closed {
            self.tables
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(join);
        }
        Ok(progress)
    }

    /// Current state, or `None` once the table was dropped
    pub fn state(&self, join: &NodeKey) -> Option<JoinState> {
        let table = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(join)
            .cloned()?;
        let state = table.lock().unwrap_or_else(PoisonError::into_inner).state();
        Some(state)
    }

    /// Number of tables still allocated
    pub fn open_tables(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
