// Workflow Engine
// Entry point that owns a frozen graph and runs it under a configuration

use crate::config::{ConcurrencyPolicy, EngineConfig};
use crate::error::EngineResult;
use crate::execution::cancel::Cancellation;
use crate::execution::events::ProgressSender;
use crate::execution::expansion::ExecutionGraph;
use crate::execution::report::RunReport;
use crate::execution::scheduler::Scheduler;
use crate::graph::builder::FrozenGraph;
use crate::records::RecordStore;
use crate::runners::{InProcessManager, ResourceManager};

use std::sync::Arc;

/// Runs a frozen workflow graph
pub struct Engine {
    graph: FrozenGraph,
    config: EngineConfig,
    progress: Option<ProgressSender>,
    manager: Option<Arc<dyn ResourceManager>>,
    records: Option<RecordStore>,
    cancel: Cancellation,
}

impl Engine {
    pub fn new(graph: FrozenGraph) -> Self {
        Self {
            graph,
            config: EngineConfig::default(),
            progress: None,
            manager: None,
            records: None,
            cancel: Cancellation::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Resource manager used under `ConcurrencyPolicy::Delegated`
    pub fn with_resource_manager(mut self, manager: Arc<dyn ResourceManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_records(mut self, store: RecordStore) -> Self {
        self.records = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for cancelling templates or branches of the next run
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &FrozenGraph {
        &self.graph
    }

    pub fn execution_graph(&self) -> &ExecutionGraph {
        self.graph.execution_graph()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute every node; node failures land in the report, not the error
    pub async fn run(&self) -> EngineResult<RunReport> {
        self.config.validate()?;

        let records = match (&self.records, &self.config.records_dir) {
            (Some(store), _) => Some(store.clone()),
            (None, Some(dir)) => Some(RecordStore::new(dir)),
            (None, None) if self.config.resume => Some(RecordStore::with_default_dir()?),
            (None, None) => None,
        };

        let manager = match (&self.config.concurrency, &self.manager) {
            (ConcurrencyPolicy::Delegated { .. }, None) => {
                Some(Arc::new(InProcessManager::new()) as Arc<dyn ResourceManager>)
            }
            (_, manager) => manager.clone(),
        };

        let progress = if self.config.emit_events {
            self.progress.clone()
        } else {
            None
        };

        Scheduler::new(&self.graph, &self.config, self.cancel.clone())
            .with_progress(progress)
            .with_resource_manager(manager)
            .with_records(records.as_ref())
            .run()
            .await
    }
}
