// Execution Scheduler
// Event-driven dispatch of ready execution nodes, output routing and failure propagation

use crate::config::{ConcurrencyPolicy, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::execution::cancel::Cancellation;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::expansion::{EdgeTarget, ExecutionGraph};
use crate::execution::identity::NodeKey;
use crate::execution::join::{JoinProgress, JoinState, JoinSynchronizer, SlotResult};
use crate::execution::report::{FailureKind, NodeRun, NodeStatus, RunReport};
use crate::graph::builder::FrozenGraph;
use crate::graph::error::GraphError;
use crate::graph::template::NodeTemplate;
use crate::records::{NodeRecord, RecordStore};
use crate::runners::{Inputs, Interface, JobSpec, JobState, JobTicket, Outputs, ResourceManager};
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

/// Mutable per-node bookkeeping for one run
#[derive(Debug, Default)]
struct NodeState {
    /// Unclosed direct inputs, plus one for a pending join release
    remaining: usize,
    inputs: Inputs,
    joined: BTreeMap<String, Value>,
    join_state: Option<JoinState>,
    omitted: Vec<usize>,
    /// First failure seen on any input
    blocked: Option<FailureKind>,
    status: Option<NodeStatus>,
    outputs: Outputs,
    duration: Duration,
}

/// Everything a dispatched node needs, owned so it can move into a task
struct Dispatch {
    idx: usize,
    key: NodeKey,
    inputs: Inputs,
    interface: Arc<dyn Interface>,
    timeout: Option<Duration>,
    cancel: Cancellation,
    manager: Option<(Arc<dyn ResourceManager>, Duration)>,
}

type DispatchResult = (usize, Result<Outputs, FailureKind>, Duration);

/// Drives one run of an execution graph
pub struct Scheduler<'a> {
    graph: &'a FrozenGraph,
    execution: &'a ExecutionGraph,
    config: &'a EngineConfig,
    progress: Option<ProgressSender>,
    manager: Option<Arc<dyn ResourceManager>>,
    records: Option<&'a RecordStore>,
    cancel: Cancellation,
    joins: JoinSynchronizer,
    states: Vec<NodeState>,
    ready: BTreeSet<usize>,
}

impl<'a> Scheduler<'a> {
    pub fn new(graph: &'a FrozenGraph, config: &'a EngineConfig, cancel: Cancellation) -> Self {
        let execution = graph.execution_graph();
        Self {
            graph,
            execution,
            config,
            progress: None,
            manager: None,
            records: None,
            cancel,
            joins: JoinSynchronizer::new(),
            states: Vec::new(),
            ready: BTreeSet::new(),
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSender>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_resource_manager(mut self, manager: Option<Arc<dyn ResourceManager>>) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_records(mut self, records: Option<&'a RecordStore>) -> Self {
        self.records = records;
        self
    }

    #[instrument(level = "info", skip(self), fields(workflow = %self.graph.name))]
    pub async fn run(mut self) -> EngineResult<RunReport> {
        let started = Instant::now();
        let total = self.execution.len();
        info!(nodes = total, policy = ?self.config.concurrency, "run started");
        self.progress
            .send_event(ExecutionEvent::run_started(&self.graph.name, total));

        self.initialize()?;

        let capacity = self.config.concurrency.capacity().max(1);
        let mut in_flight: JoinSet<DispatchResult> = JoinSet::new();

        loop {
            while in_flight.len() < capacity {
                let Some(idx) = self.ready.pop_first() else {
                    break;
                };
                if let Some(dispatch) = self.prepare(idx)? {
                    in_flight.spawn(execute(dispatch));
                }
            }

            if in_flight.is_empty() && self.ready.is_empty() {
                break;
            }

            match in_flight.join_next().await {
                Some(Ok((idx, result, duration))) => self.complete(idx, result, duration)?,
                Some(Err(e)) => return Err(EngineError::Worker(e.to_string())),
                None => {}
            }
        }

        let unfinished = self.states.iter().filter(|s| s.status.is_none()).count();
        if unfinished > 0 {
            return Err(EngineError::Stalled(unfinished));
        }

        let report = self.into_report(started.elapsed());
        let success = report.success();
        info!(
            success,
            failed = report.count(|s| !s.is_success()),
            elapsed_ms = report.duration.as_millis() as u64,
            "run completed"
        );
        Ok(report)
    }

    /// Seed input counters, defaults, iterable assignments and join tables
    fn initialize(&mut self) -> EngineResult<()> {
        let execution = self.execution;
        self.states = Vec::with_capacity(execution.len());
        for (idx, node) in execution.nodes().iter().enumerate() {
            let template = self.template(&node.key)?;
            let direct = execution
                .incoming(idx)
                .iter()
                .filter(|&&e| execution.edge(e).delivery == EdgeTarget::Direct)
                .count();

            let mut inputs = template.defaults.clone();
            inputs.extend(node.assigned.clone());

            let mut state = NodeState {
                remaining: direct,
                inputs,
                ..Default::default()
            };
            if let Some(layout) = &node.join {
                self.joins.register(node.key.clone(), layout);
                state.remaining += 1;
                state.join_state = Some(JoinState::Pending);
            }
            if state.remaining == 0 {
                self.ready.insert(idx);
            }
            self.states.push(state);
        }
        Ok(())
    }

    fn template(&self, key: &NodeKey) -> EngineResult<&'a NodeTemplate> {
        self.graph.template(&key.template).ok_or_else(|| {
            EngineError::Graph(GraphError::dangling_edge(format!(
                "execution node {} has no template",
                key
            )))
        })
    }

    /// Settle a ready node without dispatch when possible, otherwise build its dispatch
    fn prepare(&mut self, idx: usize) -> EngineResult<Option<Dispatch>> {
        let key = self.execution.node(idx).key.clone();

        if let Some(reason) = self.states[idx].blocked.clone() {
            debug!(node = %key, reason = %reason, "node skipped");
            self.progress
                .send_event(ExecutionEvent::node_skipped(key.clone(), reason.to_string()));
            self.settle(idx, NodeStatus::Skipped(reason))?;
            return Ok(None);
        }

        if self.cancel.is_cancelled(&key) {
            debug!(node = %key, "node cancelled before dispatch");
            self.progress
                .send_event(ExecutionEvent::node_skipped(key.clone(), "cancelled"));
            self.settle(idx, NodeStatus::Skipped(FailureKind::Cancelled))?;
            return Ok(None);
        }

        if let Some(outputs) = self.cached_outputs(&key, idx) {
            debug!(node = %key, "node served from record");
            self.states[idx].outputs = outputs;
            self.progress
                .send_event(ExecutionEvent::NodeCached { node: key.clone() });
            self.settle(idx, NodeStatus::Cached)?;
            return Ok(None);
        }

        let template = self.template(&key)?;
        let manager = match (&self.config.concurrency, &self.manager) {
            (ConcurrencyPolicy::Delegated { poll_interval_ms }, Some(manager)) => Some((
                Arc::clone(manager),
                Duration::from_millis(*poll_interval_ms),
            )),
            _ => None,
        };
        debug!(node = %key, "node dispatched");
        self.progress
            .send_event(ExecutionEvent::NodeStarted { node: key.clone() });

        Ok(Some(Dispatch {
            idx,
            key,
            inputs: self.states[idx].inputs.clone(),
            interface: Arc::clone(&template.interface),
            timeout: template.timeout.or_else(|| self.config.node_timeout()),
            cancel: self.cancel.clone(),
            manager,
        }))
    }

    /// Stored outputs when resuming and the inputs did not change
    fn cached_outputs(&self, key: &NodeKey, idx: usize) -> Option<Outputs> {
        if !self.config.resume {
            return None;
        }
        let store = self.records?;
        match store.load(&self.graph.name, key) {
            Ok(Some(record)) if record.inputs == self.states[idx].inputs => Some(record.outputs),
            Ok(_) => None,
            Err(e) => {
                warn!(node = %key, error = %e, "ignoring unreadable record");
                None
            }
        }
    }

    /// Handle a finished dispatch
    fn complete(
        &mut self,
        idx: usize,
        result: Result<Outputs, FailureKind>,
        duration: Duration,
    ) -> EngineResult<()> {
        let key = self.execution.node(idx).key.clone();
        self.states[idx].duration = duration;

        let result = result.and_then(|outputs| {
            let template = self
                .template(&key)
                .map_err(|e| FailureKind::type_mismatch(e.to_string()))?;
            validate_outputs(template, outputs)
        });

        match result {
            Ok(outputs) => {
                debug!(node = %key, elapsed_ms = duration.as_millis() as u64, "node completed");
                if let Some(store) = self.records {
                    let record = NodeRecord::new(
                        &self.graph.name,
                        key.clone(),
                        self.states[idx].inputs.clone(),
                        outputs.clone(),
                    );
                    store.save(&record)?;
                }
                self.states[idx].outputs = outputs;
                self.progress
                    .send_event(ExecutionEvent::NodeCompleted { node: key, duration });
                self.settle(idx, NodeStatus::Succeeded)
            }
            Err(kind) => {
                warn!(node = %key, failure = %kind, "node failed");
                self.progress
                    .send_event(ExecutionEvent::node_failed(key, kind.to_string()));
                self.settle(idx, NodeStatus::Failed(kind))
            }
        }
    }

    /// Record a terminal status and route the node's outcome along its edges
    fn settle(&mut self, idx: usize, status: NodeStatus) -> EngineResult<()> {
        let execution = self.execution;
        let key = execution.node(idx).key.clone();
        let failure = status.downstream_failure(&key);
        self.states[idx].status = Some(status);

        for &e in execution.outgoing(idx) {
            let edge = execution.edge(e);
            let value = match &failure {
                None => self.states[idx].outputs.get(&edge.source_field).cloned(),
                Some(_) => None,
            };

            match edge.delivery {
                EdgeTarget::Direct => {
                    let target = &mut self.states[edge.target];
                    match (&failure, value) {
                        (None, Some(value)) => {
                            target.inputs.insert(edge.target_field.clone(), value);
                        }
                        (Some(kind), _) => {
                            target.blocked.get_or_insert_with(|| kind.clone());
                        }
                        (None, None) => {
                            target.blocked.get_or_insert_with(|| FailureKind::UpstreamFailure {
                                origin: key.clone(),
                            });
                        }
                    }
                    self.close_input(edge.target);
                }
                EdgeTarget::JoinSlot { ordinal } => {
                    let slot = match (&failure, value) {
                        (None, Some(value)) => SlotResult::Value(value),
                        (Some(kind), _) => SlotResult::Failed(kind.to_string()),
                        (None, None) => SlotResult::Failed(format!("{} produced no value", key)),
                    };
                    let success = matches!(slot, SlotResult::Value(_));
                    let join = execution.node(edge.target).key.clone();
                    let progress = self.joins.contribute(&join, &edge.target_field, ordinal, slot)?;
                    self.progress.send_event(ExecutionEvent::JoinContributed {
                        join: join.clone(),
                        field: edge.target_field.clone(),
                        ordinal,
                        success,
                    });
                    self.apply_join_progress(edge.target, &join, &key, progress);
                }
            }
        }
        Ok(())
    }

    fn apply_join_progress(
        &mut self,
        target: usize,
        join: &NodeKey,
        branch: &NodeKey,
        progress: JoinProgress,
    ) {
        match progress {
            JoinProgress::Waiting(state) => {
                if !state.is_terminal() {
                    self.states[target].join_state = Some(state);
                }
            }
            JoinProgress::Released(release) => {
                self.progress.send_event(ExecutionEvent::JoinReleased {
                    join: join.clone(),
                    state: release.state,
                    omitted: release.omitted.len(),
                });
                let state = &mut self.states[target];
                state.inputs.extend(release.inputs.clone());
                state.joined = release.inputs;
                state.omitted = release.omitted;
                state.join_state = Some(release.state);
                self.close_input(target);
            }
            JoinProgress::Failed { ordinal, reason } => {
                warn!(join = %join, ordinal, reason = %reason, "join failed");
                self.progress.send_event(ExecutionEvent::JoinFailed {
                    join: join.clone(),
                    ordinal,
                });
                let state = &mut self.states[target];
                state.join_state = Some(JoinState::Failed);
                // the join's own failure replaces whatever else blocked it
                state.blocked = Some(FailureKind::UpstreamBranchFailure {
                    join: join.clone(),
                    branch: branch.clone(),
                });
                self.close_input(target);
            }
        }
    }

    fn close_input(&mut self, target: usize) {
        let state = &mut self.states[target];
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 && state.status.is_none() {
            self.ready.insert(target);
        }
    }

    fn into_report(self, duration: Duration) -> RunReport {
        let nodes = self
            .execution
            .nodes()
            .iter()
            .zip(self.states)
            .map(|(node, state)| NodeRun {
                key: node.key.clone(),
                status: state.status.unwrap_or(NodeStatus::Skipped(FailureKind::Cancelled)),
                inputs: state.inputs,
                outputs: state.outputs,
                joined: state.joined,
                join_state: state.join_state,
                omitted: state.omitted,
                duration: state.duration,
            })
            .collect();

        let report = RunReport::new(&self.graph.name, nodes, duration);
        self.progress.send_event(ExecutionEvent::run_completed(
            &self.graph.name,
            report.success(),
            duration,
        ));
        report
    }
}

/// Outputs must cover every declared field and nothing else
fn validate_outputs(template: &NodeTemplate, outputs: Outputs) -> Result<Outputs, FailureKind> {
    if let Some(extra) = outputs.keys().find(|k| !template.has_output(k)) {
        return Err(FailureKind::type_mismatch(format!(
            "'{}' produced undeclared output '{}'",
            template.name, extra
        )));
    }
    if let Some(missing) = template.outputs.iter().find(|o| !outputs.contains_key(*o)) {
        return Err(FailureKind::type_mismatch(format!(
            "'{}' produced no value for output '{}'",
            template.name, missing
        )));
    }
    Ok(outputs)
}

/// Resolves at `deadline`, or never
async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn execute(dispatch: Dispatch) -> DispatchResult {
    let started = Instant::now();
    let idx = dispatch.idx;
    let result = match dispatch.manager.clone() {
        Some((manager, poll)) => run_delegated(dispatch, manager, poll).await,
        None => run_local(dispatch).await,
    };
    (idx, result, started.elapsed())
}

fn timeout_failure(timeout: Option<Duration>) -> FailureKind {
    FailureKind::Timeout {
        after_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_local(dispatch: Dispatch) -> Result<Outputs, FailureKind> {
    let Dispatch {
        key,
        inputs,
        interface,
        timeout,
        cancel,
        ..
    } = dispatch;
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    // run on its own task so a panicking interface fails only this node
    let mut task = AbortOnDrop(tokio::spawn(async move { interface.run(&inputs).await }));
    tokio::select! {
        joined = &mut task.0 => match joined {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(e)) => Err(FailureKind::node_failed(e.message)),
            Err(e) => Err(FailureKind::node_failed(format!("interface panicked: {}", e))),
        },
        _ = cancel.cancelled(&key) => Err(FailureKind::Cancelled),
        _ = until(deadline) => Err(timeout_failure(timeout)),
    }
}

async fn run_delegated(
    dispatch: Dispatch,
    manager: Arc<dyn ResourceManager>,
    poll: Duration,
) -> Result<Outputs, FailureKind> {
    let Dispatch {
        key,
        inputs,
        interface,
        timeout,
        cancel,
        ..
    } = dispatch;
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let dispatch_failure = |e: crate::runners::DispatchError| FailureKind::Dispatch {
        message: e.to_string(),
    };

    let ticket = manager
        .submit(JobSpec {
            node: key.clone(),
            inputs,
            interface,
        })
        .await
        .map_err(dispatch_failure)?;

    loop {
        match manager.poll(&ticket).await.map_err(dispatch_failure)? {
            JobState::Completed(outputs) => return Ok(outputs),
            JobState::Failed(message) => return Err(FailureKind::NodeFailed { message }),
            JobState::Cancelled => return Err(FailureKind::Cancelled),
            JobState::Queued | JobState::Running => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled(&key) => {
                cancel_job(manager.as_ref(), &key, &ticket).await;
                return Err(FailureKind::Cancelled);
            }
            _ = until(deadline) => {
                cancel_job(manager.as_ref(), &key, &ticket).await;
                return Err(timeout_failure(timeout));
            }
        }
    }
}

async fn cancel_job(manager: &dyn ResourceManager, key: &NodeKey, ticket: &JobTicket) {
    if let Err(e) = manager.cancel(ticket).await {
        warn!(node = %key, ticket = %ticket, error = %e, "failed to cancel delegated job");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::WorkflowGraph;
    use crate::graph::template::{FailurePolicy, IterationPolicy};
    use crate::runners::{
        interface_fn, single_output, DispatchError, InProcessManager, InterfaceError,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn number(inputs: &Inputs, field: &str) -> Result<f64, InterfaceError> {
        inputs
            .get(field)
            .and_then(Value::as_number)
            .ok_or_else(|| InterfaceError::new(format!("missing number '{}'", field)))
    }

    /// split(x in values) -> square -> sum(join)
    fn square_sum(values: Vec<i32>, policy: FailurePolicy) -> FrozenGraph {
        let values: Vec<Value> = values.into_iter().map(Value::from).collect();
        let mut graph = WorkflowGraph::new("square-sum");
        graph
            .add_node(
                NodeTemplate::new(
                    "split",
                    interface_fn(|inputs| Ok(single_output("x", number(inputs, "x")?))),
                )
                .input("x")
                .output("x"),
            )
            .unwrap();
        graph
            .add_node(
                NodeTemplate::new(
                    "square",
                    interface_fn(|inputs| {
                        let x = number(inputs, "x")?;
                        if x < 0.0 {
                            return Err("negative input".into());
                        }
                        Ok(single_output("y", x * x))
                    }),
                )
                .input("x")
                .output("y"),
            )
            .unwrap();
        graph
            .add_node(
                NodeTemplate::new(
                    "sum",
                    interface_fn(|inputs| {
                        let total: f64 = inputs["ys"]
                            .as_array()
                            .unwrap_or_default()
                            .iter()
                            .filter_map(Value::as_number)
                            .sum();
                        Ok(single_output("total", total))
                    }),
                )
                .join_input("ys")
                .output("total"),
            )
            .unwrap();
        graph.connect("split", "x", "square", "x").unwrap();
        graph.connect("square", "y", "sum", "ys").unwrap();
        graph
            .set_iterables("split", [("x", values)], IterationPolicy::Zip)
            .unwrap();
        graph.set_join("sum", "split", ["ys"], policy).unwrap();
        graph.freeze().unwrap()
    }

    async fn run(graph: &FrozenGraph, config: EngineConfig) -> RunReport {
        Scheduler::new(graph, &config, Cancellation::new())
            .run()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_collects_in_ordinal_order() {
        let graph = square_sum(vec![1, 2, 3], FailurePolicy::FailFast);
        let report = run(&graph, EngineConfig::default()).await;

        assert!(report.success());
        let sum = report.get(&NodeKey::root("sum")).unwrap();
        assert_eq!(sum.joined["ys"], Value::from(vec![1.0, 4.0, 9.0]));
        assert_eq!(sum.outputs["total"], Value::from(14.0));
        assert_eq!(sum.join_state, Some(JoinState::Ready));
    }

    #[tokio::test]
    async fn test_serial_matches_parallel() {
        let graph = square_sum(vec![3, 1, 2], FailurePolicy::FailFast);
        let serial = run(&graph, EngineConfig::serial()).await;
        let parallel = run(&graph, EngineConfig::parallel(2)).await;
        assert_eq!(serial.joined_inputs("sum"), parallel.joined_inputs("sum"));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_join() {
        let graph = square_sum(vec![1, -2, 3], FailurePolicy::FailFast);
        let report = run(&graph, EngineConfig::default()).await;

        let sum = report.get(&NodeKey::root("sum")).unwrap();
        assert_eq!(sum.join_state, Some(JoinState::Failed));
        assert!(matches!(
            sum.status,
            NodeStatus::Skipped(FailureKind::UpstreamBranchFailure { .. })
        ));
        assert_eq!(report.count(|s| matches!(s, NodeStatus::Failed(_))), 1);
        assert_eq!(report.failures().joins, vec![NodeKey::root("sum")]);
    }

    #[tokio::test]
    async fn test_ignore_failures_omits_failed_slot() {
        let graph = square_sum(vec![1, -2, 3], FailurePolicy::IgnoreFailures);
        let report = run(&graph, EngineConfig::default()).await;

        let sum = report.get(&NodeKey::root("sum")).unwrap();
        assert_eq!(sum.status, NodeStatus::Succeeded);
        assert_eq!(sum.joined["ys"], Value::from(vec![1.0, 9.0]));
        assert_eq!(sum.omitted, vec![1]);
        assert_eq!(sum.join_state, Some(JoinState::PartialReady));
    }

    #[tokio::test]
    async fn test_undeclared_output_is_type_mismatch() {
        let mut graph = WorkflowGraph::new("bad-outputs");
        graph
            .add_node(
                NodeTemplate::new("a", interface_fn(|_| Ok(single_output("wrong", 1))))
                    .output("out"),
            )
            .unwrap();
        graph
            .add_node(
                NodeTemplate::new("b", interface_fn(|_| Ok(single_output("out", 1))))
                    .input("in")
                    .output("out"),
            )
            .unwrap();
        graph.connect("a", "out", "b", "in").unwrap();
        let graph = graph.freeze().unwrap();

        let report = run(&graph, EngineConfig::default()).await;
        let a = report.get(&NodeKey::root("a")).unwrap();
        assert!(matches!(
            a.status,
            NodeStatus::Failed(FailureKind::TypeMismatch { .. })
        ));
        let b = report.get(&NodeKey::root("b")).unwrap();
        assert_eq!(
            b.status,
            NodeStatus::Skipped(FailureKind::UpstreamFailure {
                origin: NodeKey::root("a")
            })
        );
    }

    #[tokio::test]
    async fn test_delegated_dispatch() {
        let graph = square_sum(vec![1, 2, 3], FailurePolicy::FailFast);
        let config = EngineConfig::delegated(2);
        let manager: Arc<dyn ResourceManager> = Arc::new(InProcessManager::new());

        let report = Scheduler::new(&graph, &config, Cancellation::new())
            .with_resource_manager(Some(manager))
            .run()
            .await
            .unwrap();

        assert!(report.success());
        assert_eq!(
            report.outputs_by_field("sum").get("total"),
            Some(&Value::from(14.0))
        );
    }

    #[test]
    fn test_validate_outputs() {
        let template = NodeTemplate::new("t", interface_fn(|_| Ok(Outputs::new())))
            .output("a")
            .output("b");
        assert!(validate_outputs(&template, single_output("a", 1)).is_err());

        let mut outputs = single_output("a", 1);
        outputs.insert("b".to_string(), Value::from(2));
        assert!(validate_outputs(&template, outputs).is_ok());
    }

    /// Sleeps, then records that it ran to completion
    struct Slow(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl Interface for Slow {
        async fn run(&self, _inputs: &Inputs) -> Result<Outputs, InterfaceError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.store(true, Ordering::SeqCst);
            Ok(Outputs::new())
        }
    }

    fn slow_dispatch(finished: Arc<AtomicBool>, timeout: Option<Duration>) -> Dispatch {
        Dispatch {
            idx: 0,
            key: NodeKey::root("slow"),
            inputs: Inputs::new(),
            interface: Arc::new(Slow(finished)),
            timeout,
            cancel: Cancellation::new(),
            manager: None,
        }
    }

    #[tokio::test]
    async fn test_dropped_local_dispatch_aborts_interface() {
        let finished = Arc::new(AtomicBool::new(false));
        let dispatch = slow_dispatch(finished.clone(), None);

        let early = tokio::time::timeout(Duration::from_millis(10), run_local(dispatch)).await;
        assert!(early.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    /// Accepts jobs that never finish and refuses to cancel them
    struct Stuck;

    #[async_trait::async_trait]
    impl ResourceManager for Stuck {
        async fn submit(&self, job: JobSpec) -> Result<JobTicket, DispatchError> {
            Ok(JobTicket(job.node.to_string()))
        }

        async fn poll(&self, _ticket: &JobTicket) -> Result<JobState, DispatchError> {
            Ok(JobState::Running)
        }

        async fn cancel(&self, ticket: &JobTicket) -> Result<(), DispatchError> {
            Err(DispatchError::Unavailable(format!("cannot cancel {}", ticket)))
        }
    }

    #[tokio::test]
    async fn test_delegated_timeout_survives_failed_cancel() {
        let finished = Arc::new(AtomicBool::new(false));
        let dispatch = slow_dispatch(finished, Some(Duration::from_millis(30)));

        let result = run_delegated(dispatch, Arc::new(Stuck), Duration::from_millis(5)).await;
        assert_eq!(result, Err(FailureKind::Timeout { after_ms: 30 }));
    }
}
