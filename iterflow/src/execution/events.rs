// Execution Events
// Progress reporting and event types for workflow runs

use crate::execution::identity::NodeKey;
use crate::execution::join::JoinState;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Adapt a progress receiver into a `Stream`
pub fn progress_stream(rx: ProgressReceiver) -> UnboundedReceiverStream<ExecutionEvent> {
    UnboundedReceiverStream::new(rx)
}

/// Events emitted during a workflow run
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Run started
    RunStarted {
        workflow: String,
        total_nodes: usize,
    },

    /// Run finished; `success` is false when any node failed or was skipped
    RunCompleted {
        workflow: String,
        success: bool,
        duration: Duration,
    },

    /// Node dispatched
    NodeStarted { node: NodeKey },

    /// Node produced its outputs
    NodeCompleted { node: NodeKey, duration: Duration },

    /// Node failed permanently
    NodeFailed { node: NodeKey, reason: String },

    /// Node was never dispatched
    NodeSkipped { node: NodeKey, reason: String },

    /// Node outputs were reused from a stored record
    NodeCached { node: NodeKey },

    /// A branch closed one slot of a join
    JoinContributed {
        join: NodeKey,
        field: String,
        ordinal: usize,
        success: bool,
    },

    /// Join slot table released its collections
    JoinReleased {
        join: NodeKey,
        state: JoinState,
        omitted: usize,
    },

    /// Join failed under `fail-fast`
    JoinFailed { join: NodeKey, ordinal: usize },
}

impl ExecutionEvent {
    pub fn run_started(workflow: impl Into<String>, total_nodes: usize) -> Self {
        Self::RunStarted {
            workflow: workflow.into(),
            total_nodes,
        }
    }

    pub fn run_completed(workflow: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::RunCompleted {
            workflow: workflow.into(),
            success,
            duration,
        }
    }

    pub fn node_failed(node: NodeKey, reason: impl Into<String>) -> Self {
        Self::NodeFailed {
            node,
            reason: reason.into(),
        }
    }

    pub fn node_skipped(node: NodeKey, reason: impl Into<String>) -> Self {
        Self::NodeSkipped {
            node,
            reason: reason.into(),
        }
    }

    /// The execution node this event concerns, if any
    pub fn node(&self) -> Option<&NodeKey> {
        match self {
            Self::RunStarted { .. } | Self::RunCompleted { .. } => None,
            Self::NodeStarted { node }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeSkipped { node, .. }
            | Self::NodeCached { node } => Some(node),
            Self::JoinContributed { join, .. }
            | Self::JoinReleased { join, .. }
            | Self::JoinFailed { join, .. } => Some(join),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::run_started("wf", 3));
        tx.send_event(ExecutionEvent::NodeStarted {
            node: NodeKey::root("a"),
        });

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::RunStarted { total_nodes: 3, .. }));

        let event2 = rx.recv().await.unwrap();
        assert_eq!(event2.node(), Some(&NodeKey::root("a")));
    }

    #[tokio::test]
    async fn test_progress_stream() {
        let (tx, rx) = progress_channel();
        tx.send_event(ExecutionEvent::node_failed(NodeKey::root("a"), "boom"));
        tx.send_event(ExecutionEvent::run_completed("wf", false, Duration::from_millis(5)));
        drop(tx);

        let events: Vec<ExecutionEvent> = progress_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ExecutionEvent::RunCompleted { success: false, .. }));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::run_started("wf", 0));
    }
}
