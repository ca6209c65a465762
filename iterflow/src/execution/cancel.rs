// Cancellation
// Shared handle for cancelling templates or single branches during a run

use crate::execution::identity::NodeKey;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    templates: Mutex<HashSet<String>>,
    nodes: Mutex<HashSet<NodeKey>>,
    notify: Notify,
}

/// Cloneable cancellation handle; every clone observes the same requests
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    state: Arc<CancelState>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every execution node cloned from `template`
    pub fn cancel_template(&self, template: impl Into<String>) {
        self.state
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template.into());
        self.state.notify.notify_waiters();
    }

    /// Cancel one execution node; its siblings keep running
    pub fn cancel_node(&self, key: NodeKey) {
        self.state
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self, key: &NodeKey) -> bool {
        let by_template = self
            .state
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key.template);
        by_template
            || self
                .state
                .nodes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(key)
    }

    /// Resolves once `key` is cancelled
    pub async fn cancelled(&self, key: &NodeKey) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled(key) {
                return;
            }
            notified.await;
        }
    }
}
