// Resource Managers
// Submit/poll/cancel contract for delegated dispatch, plus an in-process implementation

use crate::execution::identity::NodeKey;
use crate::runners::{Inputs, Interface, Outputs};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors raised by a resource manager
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("unknown job ticket: {0}")]
    UnknownJob(String),

    #[error("job submission rejected: {0}")]
    Rejected(String),

    #[error("resource manager unavailable: {0}")]
    Unavailable(String),
}

/// Work handed to a resource manager
#[derive(Clone)]
pub struct JobSpec {
    pub node: NodeKey,
    pub inputs: Inputs,
    pub interface: Arc<dyn Interface>,
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("node", &self.node)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// Opaque handle returned by `submit`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobTicket(pub String);

impl fmt::Display for JobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job state as reported by `poll`
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Queued,
    Running,
    Completed(Outputs),
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed(_) | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

/// External executor that runs jobs out of the scheduler's control
#[async_trait::async_trait]
pub trait ResourceManager: Send + Sync {
    async fn submit(&self, job: JobSpec) -> Result<JobTicket, DispatchError>;

    async fn poll(&self, ticket: &JobTicket) -> Result<JobState, DispatchError>;

    async fn cancel(&self, ticket: &JobTicket) -> Result<(), DispatchError>;
}

struct Job {
    state: JobState,
    handle: Option<JoinHandle<()>>,
}

/// Resource manager that runs every job as a tokio task in this process
pub struct InProcessManager {
    jobs: Arc<RwLock<HashMap<JobTicket, Job>>>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl InProcessManager {
    pub fn new() -> Self {
        Self::with_capacity(Semaphore::MAX_PERMITS)
    }

    /// Run at most `max_jobs` jobs at once; the rest stay queued
    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(max_jobs.max(1))),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of jobs ever submitted
    pub async fn submitted(&self) -> usize {
        self.jobs.read().await.len()
    }
}

impl Default for InProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn set_state(jobs: &RwLock<HashMap<JobTicket, Job>>, ticket: &JobTicket, state: JobState) {
    let mut jobs = jobs.write().await;
    if let Some(job) = jobs.get_mut(ticket) {
        if job.state != JobState::Cancelled {
            job.state = state;
        }
    }
}

#[async_trait::async_trait]
impl ResourceManager for InProcessManager {
    async fn submit(&self, job: JobSpec) -> Result<JobTicket, DispatchError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ticket = JobTicket(format!("job-{}", id));
        debug!(ticket = %ticket, node = %job.node, "job submitted");

        // register before spawning so the task always finds its entry
        self.jobs.write().await.insert(
            ticket.clone(),
            Job {
                state: JobState::Queued,
                handle: None,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let slots = Arc::clone(&self.slots);
        let task_ticket = ticket.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                set_state(&jobs, &task_ticket, JobState::Failed("manager closed".into())).await;
                return;
            };
            set_state(&jobs, &task_ticket, JobState::Running).await;
            let state = match job.interface.run(&job.inputs).await {
                Ok(outputs) => JobState::Completed(outputs),
                Err(e) => JobState::Failed(e.message),
            };
            set_state(&jobs, &task_ticket, state).await;
        });

        if let Some(entry) = self.jobs.write().await.get_mut(&ticket) {
            entry.handle = Some(handle);
        }
        Ok(ticket)
    }

    async fn poll(&self, ticket: &JobTicket) -> Result<JobState, DispatchError> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(ticket)
            .ok_or_else(|| DispatchError::UnknownJob(ticket.to_string()))?;

        // a panicked task never reports back
        if let Some(handle) = &job.handle {
            if handle.is_finished() && !job.state.is_terminal() {
                return Ok(JobState::Failed("job task aborted".to_string()));
            }
        }
        Ok(job.state.clone())
    }

    async fn cancel(&self, ticket: &JobTicket) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(ticket)
            .ok_or_else(|| DispatchError::UnknownJob(ticket.to_string()))?;
        if let Some(handle) = &job.handle {
            handle.abort();
        }
        if !job.state.is_terminal() {
            job.state = JobState::Cancelled;
        }
        debug!(ticket = %ticket, "job cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::{interface_fn, single_output};
    use crate::value::Value;
    use std::time::Duration;

    async fn wait_terminal(manager: &InProcessManager, ticket: &JobTicket) -> JobState {
        for _ in 0..200 {
            let state = manager.poll(ticket).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never finished", ticket);
    }

    fn spec(interface: Arc<dyn Interface>) -> JobSpec {
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Value::from(3));
        JobSpec {
            node: NodeKey::root("double"),
            inputs,
            interface,
        }
    }

    #[tokio::test]
    async fn test_submit_and_poll_to_completion() {
        let manager = InProcessManager::new();
        let double = interface_fn(|inputs| {
            let x = inputs["x"].as_number().unwrap_or_default();
            Ok(single_output("y", x * 2.0))
        });

        let ticket = manager.submit(spec(double)).await.unwrap();
        let state = wait_terminal(&manager, &ticket).await;
        assert_eq!(state, JobState::Completed(single_output("y", 6.0)));
        assert_eq!(manager.submitted().await, 1);
    }

    #[tokio::test]
    async fn test_failed_job_reports_message() {
        let manager = InProcessManager::new();
        let failing = interface_fn(|_| Err("no luck".into()));

        let ticket = manager.submit(spec(failing)).await.unwrap();
        let state = wait_terminal(&manager, &ticket).await;
        assert_eq!(state, JobState::Failed("no luck".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let manager = InProcessManager::with_capacity(1);
        let slow = interface_fn(|_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Outputs::new())
        });

        let first = manager.submit(spec(slow.clone())).await.unwrap();
        let second = manager.submit(spec(slow)).await.unwrap();
        manager.cancel(&second).await.unwrap();

        assert_eq!(manager.poll(&second).await.unwrap(), JobState::Cancelled);
        assert!(matches!(
            wait_terminal(&manager, &first).await,
            JobState::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_ticket() {
        let manager = InProcessManager::new();
        let err = manager.poll(&JobTicket("nope".into())).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownJob("nope".to_string()));
    }
}
