//! Cluster state update tasks.
//!
//! Every change to the cluster state is expressed as an [`UpdateTask`]
//! submitted to the update queue. A task computes the next state from
//! the current one; the queue takes care of ordering, persistence,
//! publication and acknowledgment, and reports back through the task's
//! callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::node::NodeRecord;
use crate::state::ClusterState;
use crate::ClusterError;

/// Queue priority. Higher priorities always run first; tasks of equal
/// priority run in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Languid,
    Low,
    Normal,
    High,
    Urgent,
    Immediate,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Languid => "LANGUID",
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
            Priority::Immediate => "IMMEDIATE",
        };
        f.write_str(name)
    }
}

/// A unit of cluster state change.
///
/// Only [`execute`](UpdateTask::execute) is required. Callbacks run on
/// the queue's executor (or on the ack timer) and must not block.
pub trait UpdateTask: Send + 'static {
    /// Computes the next state. Returning `current` itself (the same
    /// `Arc`) means nothing changed.
    fn execute(&mut self, current: &Arc<ClusterState>) -> Result<Arc<ClusterState>, ClusterError>;

    /// The task failed, timed out in the queue, or could not be persisted.
    fn on_failure(&mut self, _source: &str, _error: ClusterError) {}

    /// The new state (or the unchanged one for a no-op) was committed.
    fn on_processed(&mut self, _source: &str, _previous: &Arc<ClusterState>, _current: &Arc<ClusterState>) {}

    /// Whether a metadata change made by this task must be persisted.
    fn persist_metadata(&self) -> bool {
        true
    }

    /// How long the task may wait in the queue before it fails.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Set to wait for peer acknowledgments, up to the returned duration.
    fn ack_timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether `node` must acknowledge this change.
    fn must_ack(&self, _node: &NodeRecord) -> bool {
        true
    }

    /// Every required node acknowledged. `failure` is the last per-node
    /// failure, if any node failed instead of acknowledging.
    fn on_all_nodes_acked(&mut self, _failure: Option<ClusterError>) {}

    /// The ack timeout elapsed before every node acknowledged.
    fn on_ack_timeout(&mut self) {}
}

/// Outcome notifications of a [`FnTask`].
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Processed {
        previous: Arc<ClusterState>,
        current: Arc<ClusterState>,
    },
    Failed(ClusterError),
    AllAcked(Option<ClusterError>),
    AckTimeout,
}

type ExecuteFn =
    Box<dyn FnMut(&Arc<ClusterState>) -> Result<Arc<ClusterState>, ClusterError> + Send>;
type MustAckFn = Box<dyn Fn(&NodeRecord) -> bool + Send>;

/// An update task built from a closure.
///
/// Outcomes are reported on an optional channel so callers can await
/// them:
///
/// ```rust,ignore
/// let (task, mut events) = FnTask::new(|state| Ok(state.clone())).with_events();
/// service.submit("noop", Priority::Normal, task);
/// assert!(matches!(events.recv().await, Some(TaskEvent::Processed { .. })));
/// ```
pub struct FnTask {
    execute: ExecuteFn,
    persist: bool,
    timeout: Option<Duration>,
    ack_timeout: Option<Duration>,
    must_ack: Option<MustAckFn>,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("persist", &self.persist)
            .field("timeout", &self.timeout)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

impl FnTask {
    pub fn new<F>(execute: F) -> Self
    where
        F: FnMut(&Arc<ClusterState>) -> Result<Arc<ClusterState>, ClusterError> + Send + 'static,
    {
        Self {
            execute: Box::new(execute),
            persist: true,
            timeout: None,
            ack_timeout: None,
            must_ack: None,
            events: None,
        }
    }

    /// Applies metadata changes without persisting them.
    pub fn without_persistence(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Waits for every node to acknowledge, up to `timeout`.
    pub fn with_ack(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    /// Waits for the nodes matching `must_ack` only.
    pub fn with_ack_filter<P>(mut self, timeout: Duration, must_ack: P) -> Self
    where
        P: Fn(&NodeRecord) -> bool + Send + 'static,
    {
        self.ack_timeout = Some(timeout);
        self.must_ack = Some(Box::new(must_ack));
        self
    }

    /// Attaches an outcome channel and returns its receiving end.
    pub fn with_events(mut self) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        (self, rx)
    }

    fn notify(&self, event: TaskEvent) {
        if let Some(tx) = &self.events {
            // receiver gone means nobody is waiting anymore
            let _ = tx.send(event);
        }
    }
}

impl UpdateTask for FnTask {
    fn execute(&mut self, current: &Arc<ClusterState>) -> Result<Arc<ClusterState>, ClusterError> {
        (self.execute)(current)
    }

    fn on_failure(&mut self, _source: &str, error: ClusterError) {
        self.notify(TaskEvent::Failed(error));
    }

    fn on_processed(&mut self, _source: &str, previous: &Arc<ClusterState>, current: &Arc<ClusterState>) {
        self.notify(TaskEvent::Processed {
            previous: previous.clone(),
            current: current.clone(),
        });
    }

    fn persist_metadata(&self) -> bool {
        self.persist
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout
    }

    fn must_ack(&self, node: &NodeRecord) -> bool {
        self.must_ack.as_ref().map_or(true, |p| p(node))
    }

    fn on_all_nodes_acked(&mut self, failure: Option<ClusterError>) {
        self.notify(TaskEvent::AllAcked(failure));
    }

    fn on_ack_timeout(&mut self) {
        self.notify(TaskEvent::AckTimeout);
    }
}
