//! Acknowledgment barriers for committed cluster state changes.
//!
//! When a task asks to be acknowledged, the update queue opens an
//! [`AckBarrier`] after committing. The barrier counts down once per
//! required node. A peer acknowledges by publishing a metadata version at
//! least as new as the committed one, or explicitly through
//! [`AckCoordinator::on_node_ack`]. A peer that dies counts as a failed
//! acknowledgment, so dead peers never hold a barrier open.
//!
//! The barrier completes exactly once: either every required node
//! answered (the task's `on_all_nodes_acked` runs, carrying the last
//! per-node failure) or the ack timeout fired first (`on_ack_timeout`).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fact::MetadataVersionFact;
use crate::gossip::{FactSlot, PeerStateStore};
use crate::node::NodeId;
use crate::state::ClusterState;
use crate::task::UpdateTask;
use crate::ClusterError;

/// Countdown that reaches zero exactly once, either by counting or by
/// being fast-forwarded.
#[derive(Debug)]
pub(crate) struct CountDown {
    remaining: AtomicUsize,
}

impl CountDown {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Decrements. Returns `true` only for the call that reaches zero.
    pub(crate) fn count_down(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    /// Jumps to zero. Returns `true` if it was not already there.
    pub(crate) fn fast_forward(&self) -> bool {
        self.remaining.swap(0, Ordering::AcqRel) > 0
    }

    pub(crate) fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

/// Countdown of acknowledgments for one committed change.
pub struct AckBarrier {
    source: String,
    state_version: u64,
    expected_version: u64,
    master_id: NodeId,
    /// Nodes whose acknowledgment counts, by gossip address.
    required: HashMap<NodeId, IpAddr>,
    responded: Mutex<HashSet<NodeId>>,
    countdown: CountDown,
    last_failure: Mutex<Option<ClusterError>>,
    task: Mutex<Option<Box<dyn UpdateTask>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AckBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckBarrier")
            .field("source", &self.source)
            .field("state_version", &self.state_version)
            .field("expected_version", &self.expected_version)
            .field("required", &self.required.len())
            .field("done", &self.countdown.is_done())
            .finish_non_exhaustive()
    }
}

impl AckBarrier {
    fn new(source: &str, task: Box<dyn UpdateTask>, state: &ClusterState) -> Self {
        let required: HashMap<NodeId, IpAddr> = state
            .nodes()
            .iter()
            .filter(|node| task.must_ack(node))
            .map(|node| (node.id, node.addr.ip()))
            .collect();
        // the master's own commit is always one of the acks
        let countdown = CountDown::new(required.len().max(1));
        Self {
            source: source.to_owned(),
            state_version: state.version(),
            expected_version: state.metadata().version,
            master_id: state.nodes().master_id(),
            required,
            responded: Mutex::new(HashSet::new()),
            countdown,
            last_failure: Mutex::new(None),
            task: Mutex::new(Some(task)),
            timer: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state_version(&self) -> u64 {
        self.state_version
    }

    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    pub fn is_done(&self) -> bool {
        self.countdown.is_done()
    }

    fn node_at(&self, ip: IpAddr) -> Option<NodeId> {
        self.required
            .iter()
            .find(|(_, addr)| **addr == ip)
            .map(|(id, _)| *id)
    }

    /// Records one node's response. Each node is counted at most once;
    /// nodes outside the required set only count if they are the master.
    pub fn on_node_ack(&self, node: NodeId, failure: Option<ClusterError>) {
        if !self.required.contains_key(&node) && node != self.master_id {
            return;
        }
        if !self.responded.lock().unwrap_or_else(|e| e.into_inner()).insert(node) {
            return;
        }
        if let Some(err) = failure {
            debug!(source = %self.source, %node, error = %err, "node failed to acknowledge");
            *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        }

        if self.countdown.count_down() {
            debug!(source = %self.source, version = self.state_version, "all nodes acknowledged");
            self.stop_timer();
            let failure = self.last_failure.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(mut task) = self.take_task() {
                task.on_all_nodes_acked(failure);
            }
        }
    }

    fn on_timeout(&self) {
        if self.countdown.fast_forward() {
            warn!(
                source = %self.source,
                version = self.state_version,
                "timed out waiting for nodes to acknowledge"
            );
            if let Some(mut task) = self.take_task() {
                task.on_ack_timeout();
            }
        }
    }

    fn cancel(&self) {
        if self.countdown.fast_forward() {
            self.stop_timer();
            if let Some(mut task) = self.take_task() {
                task.on_all_nodes_acked(Some(ClusterError::Closed));
            }
        }
    }

    fn take_task(&self) -> Option<Box<dyn UpdateTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Tracks every open [`AckBarrier`] and routes peer responses to them.
pub struct AckCoordinator {
    gossip: Arc<dyn PeerStateStore>,
    barriers: Arc<Mutex<Vec<Arc<AckBarrier>>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for AckCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckCoordinator")
            .field("open", &self.open_barriers())
            .finish_non_exhaustive()
    }
}

impl AckCoordinator {
    pub fn new(gossip: Arc<dyn PeerStateStore>) -> Self {
        Self {
            gossip,
            barriers: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Opens a barrier for a freshly committed state. Must run inside a
    /// tokio runtime: the ack timeout is a spawned timer.
    pub(crate) fn open(
        &self,
        source: &str,
        task: Box<dyn UpdateTask>,
        state: &ClusterState,
        timeout: Duration,
    ) -> Arc<AckBarrier> {
        let barrier = Arc::new(AckBarrier::new(source, task, state));
        {
            // registered before the scan so a version published meanwhile is not missed
            let mut barriers = self.lock_barriers();
            if self.closed.load(Ordering::Acquire) {
                drop(barriers);
                barrier.cancel();
                return barrier;
            }
            barriers.push(barrier.clone());
        }

        barrier.on_node_ack(barrier.master_id, None);

        // peers that already caught up, or are already gone
        for (id, ip) in &barrier.required {
            if *id == barrier.master_id {
                continue;
            }
            if !self.gossip.is_alive(*ip) {
                barrier.on_node_ack(*id, Some(ClusterError::NodeFailed(*id)));
            } else if self.reported_version(*ip) >= Some(barrier.expected_version) {
                barrier.on_node_ack(*id, None);
            }
        }

        if !barrier.is_done() {
            let timer_barrier = barrier.clone();
            let open = Arc::downgrade(&self.barriers);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timer_barrier.on_timeout();
                if let Some(open) = open.upgrade() {
                    prune(&open);
                }
            });
            *barrier.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            // acked while the timer was being armed
            if barrier.is_done() {
                barrier.stop_timer();
            }
        }
        self.prune();
        barrier
    }

    /// A peer published a metadata version.
    pub fn on_metadata_version(&self, peer: IpAddr, fact: MetadataVersionFact) {
        for barrier in self.snapshot() {
            if fact.version >= barrier.expected_version {
                if let Some(id) = barrier.node_at(peer) {
                    barrier.on_node_ack(id, None);
                }
            }
        }
        self.prune();
    }

    /// A peer went down: every barrier waiting on it records a failure.
    pub fn on_peer_dead(&self, peer: IpAddr) {
        for barrier in self.snapshot() {
            if let Some(id) = barrier.node_at(peer) {
                barrier.on_node_ack(id, Some(ClusterError::NodeFailed(id)));
            }
        }
        self.prune();
    }

    /// Explicit acknowledgment of a state version by `node`.
    pub fn on_node_ack(&self, state_version: u64, node: NodeId, failure: Option<ClusterError>) {
        for barrier in self.snapshot() {
            if barrier.state_version == state_version {
                barrier.on_node_ack(node, failure.clone());
            }
        }
        self.prune();
    }

    /// Number of barriers still waiting.
    pub fn open_barriers(&self) -> usize {
        self.lock_barriers().iter().filter(|b| !b.is_done()).count()
    }

    /// Releases every open barrier with [`ClusterError::Closed`] and
    /// rejects future ones.
    pub fn cancel_all(&self) {
        let barriers = {
            let mut open = self.lock_barriers();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *open)
        };
        for barrier in barriers {
            barrier.cancel();
        }
    }

    fn reported_version(&self, peer: IpAddr) -> Option<u64> {
        let value = self.gossip.fact_of(peer, FactSlot::MetadataVersion)?;
        value
            .parse::<MetadataVersionFact>()
            .map(|fact| fact.version)
            .ok()
    }

    fn snapshot(&self) -> Vec<Arc<AckBarrier>> {
        self.lock_barriers().clone()
    }

    fn prune(&self) {
        prune(&self.barriers);
    }

    fn lock_barriers(&self) -> MutexGuard<'_, Vec<Arc<AckBarrier>>> {
        self.barriers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drops completed barriers from the open list.
fn prune(barriers: &Mutex<Vec<Arc<AckBarrier>>>) {
    barriers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|b| !b.is_done());
}
