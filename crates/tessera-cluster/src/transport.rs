//! Node connections.
//!
//! The core only needs to know how to connect to and disconnect from a
//! node; the wire protocol lives elsewhere. [`NodeConnector`] is that
//! seam. The reconnect loop periodically retries alive nodes that have no
//! connection, re-checking membership around each attempt so a node that
//! left meanwhile is not reported as a failure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::node::{NodeId, NodeRecord};
use crate::queue::Lifecycle;
use crate::state::ClusterState;
use crate::ClusterError;

/// Consecutive reconnect failures between two warnings for the same node.
pub const FAILURES_PER_WARNING: u32 = 6;

/// Opens and closes connections to cluster nodes.
#[async_trait]
pub trait NodeConnector: Send + Sync + 'static {
    async fn connect(&self, node: &NodeRecord) -> Result<(), ClusterError>;

    async fn disconnect(&self, node: &NodeRecord);

    fn is_connected(&self, node: &NodeRecord) -> bool;
}

/// Connector that only tracks connection state in memory. Nodes can be
/// marked unreachable to simulate failures.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    connected: Mutex<HashSet<NodeId>>,
    unreachable: Mutex<HashSet<NodeId>>,
    attempts: AtomicU64,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        let mut unreachable = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        if reachable {
            unreachable.remove(&node);
        } else {
            unreachable.insert(node);
            self.connected.lock().unwrap_or_else(|e| e.into_inner()).remove(&node);
        }
    }

    pub fn connected_nodes(&self) -> HashSet<NodeId> {
        self.connected.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Total connect attempts so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NodeConnector for MemoryConnector {
    async fn connect(&self, node: &NodeRecord) -> Result<(), ClusterError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.unreachable.lock().unwrap_or_else(|e| e.into_inner()).contains(&node.id) {
            return Err(ClusterError::Connectivity {
                node: node.id,
                reason: "unreachable".into(),
            });
        }
        self.connected.lock().unwrap_or_else(|e| e.into_inner()).insert(node.id);
        Ok(())
    }

    async fn disconnect(&self, node: &NodeRecord) {
        self.connected.lock().unwrap_or_else(|e| e.into_inner()).remove(&node.id);
    }

    fn is_connected(&self, node: &NodeRecord) -> bool {
        self.connected.lock().unwrap_or_else(|e| e.into_inner()).contains(&node.id)
    }
}

/// Connects to `nodes` in the background. Failures are only logged; the
/// reconnect loop retries later.
pub(crate) fn connect_in_background(connector: &Arc<dyn NodeConnector>, nodes: Vec<NodeRecord>) {
    if nodes.is_empty() {
        return;
    }
    let connector = connector.clone();
    tokio::spawn(async move {
        for node in nodes {
            if let Err(e) = connector.connect(&node).await {
                warn!("failed to connect to node {node}: {e}");
            }
        }
    });
}

/// Disconnects from `nodes` in the background.
pub(crate) fn disconnect_in_background(connector: &Arc<dyn NodeConnector>, nodes: Vec<NodeRecord>) {
    if nodes.is_empty() {
        return;
    }
    let connector = connector.clone();
    tokio::spawn(async move {
        for node in nodes {
            connector.disconnect(&node).await;
            debug!("disconnected from node {node}");
        }
    });
}

/// Summary of one reconnect pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectReport {
    pub attempted: usize,
    pub connected: usize,
    pub warned: usize,
}

/// Per-node failure counts carried across reconnect passes.
#[derive(Debug, Default)]
pub struct Reconnector {
    failures: HashMap<NodeId, u32>,
}

impl Reconnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries every alive, unconnected remote node once.
    pub async fn run_once(
        &mut self,
        state: &watch::Receiver<Arc<ClusterState>>,
        connector: &dyn NodeConnector,
    ) -> ReconnectReport {
        let mut report = ReconnectReport::default();
        let snapshot = state.borrow().clone();
        let local_id = snapshot.nodes().local_id();

        for node in snapshot.nodes().iter() {
            if node.id == local_id || !node.is_alive() || connector.is_connected(node) {
                continue;
            }
            // the node may have left since the snapshot was taken
            if !still_member(state, &node.id) {
                continue;
            }
            report.attempted += 1;
            match connector.connect(node).await {
                Ok(()) => {
                    report.connected += 1;
                    self.failures.remove(&node.id);
                }
                Err(e) => {
                    if !still_member(state, &node.id) {
                        continue;
                    }
                    let count = self.failures.entry(node.id).or_insert(0);
                    *count += 1;
                    if *count % FAILURES_PER_WARNING == 0 {
                        *count = 0;
                        report.warned += 1;
                        warn!("failed to reconnect to node {node}: {e}");
                    }
                }
            }
        }

        let current = state.borrow().clone();
        self.failures.retain(|id, _| current.nodes().contains(id));
        report
    }

    pub fn failure_count(&self, node: &NodeId) -> u32 {
        self.failures.get(node).copied().unwrap_or(0)
    }
}

fn still_member(state: &watch::Receiver<Arc<ClusterState>>, id: &NodeId) -> bool {
    state.borrow().nodes().contains(id)
}

/// Runs [`Reconnector::run_once`] every `interval` until the queue leaves
/// the started state.
pub fn spawn_reconnect_loop(
    state: watch::Receiver<Arc<ClusterState>>,
    connector: Arc<dyn NodeConnector>,
    interval: Duration,
    mut lifecycle: watch::Receiver<Lifecycle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reconnector = Reconnector::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; skip it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = reconnector.run_once(&state, connector.as_ref()).await;
                    if report.attempted > 0 {
                        debug!(
                            attempted = report.attempted,
                            connected = report.connected,
                            "reconnect pass finished"
                        );
                    }
                }
                changed = lifecycle.changed() => {
                    if changed.is_err() || *lifecycle.borrow() != Lifecycle::Started {
                        break;
                    }
                }
            }
        }
        debug!("reconnect loop stopped");
    })
}
