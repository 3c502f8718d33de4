//! The cluster service: one handle wiring the convergence core together.
//!
//! [`ClusterService::start`] builds the update queue, topology tracker,
//! version waiter, ack coordinator and reconnect loop for one node, seeded
//! with the persisted metadata, and returns a cheaply cloneable handle.
//! Everything the rest of the node needs goes through this handle; there is
//! no global registry.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ack::AckCoordinator;
use crate::config::ClusterConfig;
use crate::fact::{MetadataVersionFact, ShardState, ShardStates};
use crate::gossip::{FactSlot, PeerStateStore};
use crate::index::{CreateIndexRequest, DeleteIndexRequest, IndexResponse, IndexTask};
use crate::node::{NodeId, NodeRecord, NodeSet};
use crate::persist::{ConflictAwarePersister, MetadataStore};
use crate::queue::{
    Lifecycle, ListenerControl, ListenerId, ListenerTier, PendingClusterTask, QueueDeps,
    StateUpdateQueue,
};
use crate::state::{ClusterChangedEvent, ClusterState};
use crate::task::{Priority, UpdateTask};
use crate::topology::{self, TopologyTracker};
use crate::transport::{spawn_reconnect_loop, NodeConnector};
use crate::version::MetadataVersionWaiter;
use crate::ClusterError;

struct ServiceInner {
    config: ClusterConfig,
    queue: StateUpdateQueue,
    tracker: Arc<TopologyTracker>,
    waiter: Arc<MetadataVersionWaiter>,
    acks: Arc<AckCoordinator>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running convergence core.
#[derive(Clone)]
pub struct ClusterService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ClusterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterService")
            .field("cluster", &self.inner.config.cluster_name)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl ClusterService {
    /// Starts the core for the node gossip knows as local.
    ///
    /// The local host id must already be published in gossip. Must be
    /// called from within a tokio runtime.
    pub fn start(
        config: ClusterConfig,
        gossip: Arc<dyn PeerStateStore>,
        store: Arc<dyn MetadataStore>,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let persister = ConflictAwarePersister::new(store);
        let metadata = persister.read()?.unwrap_or_default();
        let local = topology::local_node(&config, gossip.as_ref())?;
        let datacenter = local
            .datacenter()
            .map_or_else(|| config.datacenter.clone(), str::to_owned);
        info!(
            node = %local,
            cluster = %config.cluster_name,
            metadata = %metadata.revision(),
            "starting cluster service"
        );

        let initial = ClusterState::initial(&config.cluster_name, metadata, NodeSet::single(local));
        let acks = Arc::new(AckCoordinator::new(gossip.clone()));
        let queue = StateUpdateQueue::new(
            initial.clone(),
            QueueDeps {
                persister: persister.clone(),
                gossip: gossip.clone(),
                acks: acks.clone(),
                connector: connector.clone(),
            },
        );

        let mut background = Vec::new();
        background.extend(queue.start());
        // peers waiting on our version need a value even before the first commit
        gossip.publish_fact(
            FactSlot::MetadataVersion,
            MetadataVersionFact::of(initial.metadata()).to_string(),
        );

        let waiter = Arc::new(MetadataVersionWaiter::new(gossip.clone(), datacenter));
        let tracker = TopologyTracker::new(
            config.clone(),
            gossip,
            queue.clone(),
            persister,
            waiter.clone(),
            acks.clone(),
        );
        background.push(tracker.start());
        background.push(spawn_reconnect_loop(
            queue.subscribe(),
            connector,
            config.reconnect_interval(),
            queue.lifecycle_watch(),
        ));

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                queue,
                tracker,
                waiter,
                acks,
                background: Mutex::new(background),
            }),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.queue.lifecycle()
    }

    /// The local node as of the last committed state.
    pub fn local_node(&self) -> Option<NodeRecord> {
        self.current_node_set().local_node().cloned()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.current_node_set().local_id()
    }

    /// Node set of the last committed state.
    pub fn current_node_set(&self) -> Arc<NodeSet> {
        self.inner.queue.current_state().nodes().clone()
    }

    pub fn current_cluster_state(&self) -> Arc<ClusterState> {
        self.inner.queue.current_state()
    }

    /// Queues a state update task.
    pub fn submit(&self, source: impl Into<String>, priority: Priority, task: impl UpdateTask) {
        self.inner.queue.submit(source, priority, task);
    }

    /// Waits until every live peer of the local datacenter has applied
    /// metadata `version` or newer. False on timeout or shutdown.
    pub async fn await_version(&self, version: u64, timeout: Duration) -> bool {
        self.inner.waiter.await_version(version, timeout).await
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.inner.queue.subscribe()
    }

    pub async fn wait_for_state<F>(&self, timeout: Duration, predicate: F) -> Option<Arc<ClusterState>>
    where
        F: FnMut(&ClusterState) -> bool,
    {
        self.inner.queue.wait_for_state(timeout, predicate).await
    }

    pub fn add_listener<F>(&self, tier: ListenerTier, listener: F) -> ListenerId
    where
        F: FnMut(&ClusterChangedEvent) -> ListenerControl + Send + 'static,
    {
        self.inner.queue.add_listener(tier, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.queue.remove_listener(id)
    }

    pub fn pending_tasks(&self) -> Vec<PendingClusterTask> {
        self.inner.queue.pending_tasks()
    }

    pub fn number_of_pending_tasks(&self) -> usize {
        self.inner.queue.number_of_pending_tasks()
    }

    /// Runs `listener` once the first topology discovery has committed.
    pub fn add_initial_state_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Arc<ClusterState>) + Send + 'static,
    {
        self.inner.tracker.add_initial_state_listener(listener);
    }

    /// Records an explicit acknowledgment from `node` for the committed
    /// state `state_version`.
    pub fn on_node_ack(&self, state_version: u64, node: NodeId, failure: Option<ClusterError>) {
        self.inner.acks.on_node_ack(state_version, node, failure);
    }

    pub async fn create_index(&self, request: CreateIndexRequest) -> Result<IndexResponse, ClusterError> {
        let (tx, rx) = oneshot::channel();
        let task = IndexTask::create(request, tx);
        self.inner.queue.submit(task.source(), Priority::Urgent, task);
        // a dropped sender means the task was discarded by a stopped queue
        rx.await.unwrap_or(Err(ClusterError::Closed))
    }

    pub async fn delete_index(&self, request: DeleteIndexRequest) -> Result<IndexResponse, ClusterError> {
        let (tx, rx) = oneshot::channel();
        let task = IndexTask::delete(request, tx);
        self.inner.queue.submit(task.source(), Priority::Urgent, task);
        rx.await.unwrap_or(Err(ClusterError::Closed))
    }

    pub fn write_index_shard_state(&self, index: &str, state: Option<ShardState>) -> Result<(), ClusterError> {
        self.inner.tracker.write_index_shard_state(index, state)
    }

    pub fn read_index_shard_state(&self, peer: IpAddr, index: &str, default: ShardState) -> ShardState {
        self.inner.tracker.read_index_shard_state(peer, index, default)
    }

    pub fn publish_all_shard_states(&self) -> Result<(), ClusterError> {
        self.inner.tracker.publish_all_shard_states()
    }

    pub fn shard_states_of(&self, peer: IpAddr) -> Option<ShardStates> {
        self.inner.tracker.shard_states_of(peer)
    }

    /// Stops the queue, releases every waiter and ack barrier, and waits
    /// for the background tasks to finish.
    pub async fn shutdown(&self) {
        info!("shutting down cluster service");
        self.inner.queue.stop();
        self.inner.acks.cancel_all();
        self.inner.waiter.cancel_all();

        let background = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for handle in background {
            if let Err(e) = handle.await {
                debug!("background task ended abnormally: {e}");
            }
        }
        info!("cluster service stopped");
    }
}
