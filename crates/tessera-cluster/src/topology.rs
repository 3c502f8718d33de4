//! Cluster topology tracking.
//!
//! [`TopologyTracker`] turns peer state store notifications into the
//! node set. It keeps the authoritative [`NodeSet`] in a `watch` channel,
//! rebuilds it on every liveness or identity change, and submits a state
//! update task that picks the latest node set up when it runs. Gossip
//! callbacks never wait on the update queue.
//!
//! Only peers in the local datacenter are tracked. A peer is materialized
//! the first time it shows up with a parsable host id; it is marked dead
//! rather than deleted when it stops responding, and deleted only when
//! gossip removes it from the ring.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::ack::AckCoordinator;
use crate::config::ClusterConfig;
use crate::fact::{parse_host_id, MetadataVersionFact, ShardState, ShardStates};
use crate::gossip::{FactSlot, PeerEvent, PeerStateStore};
use crate::node::{NodeId, NodeRecord, NodeSet, NodeStatus};
use crate::persist::ConflictAwarePersister;
use crate::queue::{Lifecycle, StateUpdateQueue};
use crate::state::{ClusterState, MetaData};
use crate::task::{Priority, UpdateTask};
use crate::version::MetadataVersionWaiter;
use crate::ClusterError;

/// Rack assumed when gossip does not report one.
pub const DEFAULT_RACK: &str = "RAC1";

type InitialStateListener = Box<dyn FnOnce(&Arc<ClusterState>) + Send>;

/// Builds the local node record from what gossip knows about this node.
///
/// The local host id must already be published; datacenter and rack fall
/// back to the configured datacenter and [`DEFAULT_RACK`].
pub fn local_node(config: &ClusterConfig, gossip: &dyn PeerStateStore) -> Result<NodeRecord, ClusterError> {
    let ip = gossip.local_address();
    let value = gossip.fact_of(ip, FactSlot::HostId).ok_or_else(|| {
        ClusterError::Configuration(format!("no host id published for local address {ip}"))
    })?;
    let id = parse_host_id(&value)?;
    let datacenter = gossip
        .locality_of(ip)
        .unwrap_or_else(|| config.datacenter.clone());
    let rack = gossip.rack_of(ip).unwrap_or_else(|| DEFAULT_RACK.to_owned());
    Ok(NodeRecord::new(
        id,
        SocketAddr::new(ip, config.transport_port),
        &datacenter,
        &rack,
        NodeStatus::Alive,
    ))
}

#[derive(Default)]
struct InitialState {
    committed: Option<Arc<ClusterState>>,
    listeners: Vec<InitialStateListener>,
}

impl InitialState {
    fn fire(state: &Mutex<InitialState>, committed: &Arc<ClusterState>) {
        let listeners = {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            if guard.committed.is_some() {
                return;
            }
            guard.committed = Some(committed.clone());
            std::mem::take(&mut guard.listeners)
        };
        info!(version = committed.version(), nodes = committed.nodes().len(), "initial cluster state applied");
        for listener in listeners {
            listener(committed);
        }
    }
}

/// Maintains the node set from peer state store notifications.
pub struct TopologyTracker {
    config: ClusterConfig,
    gossip: Arc<dyn PeerStateStore>,
    datacenter: String,
    nodes: watch::Sender<Arc<NodeSet>>,
    queue: StateUpdateQueue,
    persister: ConflictAwarePersister,
    waiter: Arc<MetadataVersionWaiter>,
    acks: Arc<AckCoordinator>,
    shard_states: Mutex<ShardStates>,
    initial: Arc<Mutex<InitialState>>,
}

impl std::fmt::Debug for TopologyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyTracker")
            .field("datacenter", &self.datacenter)
            .field("nodes", &self.nodes.borrow().len())
            .finish_non_exhaustive()
    }
}

impl TopologyTracker {
    /// Creates a tracker seeded with the queue's current node set.
    pub fn new(
        config: ClusterConfig,
        gossip: Arc<dyn PeerStateStore>,
        queue: StateUpdateQueue,
        persister: ConflictAwarePersister,
        waiter: Arc<MetadataVersionWaiter>,
        acks: Arc<AckCoordinator>,
    ) -> Arc<Self> {
        let nodes = queue.current_state().nodes().clone();
        let datacenter = nodes
            .local_node()
            .and_then(|n| n.datacenter())
            .map_or_else(|| config.datacenter.clone(), str::to_owned);
        Arc::new(Self {
            config,
            gossip,
            datacenter,
            nodes: watch::Sender::new(nodes),
            queue,
            persister,
            waiter,
            acks,
            shard_states: Mutex::new(ShardStates::default()),
            initial: Arc::new(Mutex::new(InitialState::default())),
        })
    }

    /// Seeds the node set from every known endpoint, submits the initial
    /// discovery task and starts following gossip notifications until the
    /// queue stops.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        // subscribe before seeding so nothing published in between is lost
        let mut events = self.gossip.subscribe();
        self.resync();
        self.queue.submit(
            "initial-discovery",
            Priority::Urgent,
            NodeSetUpdate {
                nodes: self.nodes.subscribe(),
                metadata: None,
                initial: Some(self.initial.clone()),
            },
        );

        let tracker = self.clone();
        let mut lifecycle = self.queue.lifecycle_watch();
        tokio::spawn(async move {
            loop {
                if *lifecycle.borrow() != Lifecycle::Started {
                    break;
                }
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => tracker.on_peer_event(event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "peer notifications lagged, resynchronizing");
                            if tracker.resync() {
                                tracker.submit_update("topology-resync", None);
                            }
                            tracker.waiter.check_versions();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = lifecycle.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("topology tracker stopped");
        })
    }

    /// Applies one peer state store notification. Idempotent.
    pub fn on_peer_event(&self, event: PeerEvent) {
        trace!(?event, "peer event");
        let local = self.gossip.local_address();
        match event {
            PeerEvent::Alive(peer) => {
                if self.update_node(peer) {
                    self.submit_update("node-status-change", None);
                }
                self.waiter.check_versions();
            }
            PeerEvent::Dead(peer) => {
                self.acks.on_peer_dead(peer);
                if self.update_node(peer) {
                    self.submit_update("node-status-change", None);
                }
                self.waiter.check_versions();
            }
            PeerEvent::Removed(peer) => {
                self.acks.on_peer_dead(peer);
                if self.remove_node(peer) {
                    self.submit_update("node-removed", None);
                }
                self.waiter.check_versions();
            }
            PeerEvent::Changed { peer, slot, value } => match slot {
                FactSlot::HostId => {
                    if self.update_node(peer) {
                        self.submit_update("node-identity-change", None);
                    }
                }
                FactSlot::Schema if peer != local => self.on_remote_schema(peer),
                FactSlot::Schema => {}
                FactSlot::ShardStates if peer != local => {
                    self.update_node(peer);
                    self.submit_update("shard-state-change", None);
                }
                FactSlot::ShardStates => {}
                FactSlot::MetadataVersion => {
                    match value.parse::<MetadataVersionFact>() {
                        Ok(fact) => self.acks.on_metadata_version(peer, fact),
                        Err(e) => warn!(%peer, "ignoring metadata version fact: {e}"),
                    }
                    self.waiter.check_versions();
                }
            },
        }
    }

    /// Latest node set, which may be ahead of the committed cluster state.
    pub fn node_set(&self) -> Arc<NodeSet> {
        self.nodes.borrow().clone()
    }

    pub fn subscribe_nodes(&self) -> watch::Receiver<Arc<NodeSet>> {
        self.nodes.subscribe()
    }

    /// Runs `listener` once the first discovery task has committed, or right
    /// away if it already has.
    pub fn add_initial_state_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Arc<ClusterState>) + Send + 'static,
    {
        let committed = {
            let mut guard = self.initial.lock().unwrap_or_else(|e| e.into_inner());
            match &guard.committed {
                Some(state) => state.clone(),
                None => {
                    guard.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&committed);
    }

    /// Sets (or with `None` clears) the local shard state of `index` and
    /// publishes the local shard states.
    pub fn write_index_shard_state(&self, index: &str, state: Option<ShardState>) -> Result<(), ClusterError> {
        let encoded = {
            let mut states = self.lock_shard_states();
            states.set(index, state);
            states.encode()?
        };
        self.gossip.publish_fact(FactSlot::ShardStates, encoded);
        Ok(())
    }

    /// Shard state of `index` as published by `peer`, or `default`.
    pub fn read_index_shard_state(&self, peer: IpAddr, index: &str, default: ShardState) -> ShardState {
        self.shard_states_of(peer)
            .and_then(|states| states.get(index))
            .unwrap_or(default)
    }

    /// Republishes every local shard state.
    pub fn publish_all_shard_states(&self) -> Result<(), ClusterError> {
        let encoded = self.lock_shard_states().encode()?;
        self.gossip.publish_fact(FactSlot::ShardStates, encoded);
        Ok(())
    }

    /// Every shard state `peer` has published. Unreadable values are logged
    /// and treated as absent.
    pub fn shard_states_of(&self, peer: IpAddr) -> Option<ShardStates> {
        let value = self.gossip.fact_of(peer, FactSlot::ShardStates)?;
        match ShardStates::decode(&value) {
            Ok(states) => Some(states),
            Err(e) => {
                warn!(%peer, "ignoring shard states fact: {e}");
                None
            }
        }
    }

    /// Submits a task that installs the latest node set and, when given,
    /// newer metadata.
    fn submit_update(&self, source: &str, metadata: Option<MetaData>) {
        let priority = if metadata.is_some() {
            Priority::Urgent
        } else {
            Priority::Normal
        };
        self.queue.submit(
            source,
            priority,
            NodeSetUpdate {
                nodes: self.nodes.subscribe(),
                metadata,
                initial: None,
            },
        );
    }

    /// A remote peer wrote new metadata: load it and install it if it is
    /// newer than what this node has.
    fn on_remote_schema(&self, peer: IpAddr) {
        let current = self.queue.current_state().metadata().version;
        match self.persister.read() {
            Ok(Some(metadata)) if metadata.version > current => {
                debug!(%peer, version = metadata.version, "newer metadata published");
                self.submit_update("remote-metadata-change", Some(metadata));
            }
            Ok(_) => debug!(%peer, current, "no newer metadata to install"),
            Err(e) => warn!(%peer, "failed to read metadata after schema change: {e}"),
        }
    }

    /// Rebuilds records for every endpoint. Returns true if the node set
    /// changed.
    fn resync(&self) -> bool {
        let mut changed = false;
        for peer in self.gossip.endpoints() {
            changed |= self.update_node(peer);
        }
        let known = self.gossip.endpoints();
        let departed: Vec<IpAddr> = self
            .node_set()
            .iter()
            .map(|n| n.addr.ip())
            .filter(|ip| !known.contains(ip))
            .collect();
        for peer in departed {
            changed |= self.remove_node(peer);
        }
        changed
    }

    fn status_of(&self, peer: IpAddr) -> NodeStatus {
        if !self.gossip.has_endpoint(peer) {
            NodeStatus::Unknown
        } else if self.gossip.is_alive(peer) {
            NodeStatus::Alive
        } else {
            NodeStatus::Dead
        }
    }

    /// Recomputes the record of the peer at `peer`. Returns true if the
    /// node set changed.
    fn update_node(&self, peer: IpAddr) -> bool {
        let Some(value) = self.gossip.fact_of(peer, FactSlot::HostId) else {
            return false;
        };
        let host_id = match parse_host_id(&value) {
            Ok(id) => id,
            Err(e) => {
                warn!(%peer, "ignoring host id fact: {e}");
                return false;
            }
        };

        if peer == self.gossip.local_address() {
            return self.refresh_local_identity(host_id);
        }

        if self.gossip.locality_of(peer).as_deref() != Some(self.datacenter.as_str()) {
            return false;
        }
        let status = self.status_of(peer);
        let addr = SocketAddr::new(peer, self.config.transport_port);
        let rack = self
            .gossip
            .rack_of(peer)
            .unwrap_or_else(|| DEFAULT_RACK.to_owned());

        self.nodes.send_if_modified(|nodes| {
            let stale: Vec<NodeId> = nodes
                .iter()
                .filter(|n| n.addr.ip() == peer && n.id != host_id)
                .map(|n| n.id)
                .collect();
            let record = match nodes.get(&host_id) {
                Some(existing) if existing.addr == addr => {
                    if existing.status == status && stale.is_empty() {
                        return false;
                    }
                    existing.with_status(status)
                }
                _ => NodeRecord::new(host_id, addr, &self.datacenter, &rack, status),
            };

            let mut builder = nodes.to_builder();
            for id in &stale {
                debug!(%peer, stale = %id, "replacing stale node record");
                builder = builder.remove(id);
            }
            debug!(%peer, node = %record, "node record updated");
            *nodes = Arc::new(builder.put(record).build());
            true
        })
    }

    fn refresh_local_identity(&self, host_id: NodeId) -> bool {
        let Some(mut record) = self.nodes.borrow().local_node().cloned() else {
            return false;
        };
        if record.id == host_id {
            return false;
        }
        info!(previous = %record.id, current = %host_id, "local node identity changed");
        record.id = host_id;
        self.nodes.send_modify(|nodes| {
            *nodes = Arc::new(nodes.to_builder().local(record).build());
        });
        true
    }

    /// Deletes every remote record at `peer`. Returns true if any was there.
    fn remove_node(&self, peer: IpAddr) -> bool {
        if peer == self.gossip.local_address() {
            return false;
        }
        self.nodes.send_if_modified(|nodes| {
            let ids: Vec<NodeId> = nodes
                .iter()
                .filter(|n| n.addr.ip() == peer)
                .map(|n| n.id)
                .collect();
            if ids.is_empty() {
                return false;
            }
            let mut builder = nodes.to_builder();
            for id in &ids {
                builder = builder.remove(id);
            }
            info!(%peer, "node removed from the ring");
            *nodes = Arc::new(builder.build());
            true
        })
    }

    fn lock_shard_states(&self) -> std::sync::MutexGuard<'_, ShardStates> {
        self.shard_states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Installs the tracker's node set as of execution time.
struct NodeSetUpdate {
    nodes: watch::Receiver<Arc<NodeSet>>,
    metadata: Option<MetaData>,
    initial: Option<Arc<Mutex<InitialState>>>,
}

impl UpdateTask for NodeSetUpdate {
    fn execute(&mut self, current: &Arc<ClusterState>) -> Result<Arc<ClusterState>, ClusterError> {
        let nodes = self.nodes.borrow().clone();
        let newer = self
            .metadata
            .as_ref()
            .filter(|m| m.version > current.metadata().version)
            .cloned();

        let nodes_changed = !nodes.same_members(current.nodes());
        if !nodes_changed && newer.is_none() {
            return Ok(current.clone());
        }
        let mut builder = current.to_builder();
        if nodes_changed {
            builder = builder.nodes(nodes);
        }
        if let Some(metadata) = newer {
            builder = builder.metadata(metadata);
        }
        Ok(builder.build())
    }

    /// Already durable: either the local node's own state or metadata
    /// another node persisted.
    fn persist_metadata(&self) -> bool {
        false
    }

    fn on_processed(&mut self, _source: &str, _previous: &Arc<ClusterState>, current: &Arc<ClusterState>) {
        if let Some(initial) = self.initial.take() {
            InitialState::fire(&initial, current);
        }
    }

    fn on_failure(&mut self, source: &str, error: ClusterError) {
        warn!(source, "topology update failed: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::MemoryGossip;
    use crate::persist::{MemoryMetadataStore, MetadataStore, Revision};
    use crate::queue::QueueDeps;
    use crate::transport::MemoryConnector;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    struct Harness {
        gossip: MemoryGossip,
        store: Arc<MemoryMetadataStore>,
        queue: StateUpdateQueue,
        tracker: Arc<TopologyTracker>,
    }

    fn harness(gossip: &MemoryGossip) -> Harness {
        let config = ClusterConfig {
            datacenter: "dc1".into(),
            ..ClusterConfig::default()
        };
        let handle = Arc::new(gossip.handle(ip(1)));
        let local = local_node(&config, handle.as_ref()).unwrap();
        let store = Arc::new(MemoryMetadataStore::new());
        let persister = ConflictAwarePersister::new(store.clone());
        let acks = Arc::new(AckCoordinator::new(handle.clone()));
        let queue = StateUpdateQueue::new(
            ClusterState::initial("test", MetaData::default(), NodeSet::single(local)),
            QueueDeps {
                persister: persister.clone(),
                gossip: handle.clone(),
                acks: acks.clone(),
                connector: Arc::new(MemoryConnector::new()),
            },
        );
        queue.start();
        let waiter = Arc::new(MetadataVersionWaiter::new(handle.clone(), "dc1"));
        let tracker = TopologyTracker::new(config, handle, queue.clone(), persister, waiter, acks);
        tracker.start();
        Harness {
            gossip: gossip.clone(),
            store,
            queue,
            tracker,
        }
    }

    fn joined(peers: &[u8]) -> MemoryGossip {
        let gossip = MemoryGossip::new();
        gossip.join(ip(1), NodeId::new(), "dc1", "r1");
        for last in peers {
            gossip.join(ip(*last), NodeId::new(), "dc1", "r1");
        }
        gossip
    }

    async fn wait_for(h: &Harness, predicate: impl FnMut(&ClusterState) -> bool) -> Arc<ClusterState> {
        h.queue
            .wait_for_state(WAIT, predicate)
            .await
            .expect("cluster state should converge")
    }

    #[test]
    fn local_node_requires_host_id() {
        let gossip = MemoryGossip::new();
        let config = ClusterConfig::default();
        let err = local_node(&config, &gossip.handle(ip(1))).unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));

        let id = NodeId::new();
        gossip.join(ip(1), id, "dc7", "r3");
        let local = local_node(&config, &gossip.handle(ip(1))).unwrap();
        assert_eq!(local.id, id);
        assert_eq!(local.datacenter(), Some("dc7"));
        assert_eq!(local.rack(), Some("r3"));
        assert_eq!(local.addr.port(), config.transport_port);
    }

    #[tokio::test]
    async fn seeds_known_peers_and_fires_initial_listener() {
        let gossip = joined(&[2, 3]);
        let h = harness(&gossip);
        let state = wait_for(&h, |s| s.nodes().len() == 3).await;
        assert!(state.nodes().iter().all(|n| n.is_alive()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        h.tracker.add_initial_state_listener(move |state| {
            let _ = tx.send(state.version());
        });
        assert!(rx.await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn foreign_datacenter_is_ignored() {
        let gossip = joined(&[2]);
        gossip.join(ip(9), NodeId::new(), "dc2", "r1");
        let h = harness(&gossip);
        wait_for(&h, |s| s.nodes().len() == 2).await;
        assert!(h.tracker.node_set().by_ip(ip(9)).is_none());
    }

    #[tokio::test]
    async fn flapping_peer_converges_alive_without_duplicates() {
        let gossip = joined(&[2]);
        let h = harness(&gossip);
        wait_for(&h, |s| s.nodes().len() == 2).await;

        for _ in 0..10 {
            h.gossip.set_alive(ip(2), false);
            h.gossip.set_alive(ip(2), true);
        }
        // settled: nothing queued and the committed set matches the tracker
        let state = tokio::time::timeout(WAIT, async {
            loop {
                let state = h.queue.current_state();
                if h.queue.number_of_pending_tasks() == 0
                    && state.nodes().same_members(&h.tracker.node_set())
                    && state.nodes().by_ip(ip(2)).is_some_and(|n| n.is_alive())
                {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("topology should settle");
        assert_eq!(state.nodes().len(), 2);
        assert_eq!(state.nodes().iter().filter(|n| n.addr.ip() == ip(2)).count(), 1);
    }

    #[tokio::test]
    async fn dead_peer_is_marked_not_removed() {
        let gossip = joined(&[2]);
        let h = harness(&gossip);
        wait_for(&h, |s| s.nodes().len() == 2).await;

        h.gossip.set_alive(ip(2), false);
        let state = wait_for(&h, |s| s.nodes().by_ip(ip(2)).is_some_and(|n| !n.is_alive())).await;
        assert_eq!(state.nodes().by_ip(ip(2)).unwrap().status, NodeStatus::Dead);

        h.gossip.remove(ip(2));
        wait_for(&h, |s| s.nodes().len() == 1).await;
    }

    #[tokio::test]
    async fn restarted_peer_replaces_stale_record() {
        let gossip = joined(&[2]);
        let h = harness(&gossip);
        let before = wait_for(&h, |s| s.nodes().len() == 2).await;
        let old_id = before.nodes().by_ip(ip(2)).unwrap().id;

        let new_id = NodeId::new();
        h.gossip.join(ip(2), new_id, "dc1", "r1");
        let state = wait_for(&h, |s| s.nodes().contains(&new_id)).await;
        assert!(!state.nodes().contains(&old_id));
        assert_eq!(state.nodes().len(), 2);
    }

    #[tokio::test]
    async fn local_identity_refresh() {
        let gossip = joined(&[]);
        let h = harness(&gossip);
        let old_id = h.queue.current_state().nodes().local_id();

        let new_id = NodeId::new();
        h.gossip.join(ip(1), new_id, "dc1", "r1");
        let state = wait_for(&h, |s| s.nodes().local_id() == new_id).await;
        assert_eq!(state.nodes().master_id(), new_id);
        assert!(!state.nodes().contains(&old_id));
        assert_eq!(state.nodes().len(), 1);
    }

    #[tokio::test]
    async fn malformed_host_id_is_ignored() {
        let gossip = joined(&[]);
        let h = harness(&gossip);
        h.gossip.join(ip(2), NodeId::new(), "dc1", "r1");
        wait_for(&h, |s| s.nodes().len() == 2).await;

        h.gossip.publish(ip(2), FactSlot::HostId, "garbage".into());
        h.gossip.join(ip(3), NodeId::new(), "dc1", "r1");
        let state = wait_for(&h, |s| s.nodes().len() == 3).await;
        assert!(state.nodes().by_ip(ip(2)).is_some());
    }

    #[tokio::test]
    async fn remote_schema_installs_newer_metadata() {
        let gossip = joined(&[2]);
        let h = harness(&gossip);
        wait_for(&h, |s| s.nodes().len() == 2).await;

        let remote = MetaData::default().next_revision(NodeId::new());
        h.store
            .compare_and_swap(Revision::of(&MetaData::default()), &remote)
            .unwrap();
        h.gossip.publish(ip(2), FactSlot::Schema, remote.revision());

        let state = wait_for(&h, |s| s.metadata().version == 1).await;
        assert_eq!(state.metadata().uuid, remote.uuid);
    }

    #[tokio::test]
    async fn shard_states_round_trip_through_gossip() {
        let gossip = joined(&[2]);
        let h = harness(&gossip);
        h.tracker
            .write_index_shard_state("logs", Some(ShardState::Started))
            .unwrap();
        assert_eq!(
            h.tracker.read_index_shard_state(ip(1), "logs", ShardState::Unassigned),
            ShardState::Started
        );
        assert_eq!(
            h.tracker.read_index_shard_state(ip(2), "logs", ShardState::Unassigned),
            ShardState::Unassigned
        );

        h.tracker.write_index_shard_state("logs", None).unwrap();
        assert_eq!(h.tracker.shard_states_of(ip(1)), Some(ShardStates::default()));

        h.gossip.publish(ip(2), FactSlot::ShardStates, "not json".into());
        assert_eq!(h.tracker.shard_states_of(ip(2)), None);
    }
}
