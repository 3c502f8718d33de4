//! Peer state store: the gossip substrate this crate reads from.
//!
//! Every peer owns a small map of versioned facts (host id, metadata
//! version, shard states...) that anti-entropy gossip eventually spreads
//! to every reachable peer, together with liveness. This module defines
//! the [`PeerStateStore`] contract the cluster core consumes, and
//! [`MemoryGossip`], an in-process implementation where every handle sees
//! every publish immediately. It backs single-process deployments and
//! multi-node tests.
//!
//! Peers are keyed by IP address, like the storage layer's gossip. A fact
//! slot is only ever written by the peer that owns it.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::node::NodeId;

/// Default capacity of the change notification channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Named slot of a peer's gossip state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactSlot {
    /// The peer's host id (its [`NodeId`]).
    HostId,
    /// Bumped when the peer changed the persisted metadata.
    Schema,
    /// JSON map of index name to shard state.
    ShardStates,
    /// `"<uuid>/<version>"` of the metadata the peer has applied.
    MetadataVersion,
}

impl fmt::Display for FactSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactSlot::HostId => write!(f, "host-id"),
            FactSlot::Schema => write!(f, "schema"),
            FactSlot::ShardStates => write!(f, "shard-states"),
            FactSlot::MetadataVersion => write!(f, "metadata-version"),
        }
    }
}

/// Change notification from the peer state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Peer became reachable (or joined).
    Alive(IpAddr),
    /// Peer stopped responding.
    Dead(IpAddr),
    /// Peer published a new value for a slot.
    Changed {
        peer: IpAddr,
        slot: FactSlot,
        value: String,
    },
    /// Peer was explicitly removed from the ring.
    Removed(IpAddr),
}

impl PeerEvent {
    pub fn peer(&self) -> IpAddr {
        match self {
            PeerEvent::Alive(p) | PeerEvent::Dead(p) | PeerEvent::Removed(p) => *p,
            PeerEvent::Changed { peer, .. } => *peer,
        }
    }
}

/// The gossip substrate as seen by one node.
///
/// All reads are snapshots of the local replica; they may lag the real
/// state of remote peers.
pub trait PeerStateStore: Send + Sync + 'static {
    /// Address of the node this handle belongs to.
    fn local_address(&self) -> IpAddr;

    /// Publishes a fact in one of the local node's own slots.
    fn publish_fact(&self, slot: FactSlot, value: String);

    /// Latest known value of a peer's slot.
    fn fact_of(&self, peer: IpAddr, slot: FactSlot) -> Option<String>;

    /// Every peer known to gossip, alive or not, including the local node.
    fn endpoints(&self) -> Vec<IpAddr>;

    /// Alive peers that own part of the storage ring.
    fn live_token_owners(&self) -> Vec<IpAddr>;

    fn has_endpoint(&self, peer: IpAddr) -> bool;

    fn is_alive(&self, peer: IpAddr) -> bool;

    /// Datacenter (failure domain) of a peer.
    fn locality_of(&self, peer: IpAddr) -> Option<String>;

    fn rack_of(&self, peer: IpAddr) -> Option<String>;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Per-peer replica of gossip state.
#[derive(Debug, Clone)]
struct EndpointState {
    alive: bool,
    datacenter: String,
    rack: String,
    /// Slot value and the per-endpoint version it was written at.
    facts: HashMap<FactSlot, (String, u64)>,
    next_version: u64,
}

impl EndpointState {
    fn put(&mut self, slot: FactSlot, value: String) {
        self.next_version += 1;
        self.facts.insert(slot, (value, self.next_version));
    }
}

#[derive(Debug)]
struct Hub {
    endpoints: RwLock<HashMap<IpAddr, EndpointState>>,
    events: broadcast::Sender<PeerEvent>,
}

/// In-process gossip hub shared by every simulated node.
#[derive(Debug, Clone)]
pub struct MemoryGossip {
    hub: Arc<Hub>,
}

impl Default for MemoryGossip {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGossip {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            hub: Arc::new(Hub {
                endpoints: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Registers a live peer with its host id and returns its handle.
    pub fn join(&self, addr: IpAddr, host_id: NodeId, datacenter: &str, rack: &str) -> MemoryGossipHandle {
        {
            let mut endpoints = self.write();
            let endpoint = endpoints.entry(addr).or_insert_with(|| EndpointState {
                alive: true,
                datacenter: datacenter.to_owned(),
                rack: rack.to_owned(),
                facts: HashMap::new(),
                next_version: 0,
            });
            endpoint.alive = true;
            endpoint.datacenter = datacenter.to_owned();
            endpoint.rack = rack.to_owned();
            endpoint.put(FactSlot::HostId, host_id.to_full_string());
        }
        debug!(%addr, %host_id, datacenter, "peer joined gossip");
        self.emit(PeerEvent::Changed {
            peer: addr,
            slot: FactSlot::HostId,
            value: host_id.to_full_string(),
        });
        self.emit(PeerEvent::Alive(addr));
        self.handle(addr)
    }

    /// Returns the view of an existing (or future) peer.
    pub fn handle(&self, addr: IpAddr) -> MemoryGossipHandle {
        MemoryGossipHandle {
            gossip: self.clone(),
            local: addr,
        }
    }

    /// Flips a peer's liveness. No event is emitted if nothing changed.
    pub fn set_alive(&self, addr: IpAddr, alive: bool) {
        let changed = {
            let mut endpoints = self.write();
            match endpoints.get_mut(&addr) {
                Some(endpoint) if endpoint.alive != alive => {
                    endpoint.alive = alive;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(if alive {
                PeerEvent::Alive(addr)
            } else {
                PeerEvent::Dead(addr)
            });
        }
    }

    /// Drops a peer from the ring entirely.
    pub fn remove(&self, addr: IpAddr) {
        let removed = self.write().remove(&addr).is_some();
        if removed {
            self.emit(PeerEvent::Removed(addr));
        }
    }

    /// Publishes a fact on behalf of `addr`.
    pub fn publish(&self, addr: IpAddr, slot: FactSlot, value: String) {
        {
            let mut endpoints = self.write();
            let Some(endpoint) = endpoints.get_mut(&addr) else {
                debug!(%addr, %slot, "publish from unknown endpoint ignored");
                return;
            };
            if endpoint.facts.get(&slot).is_some_and(|(v, _)| *v == value) {
                return;
            }
            endpoint.put(slot, value.clone());
        }
        trace!(%addr, %slot, value, "fact published");
        self.emit(PeerEvent::Changed {
            peer: addr,
            slot,
            value,
        });
    }

    fn emit(&self, event: PeerEvent) {
        // no subscribers is fine: the facts are still readable
        let _ = self.hub.events.send(event);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<IpAddr, EndpointState>> {
        self.hub.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<IpAddr, EndpointState>> {
        self.hub.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's view of a [`MemoryGossip`] hub.
#[derive(Debug, Clone)]
pub struct MemoryGossipHandle {
    gossip: MemoryGossip,
    local: IpAddr,
}

impl MemoryGossipHandle {
    pub fn hub(&self) -> &MemoryGossip {
        &self.gossip
    }
}

impl PeerStateStore for MemoryGossipHandle {
    fn local_address(&self) -> IpAddr {
        self.local
    }

    fn publish_fact(&self, slot: FactSlot, value: String) {
        self.gossip.publish(self.local, slot, value);
    }

    fn fact_of(&self, peer: IpAddr, slot: FactSlot) -> Option<String> {
        self.gossip
            .read()
            .get(&peer)
            .and_then(|e| e.facts.get(&slot))
            .map(|(value, _)| value.clone())
    }

    fn endpoints(&self) -> Vec<IpAddr> {
        self.gossip.read().keys().copied().collect()
    }

    fn live_token_owners(&self) -> Vec<IpAddr> {
        self.gossip
            .read()
            .iter()
            .filter(|(_, e)| e.alive)
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn has_endpoint(&self, peer: IpAddr) -> bool {
        self.gossip.read().contains_key(&peer)
    }

    fn is_alive(&self, peer: IpAddr) -> bool {
        self.gossip.read().get(&peer).is_some_and(|e| e.alive)
    }

    fn locality_of(&self, peer: IpAddr) -> Option<String> {
        self.gossip.read().get(&peer).map(|e| e.datacenter.clone())
    }

    fn rack_of(&self, peer: IpAddr) -> Option<String> {
        self.gossip.read().get(&peer).map(|e| e.rack.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.gossip.hub.events.subscribe()
    }
}
