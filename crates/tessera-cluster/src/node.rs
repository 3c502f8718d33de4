//! Cluster membership: node identities, records and node-set snapshots.
//!
//! A [`NodeSet`] is an immutable, versioned point-in-time view of the
//! nodes this process knows about in its failure domain. It is rebuilt
//! and swapped as a whole, never edited in place, so readers holding an
//! `Arc<NodeSet>` always see a consistent view.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attribute key carrying the node's datacenter.
pub const ATTR_DATA_CENTER: &str = "data_center";
/// Attribute key carrying the node's rack.
pub const ATTR_RACK: &str = "rack";
/// Attribute key marking the node as holding data.
pub const ATTR_DATA: &str = "data";
/// Attribute key marking the node as master-eligible.
pub const ATTR_MASTER: &str = "master";

/// Unique identifier for a cluster node.
///
/// This is the storage layer's host id: assigned once and stable across
/// restarts of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a node ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }

    /// Full hyphenated form, as published in gossip.
    pub fn to_full_string(&self) -> String {
        self.0.to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 chars, like a short git hash
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Liveness of a node as last reported by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Alive,
    Dead,
    /// Seen in gossip but with no liveness information yet.
    Unknown,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "ALIVE"),
            NodeStatus::Dead => write!(f, "DEAD"),
            NodeStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Everything this process knows about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub addr: SocketAddr,
    pub attributes: BTreeMap<String, String>,
    pub status: NodeStatus,
}

impl NodeRecord {
    /// Builds a data+master node record in the given datacenter and rack.
    pub fn new(
        id: NodeId,
        addr: SocketAddr,
        datacenter: &str,
        rack: &str,
        status: NodeStatus,
    ) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_DATA.to_owned(), "true".to_owned());
        attributes.insert(ATTR_MASTER.to_owned(), "true".to_owned());
        attributes.insert(ATTR_DATA_CENTER.to_owned(), datacenter.to_owned());
        attributes.insert(ATTR_RACK.to_owned(), rack.to_owned());
        Self {
            id,
            name: default_node_name(addr.ip()),
            addr,
            attributes,
            status,
        }
    }

    /// Returns a copy with a different status.
    pub fn with_status(&self, status: NodeStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.attributes.get(ATTR_DATA_CENTER).map(String::as_str)
    }

    pub fn rack(&self) -> Option<&str> {
        self.attributes.get(ATTR_RACK).map(String::as_str)
    }

    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Alive
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}[{}]", self.name, self.id, self.addr, self.status)
    }
}

/// Derives a readable node name from its address.
///
/// IPv4 addresses become `node` followed by the zero-padded octets, so
/// `10.0.0.12` is `node010000000012`. IPv6 addresses keep their textual
/// form.
pub fn default_node_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("node{a:03}{b:03}{c:03}{d:03}")
        }
        IpAddr::V6(v6) => format!("node-{v6}"),
    }
}

/// Immutable snapshot of the known nodes.
///
/// The local node is always present and is always the master of its own
/// view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSet {
    version: u64,
    local_id: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl NodeSet {
    /// Creates a node set containing only the local node.
    pub fn single(local: NodeRecord) -> Self {
        let local_id = local.id;
        let mut nodes = BTreeMap::new();
        nodes.insert(local_id, local);
        Self {
            version: 0,
            local_id,
            nodes,
        }
    }

    /// Starts a builder seeded with this set's contents.
    pub fn to_builder(&self) -> NodeSetBuilder {
        NodeSetBuilder {
            version: self.version,
            local_id: self.local_id,
            nodes: self.nodes.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The master of this view, which is always the local node.
    pub fn master_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_node(&self) -> Option<&NodeRecord> {
        self.nodes.get(&self.local_id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Finds the node published at the given peer address.
    pub fn by_ip(&self, ip: IpAddr) -> Option<&NodeRecord> {
        self.nodes.values().find(|n| n.addr.ip() == ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_alive()).count()
    }

    /// Same members with the same statuses, ignoring the snapshot version.
    pub fn same_members(&self, other: &NodeSet) -> bool {
        self.local_id == other.local_id && self.nodes == other.nodes
    }

    /// Computes which nodes were added and removed relative to `previous`.
    pub fn delta(&self, previous: &NodeSet) -> NodeSetDelta {
        let added = self
            .nodes
            .values()
            .filter(|n| !previous.nodes.contains_key(&n.id))
            .cloned()
            .collect();
        let removed = previous
            .nodes
            .values()
            .filter(|n| !self.nodes.contains_key(&n.id))
            .cloned()
            .collect();
        NodeSetDelta { added, removed }
    }
}

/// Builder for the next [`NodeSet`].
#[derive(Debug, Clone)]
pub struct NodeSetBuilder {
    version: u64,
    local_id: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl NodeSetBuilder {
    /// Inserts or replaces a node.
    pub fn put(mut self, node: NodeRecord) -> Self {
        self.nodes.insert(node.id, node);
        self
    }

    /// Removes a node. Removing the local node is ignored.
    pub fn remove(mut self, id: &NodeId) -> Self {
        if *id != self.local_id {
            self.nodes.remove(id);
        }
        self
    }

    /// Replaces the local identity. The previous local record is dropped
    /// and `local` becomes both local and master.
    pub fn local(mut self, local: NodeRecord) -> Self {
        self.nodes.remove(&self.local_id);
        self.local_id = local.id;
        self.nodes.insert(local.id, local);
        self
    }

    /// Finishes the snapshot with the next version number.
    pub fn build(self) -> NodeSet {
        NodeSet {
            version: self.version + 1,
            local_id: self.local_id,
            nodes: self.nodes,
        }
    }
}

/// Membership difference between two node sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSetDelta {
    pub added: Vec<NodeRecord>,
    pub removed: Vec<NodeRecord>,
}

impl NodeSetDelta {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// One-line description for logs, e.g. `added {a, b}, removed {c}`.
    pub fn short_summary(&self) -> String {
        let names = |nodes: &[NodeRecord]| {
            nodes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match (self.added.is_empty(), self.removed.is_empty()) {
            (true, true) => String::new(),
            (false, true) => format!("added {{{}}}", names(&self.added)),
            (true, false) => format!("removed {{{}}}", names(&self.removed)),
            (false, false) => format!(
                "removed {{{}}}, added {{{}}}",
                names(&self.removed),
                names(&self.added)
            ),
        }
    }
}
