//! Cluster metadata and the immutable cluster state.
//!
//! A [`ClusterState`] bundles everything the cluster agrees on: metadata
//! (indices and settings), the node set and the active blocks. Instances
//! are immutable and shared as `Arc<ClusterState>`; an update task either
//! returns the same `Arc` (no change) or builds a new state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{NodeId, NodeSet, NodeSetDelta};

/// Lifecycle of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    #[default]
    Open,
    Close,
}

/// Metadata for a single index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub name: String,
    pub uuid: Uuid,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Storage keyspace backing this index. Defaults to the index name.
    pub keyspace: String,
    #[serde(default)]
    pub state: IndexState,
    /// Mapping per document type.
    #[serde(default)]
    pub mappings: BTreeMap<String, serde_json::Value>,
}

impl IndexMetaData {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        let name = name.into();
        Self {
            keyspace: name.clone(),
            name,
            uuid: Uuid::new_v4(),
            number_of_shards,
            number_of_replicas,
            state: IndexState::Open,
            mappings: BTreeMap::new(),
        }
    }
}

/// Cluster-wide metadata.
///
/// `(uuid, version)` identifies a metadata revision: `uuid` is the id of
/// the node that wrote it and `version` grows by one per write. Both are
/// used as the compare-and-swap key when persisting and are published in
/// gossip as `"<uuid>/<version>"`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetaData {
    pub uuid: Uuid,
    pub version: u64,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub indices: BTreeMap<String, IndexMetaData>,
}

impl MetaData {
    /// Copy of this metadata as the next revision written by `writer`.
    pub fn next_revision(&self, writer: NodeId) -> Self {
        Self {
            uuid: writer.0,
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetaData> {
        self.indices.get(name)
    }

    pub fn with_index(mut self, index: IndexMetaData) -> Self {
        self.indices.insert(index.name.clone(), index);
        self
    }

    pub fn without_index(mut self, name: &str) -> Self {
        self.indices.remove(name);
        self
    }

    /// The `(uuid, version)` identity as a display string.
    pub fn revision(&self) -> String {
        format!("{}/{}", self.uuid, self.version)
    }

    /// True if both carry the same revision identity.
    pub fn same_revision(&self, other: &MetaData) -> bool {
        self.uuid == other.uuid && self.version == other.version
    }
}

/// A named block restricting cluster operations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterBlock {
    pub id: u32,
    pub description: String,
    /// While present, metadata changes are applied but not persisted.
    pub disable_state_persistence: bool,
}

impl ClusterBlock {
    pub fn new(id: u32, description: impl Into<String>, disable_state_persistence: bool) -> Self {
        Self {
            id,
            description: description.into(),
            disable_state_persistence,
        }
    }

    /// The storage ring has not settled yet; metadata must not be saved.
    pub fn ring_not_ready() -> Self {
        Self::new(12, "storage ring not ready", true)
    }

    /// Writes to an index are rejected.
    pub fn index_read_only() -> Self {
        Self::new(5, "index read-only (api)", false)
    }
}

impl fmt::Display for ClusterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.id, self.description)
    }
}

/// Global and per-index blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterBlocks {
    global: BTreeSet<ClusterBlock>,
    indices: BTreeMap<String, BTreeSet<ClusterBlock>>,
}

impl ClusterBlocks {
    pub fn with_global(mut self, block: ClusterBlock) -> Self {
        self.global.insert(block);
        self
    }

    pub fn without_global(mut self, id: u32) -> Self {
        self.global.retain(|b| b.id != id);
        self
    }

    pub fn with_index_block(mut self, index: &str, block: ClusterBlock) -> Self {
        self.indices.entry(index.to_owned()).or_default().insert(block);
        self
    }

    /// Drops every block attached to `index`.
    pub fn without_index_blocks(mut self, index: &str) -> Self {
        self.indices.remove(index);
        self
    }

    pub fn has_global(&self, id: u32) -> bool {
        self.global.iter().any(|b| b.id == id)
    }

    pub fn index_blocks(&self, index: &str) -> impl Iterator<Item = &ClusterBlock> {
        self.indices.get(index).into_iter().flatten()
    }

    /// True if any global block suppresses metadata persistence.
    pub fn disables_state_persistence(&self) -> bool {
        self.global.iter().any(|b| b.disable_state_persistence)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.indices.is_empty()
    }
}

/// Immutable, versioned cluster state.
#[derive(Debug, Clone)]
pub struct ClusterState {
    version: u64,
    cluster_name: Arc<str>,
    metadata: Arc<MetaData>,
    nodes: Arc<NodeSet>,
    blocks: ClusterBlocks,
}

impl ClusterState {
    /// The state a process starts from, before any task has run.
    pub fn initial(cluster_name: &str, metadata: MetaData, nodes: NodeSet) -> Arc<Self> {
        Arc::new(Self {
            version: 0,
            cluster_name: Arc::from(cluster_name),
            metadata: Arc::new(metadata),
            nodes: Arc::new(nodes),
            blocks: ClusterBlocks::default(),
        })
    }

    /// Starts building a successor of `self`.
    pub fn to_builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            state: self.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn metadata(&self) -> &Arc<MetaData> {
        &self.metadata
    }

    pub fn nodes(&self) -> &Arc<NodeSet> {
        &self.nodes
    }

    pub fn blocks(&self) -> &ClusterBlocks {
        &self.blocks
    }

    /// True if `other` carries the same metadata, nodes and blocks.
    pub(crate) fn same_content(&self, other: &ClusterState) -> bool {
        (Arc::ptr_eq(&self.metadata, &other.metadata) || self.metadata == other.metadata)
            && (Arc::ptr_eq(&self.nodes, &other.nodes) || self.nodes.same_members(&other.nodes))
            && self.blocks == other.blocks
    }

    /// Stamps the committed version. Only the update queue does this.
    pub(crate) fn with_version(&self, version: u64) -> Arc<Self> {
        Arc::new(Self {
            version,
            ..self.clone()
        })
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster '{}' version {} metadata {} nodes {}",
            self.cluster_name,
            self.version,
            self.metadata.revision(),
            self.nodes.len()
        )
    }
}

/// Builder for a successor [`ClusterState`].
#[derive(Debug)]
pub struct ClusterStateBuilder {
    state: ClusterState,
}

impl ClusterStateBuilder {
    pub fn metadata(mut self, metadata: impl Into<Arc<MetaData>>) -> Self {
        self.state.metadata = metadata.into();
        self
    }

    pub fn nodes(mut self, nodes: impl Into<Arc<NodeSet>>) -> Self {
        self.state.nodes = nodes.into();
        self
    }

    pub fn blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.state.blocks = blocks;
        self
    }

    /// Finishes the new state. The version is assigned on commit.
    pub fn build(self) -> Arc<ClusterState> {
        Arc::new(self.state)
    }
}

/// Describes one committed state transition, handed to listeners.
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    source: String,
    state: Arc<ClusterState>,
    previous: Arc<ClusterState>,
    nodes_delta: NodeSetDelta,
}

impl ClusterChangedEvent {
    pub fn new(source: &str, state: Arc<ClusterState>, previous: Arc<ClusterState>) -> Self {
        let nodes_delta = state.nodes().delta(previous.nodes());
        Self {
            source: source.to_owned(),
            state,
            previous,
            nodes_delta,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn previous(&self) -> &Arc<ClusterState> {
        &self.previous
    }

    pub fn nodes_delta(&self) -> &NodeSetDelta {
        &self.nodes_delta
    }

    pub fn metadata_changed(&self) -> bool {
        !Arc::ptr_eq(self.state.metadata(), self.previous.metadata())
            && self.state.metadata() != self.previous.metadata()
    }

    pub fn nodes_changed(&self) -> bool {
        !self.state.nodes().same_members(self.previous.nodes())
    }

    pub fn blocks_changed(&self) -> bool {
        self.state.blocks() != self.previous.blocks()
    }

    /// True if the local node is master. It always is, since every node
    /// masters its own view.
    pub fn local_node_master(&self) -> bool {
        self.state.nodes().master_id() == self.state.nodes().local_id()
    }
}
