//! tessera-cluster: metadata convergence for a peer-to-peer search cluster.
//!
//! Every node of the cluster runs the same core. There is no leader
//! election: each node masters its own view, and the nodes converge on one
//! shared piece of metadata (index definitions and settings) through a
//! durable store with compare-and-swap, plus facts published over gossip.
//!
//! # Architecture
//!
//! - **Peer state store** ([`PeerStateStore`]): the gossip substrate, a
//!   per-peer map of small facts plus liveness.
//! - **Topology** ([`TopologyTracker`]): turns gossip notifications into
//!   the node set.
//! - **Update queue** ([`StateUpdateQueue`]): the single writer of the
//!   cluster state; tasks run one at a time in priority order.
//! - **Persistence** ([`ConflictAwarePersister`]): CAS writes of the
//!   metadata; conflicts are retried by the queue.
//! - **Acknowledgment** ([`AckCoordinator`]): waits for peers to apply a
//!   committed change, with a timeout.
//! - **Version waits** ([`MetadataVersionWaiter`]): blocks callers until
//!   peers report a metadata version.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_cluster::{
//!     ClusterConfig, ClusterService, CreateIndexRequest, MemoryConnector, MemoryGossip,
//!     MemoryMetadataStore, NodeId,
//! };
//!
//! let gossip = MemoryGossip::new();
//! let handle = gossip.join("10.0.0.1".parse()?, NodeId::new(), "DC1", "RAC1");
//! let service = ClusterService::start(
//!     ClusterConfig::default(),
//!     Arc::new(handle),
//!     Arc::new(MemoryMetadataStore::new()),
//!     Arc::new(MemoryConnector::new()),
//! )?;
//!
//! let config = service.config().clone();
//! let response = service.create_index(CreateIndexRequest::new("logs", &config)).await?;
//! assert!(response.acknowledged);
//! ```

mod ack;
mod config;
mod error;
mod fact;
mod gossip;
mod index;
mod node;
mod persist;
mod queue;
mod service;
mod state;
mod task;
mod topology;
mod transport;
mod version;

pub use ack::{AckBarrier, AckCoordinator};
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use fact::{parse_host_id, MetadataVersionFact, ShardState, ShardStates};
pub use gossip::{
    FactSlot, MemoryGossip, MemoryGossipHandle, PeerEvent, PeerStateStore, DEFAULT_EVENT_CAPACITY,
};
pub use index::{CreateIndexRequest, DeleteIndexRequest, IndexResponse};
pub use node::{
    default_node_name, NodeId, NodeRecord, NodeSet, NodeSetBuilder, NodeSetDelta, NodeStatus,
    ATTR_DATA, ATTR_DATA_CENTER, ATTR_MASTER, ATTR_RACK,
};
pub use persist::{
    ConflictAwarePersister, FileMetadataStore, MemoryMetadataStore, MetadataStore, Revision,
};
pub use queue::{
    Lifecycle, ListenerControl, ListenerId, ListenerTier, PendingClusterTask, QueueDeps,
    StateListener, StateUpdateQueue,
};
pub use service::ClusterService;
pub use state::{
    ClusterBlock, ClusterBlocks, ClusterChangedEvent, ClusterState, ClusterStateBuilder,
    IndexMetaData, IndexState, MetaData,
};
pub use task::{FnTask, Priority, TaskEvent, UpdateTask};
pub use topology::{local_node, TopologyTracker, DEFAULT_RACK};
pub use transport::{
    spawn_reconnect_loop, MemoryConnector, NodeConnector, ReconnectReport, Reconnector,
    FAILURES_PER_WARNING,
};
pub use version::MetadataVersionWaiter;
