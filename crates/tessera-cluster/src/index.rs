//! Index creation and deletion.
//!
//! Both run as acknowledged update tasks at urgent priority: they wait at
//! most the master timeout in the queue, then up to the ack timeout for
//! peers to apply the new metadata. The caller gets exactly one response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::state::{ClusterState, IndexMetaData};
use crate::task::UpdateTask;
use crate::ClusterError;

/// Request to create an index.
#[derive(Debug, Clone)]
pub struct CreateIndexRequest {
    pub name: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub mappings: BTreeMap<String, serde_json::Value>,
    pub ack_timeout: Duration,
    pub master_timeout: Duration,
}

impl CreateIndexRequest {
    /// One shard, no replicas, timeouts from `config`.
    pub fn new(name: impl Into<String>, config: &ClusterConfig) -> Self {
        Self {
            name: name.into(),
            number_of_shards: 1,
            number_of_replicas: 0,
            mappings: BTreeMap::new(),
            ack_timeout: config.ack_timeout(),
            master_timeout: config.master_timeout(),
        }
    }

    pub fn shards(mut self, number_of_shards: u32, number_of_replicas: u32) -> Self {
        self.number_of_shards = number_of_shards;
        self.number_of_replicas = number_of_replicas;
        self
    }

    pub fn mapping(mut self, doc_type: impl Into<String>, mapping: serde_json::Value) -> Self {
        self.mappings.insert(doc_type.into(), mapping);
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn master_timeout(mut self, timeout: Duration) -> Self {
        self.master_timeout = timeout;
        self
    }
}

/// Request to delete an index.
#[derive(Debug, Clone)]
pub struct DeleteIndexRequest {
    pub name: String,
    pub ack_timeout: Duration,
    pub master_timeout: Duration,
}

impl DeleteIndexRequest {
    pub fn new(name: impl Into<String>, config: &ClusterConfig) -> Self {
        Self {
            name: name.into(),
            ack_timeout: config.ack_timeout(),
            master_timeout: config.master_timeout(),
        }
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

/// Outcome of an acknowledged index operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResponse {
    /// False if the ack timeout fired before every peer applied the change.
    pub acknowledged: bool,
}

pub(crate) type IndexReply = oneshot::Sender<Result<IndexResponse, ClusterError>>;

enum IndexOp {
    Create(IndexMetaData),
    Delete(String),
}

/// Update task for one index operation.
pub(crate) struct IndexTask {
    op: IndexOp,
    ack_timeout: Duration,
    master_timeout: Duration,
    reply: Option<IndexReply>,
}

impl IndexTask {
    pub(crate) fn create(request: CreateIndexRequest, reply: IndexReply) -> Self {
        let mut index = IndexMetaData::new(
            request.name,
            request.number_of_shards,
            request.number_of_replicas,
        );
        index.mappings = request.mappings;
        Self {
            op: IndexOp::Create(index),
            ack_timeout: request.ack_timeout,
            master_timeout: request.master_timeout,
            reply: Some(reply),
        }
    }

    pub(crate) fn delete(request: DeleteIndexRequest, reply: IndexReply) -> Self {
        Self {
            op: IndexOp::Delete(request.name),
            ack_timeout: request.ack_timeout,
            master_timeout: request.master_timeout,
            reply: Some(reply),
        }
    }

    pub(crate) fn source(&self) -> String {
        match &self.op {
            IndexOp::Create(index) => format!("create-index [{}]", index.name),
            IndexOp::Delete(name) => format!("delete-index [{name}]"),
        }
    }

    fn respond(&mut self, result: Result<IndexResponse, ClusterError>) {
        if let Some(reply) = self.reply.take() {
            // the caller may have stopped waiting
            let _ = reply.send(result);
        }
    }
}

impl UpdateTask for IndexTask {
    fn execute(&mut self, current: &Arc<ClusterState>) -> Result<Arc<ClusterState>, ClusterError> {
        let writer = current.nodes().local_id();
        let metadata = current.metadata().as_ref().clone();
        let next = match &self.op {
            IndexOp::Create(index) => {
                if metadata.has_index(&index.name) {
                    return Err(ClusterError::IndexAlreadyExists(index.name.clone()));
                }
                let metadata = metadata.with_index(index.clone()).next_revision(writer);
                current.to_builder().metadata(metadata).build()
            }
            IndexOp::Delete(name) => {
                if !metadata.has_index(name) {
                    return Err(ClusterError::IndexMissing(name.clone()));
                }
                let metadata = metadata.without_index(name).next_revision(writer);
                let blocks = current.blocks().clone().without_index_blocks(name);
                current.to_builder().metadata(metadata).blocks(blocks).build()
            }
        };
        Ok(next)
    }

    fn on_failure(&mut self, source: &str, error: ClusterError) {
        debug!(source, "index operation failed: {error}");
        self.respond(Err(error));
    }

    fn on_processed(&mut self, source: &str, _previous: &Arc<ClusterState>, current: &Arc<ClusterState>) {
        info!(source, metadata = %current.metadata().revision(), "index metadata updated");
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.master_timeout)
    }

    fn ack_timeout(&self) -> Option<Duration> {
        Some(self.ack_timeout)
    }

    fn on_all_nodes_acked(&mut self, _failure: Option<ClusterError>) {
        self.respond(Ok(IndexResponse { acknowledged: true }));
    }

    fn on_ack_timeout(&mut self) {
        self.respond(Ok(IndexResponse { acknowledged: false }));
    }
}
