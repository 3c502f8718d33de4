//! Test helpers for running multi-node clusters in one process.
//!
//! Every node gets its own `ClusterService` on a shared `MemoryGossip`
//! hub and, unless a test brings its own, a shared in-memory metadata
//! store.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_cluster::{
    ClusterConfig, ClusterService, ClusterState, MemoryConnector, MemoryGossip,
    MemoryMetadataStore, MetadataStore, NodeId,
};

/// Default bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub const DATACENTER: &str = "DC1";

pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}

/// Short timeouts so failure paths finish quickly.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        cluster_name: "it".into(),
        datacenter: DATACENTER.into(),
        reconnect_interval_ms: 50,
        ack_timeout_ms: 2_000,
        master_timeout_ms: 2_000,
        ..ClusterConfig::default()
    }
}

/// One node of a test cluster.
pub struct TestNode {
    pub ip: IpAddr,
    pub id: NodeId,
    pub service: ClusterService,
    pub connector: Arc<MemoryConnector>,
}

/// A set of nodes sharing gossip and a metadata store.
pub struct TestCluster {
    pub gossip: MemoryGossip,
    pub store: Arc<dyn MetadataStore>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Starts `n` nodes at 10.0.0.1 through 10.0.0.n.
    pub fn start(n: u8) -> Self {
        Self::start_with_store(n, Arc::new(MemoryMetadataStore::new()))
    }

    pub fn start_with_store(n: u8, store: Arc<dyn MetadataStore>) -> Self {
        let mut cluster = Self {
            gossip: MemoryGossip::new(),
            store,
            nodes: Vec::new(),
        };
        for last in 1..=n {
            cluster.add_node(last);
        }
        cluster
    }

    /// Joins a node at 10.0.0.`last` and starts its service.
    pub fn add_node(&mut self, last: u8) -> &TestNode {
        let id = NodeId::new();
        let handle = self.gossip.join(ip(last), id, DATACENTER, "RAC1");
        let connector = Arc::new(MemoryConnector::new());
        let service = ClusterService::start(
            test_config(),
            Arc::new(handle),
            self.store.clone(),
            connector.clone(),
        )
        .expect("cluster service should start");
        self.nodes.push(TestNode {
            ip: ip(last),
            id,
            service,
            connector,
        });
        self.nodes.last().expect("node was just pushed")
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Waits until every node's committed state satisfies `predicate`.
    pub async fn wait_all<F>(&self, predicate: F)
    where
        F: Fn(&ClusterState) -> bool + Clone,
    {
        for node in &self.nodes {
            let state = node.service.wait_for_state(WAIT, predicate.clone()).await;
            assert!(
                state.is_some(),
                "node {} did not reach the expected state; current: {}",
                node.ip,
                node.service.current_cluster_state()
            );
        }
    }

    /// Waits until every node sees all `n` cluster members alive.
    pub async fn wait_for_members(&self, n: usize) {
        self.wait_all(move |s| s.nodes().len() == n && s.nodes().alive_count() == n)
            .await;
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.service.shutdown().await;
        }
    }
}

/// Polls `check` until it returns true or `WAIT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Waits until `node` has nothing queued or running.
pub async fn drained(node: &TestNode) -> bool {
    eventually(move || async move { node.service.number_of_pending_tasks() == 0 }).await
}
