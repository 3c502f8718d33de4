//! Integration tests for metadata persistence and convergence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tessera_cluster::{
    ClusterError, ClusterService, CreateIndexRequest, FactSlot, FileMetadataStore, FnTask,
    IndexMetaData, MemoryConnector, MemoryGossip, MemoryMetadataStore, MetaData, MetadataStore,
    MetadataVersionFact, NodeId, PeerStateStore, Priority, Revision, TaskEvent,
};

use crate::helpers::{drained, ip, test_config, TestCluster, DATACENTER, WAIT};

type Hook = Box<dyn FnOnce(&MemoryMetadataStore) + Send>;

/// Store that lets a rival writer sneak in right before the first
/// compare-and-swap.
struct RacingStore {
    inner: MemoryMetadataStore,
    hook: Mutex<Option<Hook>>,
    attempts: AtomicU64,
}

impl RacingStore {
    fn new(hook: Hook) -> Self {
        Self {
            inner: MemoryMetadataStore::new(),
            hook: Mutex::new(Some(hook)),
            attempts: AtomicU64::new(0),
        }
    }
}

impl MetadataStore for RacingStore {
    fn load(&self) -> Result<Option<MetaData>, ClusterError> {
        self.inner.load()
    }

    fn compare_and_swap(&self, expected: Revision, new: &MetaData) -> Result<(), ClusterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().unwrap().take() {
            hook(&self.inner);
        }
        self.inner.compare_and_swap(expected, new)
    }
}

fn add_index(name: &'static str) -> FnTask {
    FnTask::new(move |state| {
        let metadata = state
            .metadata()
            .as_ref()
            .clone()
            .with_index(IndexMetaData::new(name, 1, 0))
            .next_revision(state.nodes().local_id());
        Ok(state.to_builder().metadata(metadata).build())
    })
}

#[tokio::test]
async fn conflicting_write_is_retried_once_after_convergence() {
    let gossip = MemoryGossip::new();
    // a writer with no cluster service; it only persists and announces
    let rival_ip = ip(9);
    gossip.join(rival_ip, NodeId::new(), DATACENTER, "RAC1");

    let rival_gossip = gossip.clone();
    let store = Arc::new(RacingStore::new(Box::new(move |inner: &MemoryMetadataStore| {
        let rival = MetaData::default()
            .with_index(IndexMetaData::new("rival", 1, 0))
            .next_revision(NodeId::new());
        inner
            .compare_and_swap(Revision::of(&MetaData::default()), &rival)
            .unwrap();
        rival_gossip.publish(rival_ip, FactSlot::Schema, rival.revision());
    })));

    let handle = gossip.join(ip(1), NodeId::new(), DATACENTER, "RAC1");
    let service = ClusterService::start(
        test_config(),
        Arc::new(handle),
        store.clone(),
        Arc::new(MemoryConnector::new()),
    )
    .unwrap();
    assert!(
        service
            .wait_for_state(WAIT, |s| s.nodes().len() == 2)
            .await
            .is_some()
    );

    let (task, mut events) = add_index("mine").with_events();
    service.submit("add mine", Priority::Normal, task);

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    let TaskEvent::Processed { current, .. } = event else {
        panic!("expected the task to commit, got {event:?}");
    };
    assert!(current.metadata().has_index("rival"));
    assert!(current.metadata().has_index("mine"));
    assert_eq!(current.metadata().version, 2);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.load().unwrap().unwrap().version, 2);

    // exactly one outcome
    tokio::task::yield_now().await;
    assert!(events.try_recv().is_err());
    service.shutdown().await;
}

#[tokio::test]
async fn stale_writer_never_overwrites_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn MetadataStore> = Arc::new(FileMetadataStore::new(dir.path()));
    let cluster = TestCluster::start_with_store(1, store.clone());
    let node = cluster.node(0);
    assert!(drained(node).await);

    // another process writes behind this node's back and tells nobody
    let outsider = FileMetadataStore::new(dir.path());
    let rival = MetaData::default()
        .with_index(IndexMetaData::new("outsider", 1, 0))
        .next_revision(NodeId::new());
    outsider
        .compare_and_swap(Revision::of(&MetaData::default()), &rival)
        .unwrap();

    let request = CreateIndexRequest::new("logs", node.service.config())
        .master_timeout(std::time::Duration::from_millis(300));
    let err = node.service.create_index(request).await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");

    assert_eq!(store.load().unwrap(), Some(rival));
    assert!(!node.service.current_cluster_state().metadata().has_index("logs"));
    cluster.shutdown().await;
}

#[tokio::test]
async fn metadata_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = TestCluster::start_with_store(1, Arc::new(FileMetadataStore::new(dir.path())));
    let service = &first.node(0).service;
    let response = service
        .create_index(CreateIndexRequest::new("logs", service.config()).shards(3, 1))
        .await
        .unwrap();
    assert!(response.acknowledged);
    let written = service.current_cluster_state().metadata().clone();
    first.shutdown().await;

    let second = TestCluster::start_with_store(1, Arc::new(FileMetadataStore::new(dir.path())));
    let state = second.node(0).service.current_cluster_state();
    assert_eq!(state.metadata().as_ref(), written.as_ref());
    let index = state.metadata().index("logs").unwrap();
    assert_eq!(index.number_of_shards, 3);
    assert_eq!(index.number_of_replicas, 1);
    second.shutdown().await;
}

#[tokio::test]
async fn peers_install_metadata_written_elsewhere() {
    let cluster = TestCluster::start(3);
    cluster.wait_for_members(3).await;

    let writer = &cluster.node(0).service;
    writer
        .create_index(CreateIndexRequest::new("events", writer.config()))
        .await
        .unwrap();
    let revision = writer.current_cluster_state().metadata().revision();

    cluster
        .wait_all(move |s| s.metadata().revision() == revision && s.metadata().has_index("events"))
        .await;
    // installing remote metadata does not write it again
    assert_eq!(cluster.store.load().unwrap().unwrap().version, 1);

    // every node announces the revision it applied
    let committed = writer.current_cluster_state();
    let expected = MetadataVersionFact::of(committed.metadata());
    for node in &cluster.nodes {
        let gossip = cluster.gossip.handle(node.ip);
        let value = gossip.fact_of(node.ip, FactSlot::MetadataVersion);
        assert_eq!(value, Some(expected.to_string()));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn new_node_starts_from_persisted_metadata() {
    let store = Arc::new(MemoryMetadataStore::new());
    let mut cluster = TestCluster::start_with_store(1, store);
    let service = cluster.node(0).service.clone();
    service
        .create_index(CreateIndexRequest::new("logs", service.config()))
        .await
        .unwrap();

    let late = cluster.add_node(2);
    let state = late.service.current_cluster_state();
    assert!(state.metadata().has_index("logs"));
    assert_eq!(state.metadata().version, 1);

    cluster.wait_for_members(2).await;
    assert!(service.await_version(1, WAIT).await);
    cluster.shutdown().await;
}
