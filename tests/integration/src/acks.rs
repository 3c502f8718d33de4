//! Integration tests for acknowledged metadata changes and version waits.

use std::time::{Duration, Instant};

use tessera_cluster::{CreateIndexRequest, DeleteIndexRequest, NodeId};

use crate::helpers::{ip, TestCluster, DATACENTER, WAIT};

#[tokio::test]
async fn index_changes_are_acknowledged_by_every_node() {
    let cluster = TestCluster::start(3);
    cluster.wait_for_members(3).await;
    let service = &cluster.node(0).service;

    let created = service
        .create_index(CreateIndexRequest::new("logs", service.config()).shards(2, 1))
        .await
        .unwrap();
    assert!(created.acknowledged);
    // an ack means the peer already applied the change
    for node in &cluster.nodes {
        assert!(
            node.service.current_cluster_state().metadata().has_index("logs"),
            "{} acked without the index",
            node.ip
        );
    }

    let deleted = service
        .delete_index(DeleteIndexRequest::new("logs", service.config()))
        .await
        .unwrap();
    assert!(deleted.acknowledged);
    for node in &cluster.nodes {
        assert!(!node.service.current_cluster_state().metadata().has_index("logs"));
    }
    assert!(service.await_version(2, WAIT).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn silent_peer_times_out_the_ack() {
    let cluster = TestCluster::start(1);
    // a live member that never applies anything
    cluster.gossip.join(ip(9), NodeId::new(), DATACENTER, "RAC1");
    cluster.wait_all(|s| s.nodes().len() == 2).await;
    let service = &cluster.node(0).service;

    let request = CreateIndexRequest::new("logs", service.config())
        .ack_timeout(Duration::from_millis(200));
    let response = service.create_index(request).await.unwrap();
    assert!(!response.acknowledged);
    // the change itself still committed
    assert!(service.current_cluster_state().metadata().has_index("logs"));

    let started = Instant::now();
    assert!(!service.await_version(1, Duration::from_millis(200)).await);
    assert!(started.elapsed() >= Duration::from_millis(150));
    cluster.shutdown().await;
}

#[tokio::test]
async fn dead_peer_does_not_hold_the_ack() {
    let cluster = TestCluster::start(1);
    cluster.gossip.join(ip(9), NodeId::new(), DATACENTER, "RAC1");
    cluster.wait_all(|s| s.nodes().len() == 2).await;
    let service = cluster.node(0).service.clone();

    let started = Instant::now();
    let pending = tokio::spawn(async move {
        let request = CreateIndexRequest::new("logs", service.config()).ack_timeout(WAIT);
        service.create_index(request).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.gossip.set_alive(ip(9), false);

    let response = pending.await.unwrap().unwrap();
    assert!(response.acknowledged);
    assert!(started.elapsed() < WAIT);
    cluster.shutdown().await;
}

#[tokio::test]
async fn version_wait_ignores_other_datacenters() {
    let cluster = TestCluster::start(2);
    cluster.wait_for_members(2).await;
    // silent member elsewhere; it never becomes part of this node set
    cluster.gossip.join(ip(50), NodeId::new(), "DC2", "RAC1");

    let service = &cluster.node(0).service;
    let response = service
        .create_index(CreateIndexRequest::new("logs", service.config()))
        .await
        .unwrap();
    assert!(response.acknowledged);
    assert!(service.await_version(1, WAIT).await);
    assert_eq!(service.current_node_set().len(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn version_wait_returns_once_peers_catch_up() {
    let cluster = TestCluster::start(2);
    cluster.wait_for_members(2).await;
    let service = cluster.node(0).service.clone();

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.await_version(1, WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    service
        .create_index(CreateIndexRequest::new("logs", service.config()))
        .await
        .unwrap();
    assert!(waiter.await.unwrap());
    cluster.shutdown().await;
}
