//! Integration tests for membership tracking across nodes.

use std::collections::HashSet;

use tessera_cluster::{NodeStatus, ShardState};
use tokio::sync::oneshot;

use crate::helpers::{eventually, ip, TestCluster, WAIT};

#[tokio::test]
async fn members_converge_and_connect() {
    let cluster = TestCluster::start(3);
    cluster.wait_for_members(3).await;

    for node in &cluster.nodes {
        assert_eq!(node.service.local_node_id(), node.id);
        let local = node.service.local_node().unwrap();
        assert_eq!(local.addr.ip(), node.ip);
        assert_eq!(local.datacenter(), Some("DC1"));

        let others: HashSet<_> = cluster
            .nodes
            .iter()
            .filter(|n| n.id != node.id)
            .map(|n| n.id)
            .collect();
        let connector = node.connector.clone();
        assert!(
            eventually(|| {
                let connector = connector.clone();
                let others = others.clone();
                async move { connector.connected_nodes() == others }
            })
            .await,
            "{} never connected to its peers",
            node.ip
        );
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn flapping_peer_settles_alive() {
    let cluster = TestCluster::start(2);
    cluster.wait_for_members(2).await;
    let peer = cluster.node(1);

    for _ in 0..10 {
        cluster.gossip.set_alive(peer.ip, false);
        cluster.gossip.set_alive(peer.ip, true);
    }

    let observer = cluster.node(0).service.clone();
    let peer_id = peer.id;
    let settled = eventually(move || {
        let observer = observer.clone();
        async move {
            let nodes = observer.current_node_set();
            observer.number_of_pending_tasks() == 0
                && nodes.len() == 2
                && nodes.get(&peer_id).map(|n| n.status) == Some(NodeStatus::Alive)
        }
    })
    .await;
    assert!(settled, "flapping peer did not settle as alive");
    cluster.shutdown().await;
}

#[tokio::test]
async fn removed_peer_is_dropped_and_disconnected() {
    let cluster = TestCluster::start(3);
    cluster.wait_for_members(3).await;
    let gone = cluster.node(2);
    gone.service.shutdown().await;
    cluster.gossip.remove(gone.ip);

    for node in &cluster.nodes[..2] {
        let state = node
            .service
            .wait_for_state(WAIT, |s| s.nodes().len() == 2 && !s.nodes().contains(&gone.id))
            .await;
        assert!(state.is_some(), "{} kept the removed peer", node.ip);

        let connector = node.connector.clone();
        let gone_id = gone.id;
        assert!(
            eventually(move || {
                let connector = connector.clone();
                async move { !connector.connected_nodes().contains(&gone_id) }
            })
            .await
        );
    }

    for node in &cluster.nodes[..2] {
        node.service.shutdown().await;
    }
}

#[tokio::test]
async fn dead_peer_stays_a_member() {
    let cluster = TestCluster::start(2);
    cluster.wait_for_members(2).await;
    let peer = cluster.node(1);

    cluster.gossip.set_alive(peer.ip, false);
    let observer = &cluster.node(0).service;
    let state = observer
        .wait_for_state(WAIT, |s| {
            s.nodes().get(&peer.id).map(|n| n.status) == Some(NodeStatus::Dead)
        })
        .await
        .unwrap();
    assert_eq!(state.nodes().len(), 2);
    assert_eq!(state.nodes().alive_count(), 1);

    cluster.gossip.set_alive(peer.ip, true);
    cluster.wait_for_members(2).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn shard_states_are_visible_to_peers() {
    let cluster = TestCluster::start(2);
    cluster.wait_for_members(2).await;
    let writer = cluster.node(1).service.clone();
    let reader = cluster.node(0).service.clone();

    writer
        .write_index_shard_state("logs", Some(ShardState::Started))
        .unwrap();
    writer
        .write_index_shard_state("events", Some(ShardState::Initializing))
        .unwrap();
    assert_eq!(
        reader.read_index_shard_state(ip(2), "logs", ShardState::Unassigned),
        ShardState::Started
    );
    assert_eq!(
        reader.read_index_shard_state(ip(2), "events", ShardState::Unassigned),
        ShardState::Initializing
    );

    writer.write_index_shard_state("logs", None).unwrap();
    assert_eq!(
        reader.read_index_shard_state(ip(2), "logs", ShardState::Unassigned),
        ShardState::Unassigned
    );
    assert_eq!(reader.shard_states_of(ip(2)).unwrap().0.len(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn initial_state_listener_runs_after_discovery() {
    let cluster = TestCluster::start(2);
    let (tx, rx) = oneshot::channel();
    cluster.node(1).service.add_initial_state_listener(move |state| {
        let _ = tx.send(state.nodes().local_id());
    });

    let local = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(local, cluster.node(1).id);
    cluster.shutdown().await;
}
