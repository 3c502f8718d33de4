//! Integration tests for versioning and serialization of state updates.

use std::sync::Arc;

use tessera_cluster::{
    ClusterError, ClusterState, FnTask, IndexMetaData, NodeRecord, NodeStatus, Priority, TaskEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::helpers::{drained, ip, TestCluster, DATACENTER, WAIT};

fn add_index(name: String) -> FnTask {
    FnTask::new(move |state: &Arc<ClusterState>| {
        let metadata = state
            .metadata()
            .as_ref()
            .clone()
            .with_index(IndexMetaData::new(name.clone(), 1, 0))
            .next_revision(state.nodes().local_id());
        Ok(state.to_builder().metadata(metadata).build())
    })
}

fn add_node(record: NodeRecord) -> FnTask {
    FnTask::new(move |state: &Arc<ClusterState>| {
        let nodes = state.nodes().to_builder().put(record.clone()).build();
        Ok(state.to_builder().nodes(nodes).build())
    })
    .without_persistence()
}

async fn next_event(events: &mut UnboundedReceiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("task event should arrive")
        .expect("task event channel should stay open")
}

#[tokio::test]
async fn version_increments_once_per_effective_task() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);
    assert!(drained(node).await);
    let start = node.service.current_cluster_state().version();

    let mut receivers = Vec::new();
    for i in 0..6 {
        let task = if i % 2 == 0 {
            add_index(format!("idx-{i}"))
        } else {
            FnTask::new(|s| Ok(s.clone()))
        };
        let (task, events) = task.with_events();
        node.service.submit(format!("task-{i}"), Priority::Normal, task);
        receivers.push((i, events));
    }

    for (i, events) in receivers.iter_mut() {
        match next_event(events).await {
            TaskEvent::Processed { previous, current } if *i % 2 == 0 => {
                assert_eq!(current.version(), previous.version() + 1);
            }
            TaskEvent::Processed { previous, current } => {
                assert!(Arc::ptr_eq(&previous, &current), "no-op must keep the state");
            }
            other => panic!("task {i}: unexpected event {other:?}"),
        }
    }

    let state = node.service.current_cluster_state();
    assert_eq!(state.version(), start + 3);
    assert_eq!(state.metadata().indices.len(), 3);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_lose_no_updates() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);
    assert!(drained(node).await);

    let mut handles = Vec::new();
    for i in 0..20 {
        let service = node.service.clone();
        handles.push(tokio::spawn(async move {
            let (task, mut events) = add_index(format!("idx-{i}")).with_events();
            service.submit(format!("add idx-{i}"), Priority::Normal, task);
            next_event(&mut events).await
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), TaskEvent::Processed { .. }));
    }

    let state = node.service.current_cluster_state();
    assert_eq!(state.metadata().indices.len(), 20);
    assert_eq!(state.metadata().version, 20);
    assert_eq!(cluster.store.load().unwrap().unwrap().version, 20);
    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_node_additions_build_on_each_other() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);
    assert!(drained(node).await);

    // bring the state to version 1 first
    let (first, mut first_events) = add_index("base".into()).with_events();
    node.service.submit("base", Priority::Normal, first);
    next_event(&mut first_events).await;
    let base = node.service.current_cluster_state().version();

    let a = NodeRecord::new(
        tessera_cluster::NodeId::new(),
        std::net::SocketAddr::new(ip(20), 9300),
        DATACENTER,
        "RAC1",
        NodeStatus::Alive,
    );
    let b = NodeRecord::new(
        tessera_cluster::NodeId::new(),
        std::net::SocketAddr::new(ip(21), 9300),
        DATACENTER,
        "RAC1",
        NodeStatus::Alive,
    );
    let (t1, mut t1_events) = add_node(a.clone()).with_events();
    let (t2, mut t2_events) = add_node(b.clone()).with_events();
    let (svc1, svc2) = (node.service.clone(), node.service.clone());
    tokio::join!(
        async move { svc1.submit("add A", Priority::Normal, t1) },
        async move { svc2.submit("add B", Priority::Normal, t2) },
    );
    next_event(&mut t1_events).await;
    next_event(&mut t2_events).await;

    let state = node.service.current_cluster_state();
    assert!(state.nodes().contains(&a.id));
    assert!(state.nodes().contains(&b.id));
    assert_eq!(state.version(), base + 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn task_defects_do_not_stop_the_queue() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);

    let (failing, mut failing_events) =
        FnTask::new(|_| Err(ClusterError::task("bad input"))).with_events();
    let (panicking, mut panicking_events) =
        FnTask::new(|_| -> Result<Arc<ClusterState>, ClusterError> { panic!("task bug") })
            .with_events();
    let (good, mut good_events) = add_index("after".into()).with_events();

    node.service.submit("failing", Priority::High, failing);
    node.service.submit("panicking", Priority::High, panicking);
    node.service.submit("good", Priority::Normal, good);

    assert!(matches!(
        next_event(&mut failing_events).await,
        TaskEvent::Failed(ClusterError::Task(_))
    ));
    assert!(matches!(
        next_event(&mut panicking_events).await,
        TaskEvent::Failed(ClusterError::Task(msg)) if msg.contains("task bug")
    ));
    assert!(matches!(next_event(&mut good_events).await, TaskEvent::Processed { .. }));
    assert!(node.service.current_cluster_state().metadata().has_index("after"));
    cluster.shutdown().await;
}

#[tokio::test]
async fn listeners_see_every_commit_in_order() {
    let cluster = TestCluster::start(1);
    let node = cluster.node(0);
    assert!(drained(node).await);
    let v = node.service.current_cluster_state().version();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = seen.clone();
    node.service.add_listener(tessera_cluster::ListenerTier::Normal, move |event| {
        recorded
            .lock()
            .unwrap()
            .push((event.previous().version(), event.state().version(), event.metadata_changed()));
        tessera_cluster::ListenerControl::Keep
    });

    let mut last = None;
    for i in 0..3 {
        let (task, events) = add_index(format!("idx-{i}")).with_events();
        node.service.submit(format!("idx-{i}"), Priority::Normal, task);
        last = Some(events);
    }
    next_event(last.as_mut().unwrap()).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(v, v + 1, true), (v + 1, v + 2, true), (v + 2, v + 3, true)]
    );
    cluster.shutdown().await;
}
