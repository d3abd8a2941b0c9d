//! Leader election across instances of one job

mod common;

use std::time::Duration;

use common::{assert_eventually, job, TestCluster};
use futures::future::join_all;
use jobmesh_core::ServerStatus;

#[tokio::test]
async fn test_single_leader_elected() {
    let cluster = TestCluster::start(job("orders", 6), 3).await;

    assert_eq!(cluster.count_leaders().await, 1);
    let leader_id = cluster.node(0).coordinator.leader().leader_id().await.unwrap();
    assert!(cluster.nodes.iter().any(|n| Some(n.instance_id().to_string()) == leader_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_startup_elects_one_leader() {
    let mut cluster = TestCluster::start(job("orders", 10), 0).await;
    let config = cluster.config.clone();
    let nodes: Vec<_> = (0..5).map(|_| cluster.build_node(config.clone())).collect();

    let started = join_all(nodes.iter().map(|n| n.coordinator.start())).await;
    assert!(started.iter().all(|r| r.is_ok()));
    cluster.nodes = nodes;
    cluster.settle().await;

    assert_eq!(cluster.count_leaders().await, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_crash_triggers_reelection() {
    let mut cluster = TestCluster::start(job("orders", 6), 3).await;
    let leader = cluster.leader_index().await.expect("leader elected");
    let old_leader = cluster.crash(leader);

    let new_leader = cluster.wait_for_leader(Duration::from_secs(2)).await;
    assert!(new_leader.is_some(), "a surviving instance should take over");
    assert_ne!(cluster.node(new_leader.unwrap()).instance_id(), old_leader.instance_id());
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_disabling_leader_server_moves_leadership() {
    let cluster = TestCluster::start(job("orders", 6), 3).await;
    cluster.reshard().await;
    let leader = cluster.leader_index().await.expect("leader elected");
    let leader_ip = cluster.node(leader).ip.clone();
    let operator = cluster.follower_index().await;

    cluster
        .node(operator)
        .coordinator
        .set_server_status(&leader_ip, ServerStatus::Disabled)
        .await
        .unwrap();

    assert_eventually(
        || async {
            let current = cluster.leader_index().await;
            current.is_some() && current != Some(leader)
        },
        Duration::from_secs(2),
        "leadership should move off the disabled server",
    )
    .await;
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.settle().await;
    assert!(!cluster.node(operator).coordinator.is_eligible_for_job_running().await);
    cluster.reshard().await;

    assert!(cluster.local_items(leader).await.is_empty());
    let mut covered: Vec<u32> = Vec::new();
    for idx in (0..3).filter(|i| *i != leader) {
        covered.extend(cluster.local_items(idx).await);
    }
    covered.sort();
    assert_eq!(covered, (0..6).collect::<Vec<_>>());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_hands_over_leadership() {
    let cluster = TestCluster::start(job("orders", 4), 2).await;
    let leader = cluster.leader_index().await.expect("leader elected");
    let other = 1 - leader;

    cluster.node(leader).coordinator.shutdown().await;
    assert!(!cluster.node(leader).is_leader().await);

    assert_eventually(
        || async { cluster.node(other).is_leader().await },
        Duration::from_secs(2),
        "remaining instance should become leader",
    )
    .await;

    cluster.node(other).coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_instance_does_not_reelect_itself() {
    let cluster = TestCluster::start(job("orders", 4), 1).await;
    let node = cluster.node(0);
    assert!(node.is_leader().await);

    node.coordinator.shutdown().await;
    assert!(!node.coordinator.leader().elect_leader().await);
    assert!(!cluster.exists("leader/election/instance"));
}
