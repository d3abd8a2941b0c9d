//! Failover of a crashed instance's items

mod common;

use common::{job, TestCluster};
use jobmesh_core::store::{CoordinatorStore, NodeMode};
use jobmesh_core::JobConfig;

fn failover_job(name: &str, total: u32) -> JobConfig {
    job(name, total).with_failover(true)
}

async fn sorted_records(cluster: &TestCluster) -> Vec<u32> {
    let mut records = cluster.node(0).coordinator.failover().failover_records().await.unwrap();
    records.sort();
    records
}

#[tokio::test]
async fn test_survivors_take_over_crashed_items() {
    let mut cluster = TestCluster::start(failover_job("orders", 9), 3).await;
    cluster.reshard().await;

    let victim = cluster.follower_index().await;
    let mut crashed_items = cluster.local_items(victim).await;
    crashed_items.sort();
    assert_eq!(crashed_items.len(), 3);
    let before = cluster.assignment();

    cluster.crash(victim);
    cluster.settle().await;

    assert_eq!(sorted_records(&cluster).await, crashed_items);
    let mut claimed = Vec::new();
    for node in &cluster.nodes {
        let items = node.coordinator.get_local_failover_items().await.unwrap();
        assert_eq!(items.len(), 1, "each survivor claims one item at a time");
        claimed.extend(items);
    }
    assert!(claimed.iter().all(|item| crashed_items.contains(item)));
    assert_eq!(cluster.node(0).coordinator.failover().pending_items().await.unwrap().len(), 1);

    // the assignment itself waits for the next resharding
    assert_eq!(cluster.assignment(), before);

    let mut covered = Vec::new();
    for node in &cluster.nodes {
        let mut items = node.coordinator.get_local_failover_items().await.unwrap();
        while !items.is_empty() {
            covered.extend(items.iter().copied());
            items = node.coordinator.update_failover_complete(&items).await.unwrap();
        }
    }
    covered.sort();
    assert_eq!(covered, crashed_items);
    assert!(sorted_records(&cluster).await.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failover_context_takes_precedence() {
    let mut cluster = TestCluster::start(failover_job("orders", 4), 2).await;
    cluster.reshard().await;
    let victim = cluster.follower_index().await;
    cluster.crash(victim);
    cluster.settle().await;

    let survivor = &cluster.node(0).coordinator;
    let claimed = survivor.get_local_failover_items().await.unwrap();
    assert_eq!(claimed.len(), 1);

    let context = survivor.sharding_context().await.unwrap();
    assert!(context.failover);
    assert_eq!(context.items.keys().copied().collect::<Vec<_>>(), claimed);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_repeated_claims_change_nothing() {
    let mut cluster = TestCluster::start(failover_job("orders", 9), 3).await;
    cluster.reshard().await;
    let victim = cluster.follower_index().await;
    cluster.crash(victim);
    cluster.settle().await;

    let before = cluster.snapshot("failover");
    for _ in 0..3 {
        for node in &cluster.nodes {
            assert!(node.coordinator.failover_if_necessary().await.unwrap().is_empty());
        }
    }
    assert_eq!(cluster.snapshot("failover"), before);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_disabled_failover_records_nothing() {
    let mut cluster = TestCluster::start(job("orders", 6), 3).await;
    cluster.reshard().await;
    let victim = cluster.follower_index().await;
    cluster.crash(victim);
    cluster.settle().await;

    assert!(!cluster.exists("failover"));
    for node in &cluster.nodes {
        assert!(node.coordinator.get_local_failover_items().await.unwrap().is_empty());
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_turning_failover_off_clears_records() {
    let mut cluster = TestCluster::start(failover_job("orders", 6), 3).await;
    cluster.reshard().await;
    let victim = cluster.follower_index().await;
    cluster.crash(victim);
    cluster.settle().await;
    assert!(cluster.exists("failover"));

    let updated = cluster.config.clone().with_failover(false);
    cluster.node(0).coordinator.update_config(&updated).await.unwrap();
    cluster.settle().await;

    assert!(!cluster.exists("failover"));
    let context = cluster.node(1).coordinator.sharding_context().await.unwrap();
    assert!(!context.failover);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_crashed_claimant_requeues_only_claimed_work() {
    let mut cluster = TestCluster::start(failover_job("orders", 6), 3).await;
    cluster.reshard().await;

    let first = cluster.follower_index().await;
    let mut first_items = cluster.local_items(first).await;
    first_items.sort();
    cluster.crash(first);
    cluster.settle().await;
    assert!(cluster.node(0).coordinator.failover().pending_items().await.unwrap().is_empty());

    // node 0 now runs one of the first victim's items and crashes too
    let in_flight = cluster.node(0).coordinator.get_local_failover_items().await.unwrap();
    assert_eq!(in_flight.len(), 1);
    let second_items = cluster.local_items(0).await;
    cluster.crash(0);
    cluster.settle().await;

    // its own assignment is left for resharding
    assert_eq!(sorted_records(&cluster).await, first_items);
    assert!(second_items.iter().all(|item| !first_items.contains(item)));
    let survivor = &cluster.node(0).coordinator;
    assert_eq!(survivor.failover().pending_items().await.unwrap(), in_flight);

    let own = survivor.get_local_failover_items().await.unwrap();
    let next = survivor.update_failover_complete(&own).await.unwrap();
    assert_eq!(next, in_flight);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lone_instance_recovers_leftovers() {
    let mut cluster = TestCluster::start(failover_job("orders", 4), 0).await;

    // leftovers of an instance that went down with the whole cluster
    let ghost = cluster.store.connect();
    let ghost_id = "10.9.9.9@-@ghost";
    ghost
        .create("/orders/execution/1/running", ghost_id, NodeMode::Persistent)
        .await
        .unwrap();
    ghost.create("/orders/failover/2", ghost_id, NodeMode::Persistent).await.unwrap();

    cluster.add_node().await;
    cluster.settle().await;

    assert!(!cluster.exists("execution/1/running"));
    assert_eq!(sorted_records(&cluster).await, vec![1, 2]);

    let node = &cluster.node(0).coordinator;
    let mut covered = Vec::new();
    let mut items = node.get_local_failover_items().await.unwrap();
    assert_eq!(items.len(), 1);
    while !items.is_empty() {
        covered.extend(items.iter().copied());
        items = node.update_failover_complete(&items).await.unwrap();
    }
    covered.sort();
    assert_eq!(covered, vec![1, 2]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lone_instance_drops_leftovers_without_failover() {
    let mut cluster = TestCluster::start(job("orders", 4), 0).await;

    let ghost = cluster.store.connect();
    let ghost_id = "10.9.9.9@-@ghost";
    ghost
        .create("/orders/execution/1/running", ghost_id, NodeMode::Persistent)
        .await
        .unwrap();
    ghost.create("/orders/failover/2", ghost_id, NodeMode::Persistent).await.unwrap();

    cluster.add_node().await;
    cluster.settle().await;

    assert!(!cluster.exists("execution/1/running"));
    assert!(!cluster.exists("failover/2"));
    assert!(sorted_records(&cluster).await.is_empty());
    assert!(cluster.node(0).coordinator.get_local_failover_items().await.unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_claims_are_announced() {
    let mut cluster = TestCluster::start(failover_job("orders", 4), 2).await;
    cluster.reshard().await;
    let victim = cluster.follower_index().await;
    let mut triggers = cluster.node(1 - victim).coordinator.subscribe_failover();
    cluster.crash(victim);
    cluster.settle().await;

    let trigger = triggers.try_recv().expect("claim should be announced");
    assert_eq!(trigger.job_name, "orders");
    assert_eq!(trigger.items.len(), 1);

    cluster.shutdown().await;
}
