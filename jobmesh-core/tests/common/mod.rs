//! Cluster harness for integration tests
//!
//! Runs several job instances over one in-process store. Each instance gets
//! its own session and a distinct IP so server status applies per instance.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use jobmesh_core::store::{CoordinatorStore, MemorySession, MemoryStore};
use jobmesh_core::{CoordinatorSettings, JobConfig, JobCoordinator, JobInstance};

pub const CRON: &str = "0/5 * * * * ?";

/// Settings with short poll budgets and no reconcile loop
pub fn test_settings(ip: &str) -> CoordinatorSettings {
    CoordinatorSettings {
        leader_poll_interval: Duration::from_millis(10),
        leader_poll_max_attempts: 200,
        lock_retry_interval: Duration::from_millis(5),
        lock_max_attempts: 100,
        sharding_wait_interval: Duration::from_millis(10),
        sharding_wait_max_attempts: 300,
        reconcile_interval: None,
        instance_ip: Some(ip.to_string()),
        ..Default::default()
    }
}

pub fn job(name: &str, total: u32) -> JobConfig {
    JobConfig::new(name, CRON, total)
}

/// One instance of the job
pub struct TestNode {
    pub ip: String,
    pub session: Arc<MemorySession>,
    pub coordinator: Arc<JobCoordinator>,
}

impl TestNode {
    pub fn instance(&self) -> &JobInstance {
        self.coordinator.instance()
    }

    pub fn instance_id(&self) -> &str {
        self.coordinator.instance().instance_id()
    }

    pub async fn is_leader(&self) -> bool {
        self.coordinator.is_leader().await
    }

    /// Simulate a process crash: the session dies with its ephemeral nodes
    pub fn crash(&self) {
        self.session.expire();
        self.coordinator.halt();
    }
}

pub struct TestCluster {
    pub store: MemoryStore,
    pub config: JobConfig,
    pub nodes: Vec<TestNode>,
    next_ip: usize,
}

impl TestCluster {
    /// Start `num_nodes` instances one after another
    pub async fn start(config: JobConfig, num_nodes: usize) -> Self {
        let mut cluster = Self {
            store: MemoryStore::new(),
            config,
            nodes: Vec::new(),
            next_ip: 1,
        };
        for _ in 0..num_nodes {
            cluster.add_node().await;
        }
        cluster.settle().await;
        cluster
    }

    /// Start one more instance; returns its index
    pub async fn add_node(&mut self) -> usize {
        let node = self.build_node(self.config.clone());
        node.coordinator.start().await.expect("node should start");
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Build an instance without starting it
    pub fn build_node(&mut self, config: JobConfig) -> TestNode {
        let ip = format!("10.0.0.{}", self.next_ip);
        self.next_ip += 1;
        let session = Arc::new(self.store.connect());
        let client: Arc<dyn CoordinatorStore> = session.clone();
        let coordinator = JobCoordinator::new(client, config, test_settings(&ip)).expect("valid config");
        TestNode {
            ip,
            session,
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn node(&self, idx: usize) -> &TestNode {
        &self.nodes[idx]
    }

    /// Drain every dispatcher, repeatedly, since handlers cause new events
    pub async fn settle(&self) {
        for _ in 0..3 {
            for node in &self.nodes {
                node.coordinator.listeners().barrier().await;
            }
        }
    }

    /// Run `sharding_if_necessary` on every instance concurrently
    pub async fn reshard(&self) {
        self.settle().await;
        let results = join_all(self.nodes.iter().map(|n| n.coordinator.sharding_if_necessary())).await;
        for result in results {
            result.expect("resharding should succeed");
        }
        self.settle().await;
    }

    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in &self.nodes {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    pub async fn leader_index(&self) -> Option<usize> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.is_leader().await {
                return Some(idx);
            }
        }
        None
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let found = wait_for(|| async { self.count_leaders().await == 1 }, timeout, Duration::from_millis(10)).await;
        if found {
            self.leader_index().await
        } else {
            None
        }
    }

    /// Index of some instance that is not the leader
    pub async fn follower_index(&self) -> usize {
        let leader = self.leader_index().await;
        (0..self.nodes.len()).find(|i| Some(*i) != leader).expect("cluster has a follower")
    }

    /// Crash an instance and remove it from the cluster
    pub fn crash(&mut self, idx: usize) -> TestNode {
        let node = self.nodes.remove(idx);
        node.crash();
        node
    }

    /// Item -> owner, read through the raw store
    pub fn assignment(&self) -> BTreeMap<u32, String> {
        let prefix = format!("/{}/sharding", self.config.job_name);
        self.store
            .snapshot(&prefix)
            .into_iter()
            .filter_map(|(path, owner)| {
                let item = path.strip_prefix(&format!("{}/", prefix))?.parse().ok()?;
                Some((item, owner))
            })
            .collect()
    }

    /// Every node value under the job's `relative` node
    pub fn snapshot(&self, relative: &str) -> BTreeMap<String, String> {
        self.store.snapshot(&format!("/{}/{}", self.config.job_name, relative))
    }

    pub fn exists(&self, relative: &str) -> bool {
        !self.snapshot(relative).is_empty()
    }

    pub async fn local_items(&self, idx: usize) -> Vec<u32> {
        self.nodes[idx]
            .coordinator
            .get_local_sharding_items()
            .await
            .expect("local items")
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.coordinator.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds or `timeout_duration` passes
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    condition().await
}

pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(
        wait_for(condition, timeout_duration, Duration::from_millis(10)).await,
        "Condition not met within {:?}: {}",
        timeout_duration,
        message
    );
}
