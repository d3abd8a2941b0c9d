//! Crash failover
//!
//! A crashed instance's items are flagged under `failover/{item}`. Live
//! instances claim one flagged item at a time by atomically creating the
//! ephemeral `failover/{item}/instance`; the claimant's id is also written
//! into `failover/{item}` so that work in flight on a claimant that itself
//! crashes can be told apart from an ordinary assignment.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::context::JobContext;
use super::execution::ExecutionService;
use super::instance::load_live_instances;
use super::server::ServerService;
use super::sharding::ShardingService;
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::{node_path, parse_item, JobNodePath};

/// Items claimed by the local instance, published to the execution engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverTrigger {
    pub job_name: String,
    pub items: Vec<u32>,
}

pub struct FailoverService {
    ctx: Arc<JobContext>,
    servers: Arc<ServerService>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
    triggers: broadcast::Sender<FailoverTrigger>,
}

impl FailoverService {
    pub fn new(
        ctx: Arc<JobContext>,
        servers: Arc<ServerService>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
    ) -> Self {
        let (triggers, _) = broadcast::channel(64);
        Self {
            ctx,
            servers,
            sharding,
            execution,
            triggers,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverTrigger> {
        self.triggers.subscribe()
    }

    /// Queue an item unless it is already queued; returns whether it was new
    pub async fn set_crashed_failover_flag(&self, item: u32) -> Result<bool> {
        let node = JobNodePath::failover_item_node(item);
        if self.ctx.storage().is_node_existed(&node).await? {
            return Ok(false);
        }
        self.ctx.storage().fill(&node, "").await?;
        standard::FAILOVER_ITEMS_FLAGGED.inc();
        Ok(true)
    }

    /// Re-queue an item whose claimant is gone
    async fn requeue(&self, item: u32) -> Result<()> {
        let storage = self.ctx.storage();
        storage.remove_if_exists(&JobNodePath::failover_instance_node(item)).await?;
        storage.fill(&JobNodePath::failover_item_node(item), "").await?;
        standard::FAILOVER_ITEMS_FLAGGED.inc();
        Ok(())
    }

    /// Every item with a failover record
    pub async fn failover_records(&self) -> Result<Vec<u32>> {
        Ok(self
            .ctx
            .storage()
            .children(node_path::FAILOVER)
            .await?
            .iter()
            .filter_map(|n| parse_item(n))
            .collect())
    }

    /// Items flagged and not claimed by anyone
    pub async fn pending_items(&self) -> Result<Vec<u32>> {
        let mut pending = Vec::new();
        for item in self.failover_records().await? {
            let claimed = self
                .ctx
                .storage()
                .is_node_existed(&JobNodePath::failover_instance_node(item))
                .await?;
            if !claimed {
                pending.push(item);
            }
        }
        Ok(pending)
    }

    /// Claim the next pending item for the local instance
    ///
    /// At most one item is claimed per call, and none while the local
    /// instance still has a failover item in flight, so repeated calls
    /// without new crashes change nothing.
    pub async fn failover_if_necessary(&self) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() || !self.ctx.config().failover {
            return Ok(Vec::new());
        }
        if !self.servers.is_local_server_available().await? {
            return Ok(Vec::new());
        }
        if !self.get_local_failover_items().await?.is_empty() {
            debug!("Instance {} already runs failover work", self.ctx.instance());
            return Ok(Vec::new());
        }

        let storage = self.ctx.storage();
        let local = self.ctx.instance().instance_id();
        for item in self.pending_items().await? {
            if self.execution.has_running_items(&[item]).await? {
                continue;
            }
            if !storage
                .try_create_ephemeral(&JobNodePath::failover_instance_node(item), local)
                .await?
            {
                continue;
            }
            storage.fill(&JobNodePath::failover_item_node(item), local).await?;
            standard::FAILOVER_ITEMS_CLAIMED.inc();
            info!("Instance {} took over item {} of job {}", self.ctx.instance(), item, self.ctx.job_name());

            let trigger = FailoverTrigger {
                job_name: self.ctx.job_name().to_string(),
                items: vec![item],
            };
            // no subscriber just means the engine polls instead
            let _ = self.triggers.send(trigger);
            return Ok(vec![item]);
        }
        Ok(Vec::new())
    }

    /// Items whose failover record names `instance_id` as claimant
    pub async fn get_failover_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let storage = self.ctx.storage();
        let mut items = Vec::new();
        for item in self.failover_records().await? {
            if storage.get_data(&JobNodePath::failover_item_node(item)).await?.as_deref() == Some(instance_id) {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub async fn get_local_failover_items(&self) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() {
            return Ok(Vec::new());
        }
        self.get_failover_items(self.ctx.instance().instance_id()).await
    }

    /// Local items currently being run elsewhere through failover
    pub async fn get_local_takeoff_items(&self) -> Result<Vec<u32>> {
        let storage = self.ctx.storage();
        let local = self.ctx.instance().instance_id();
        let mut takeoff = Vec::new();
        for item in self.sharding.get_local_sharding_items().await? {
            let claimant = storage.get_data(&JobNodePath::failover_item_node(item)).await?;
            if matches!(claimant.as_deref(), Some(id) if !id.is_empty() && id != local) {
                takeoff.push(item);
            }
        }
        Ok(takeoff)
    }

    /// Drop the records of finished failover items, then offer the next one
    pub async fn update_failover_complete(&self, items: &[u32]) -> Result<Vec<u32>> {
        for &item in items {
            self.ctx.storage().remove_if_exists(&JobNodePath::failover_item_node(item)).await?;
        }
        if !items.is_empty() {
            info!("Job {} failover items {:?} completed", self.ctx.job_name(), items);
        }
        self.failover_if_necessary().await
    }

    /// Clear every failover record of the job
    pub async fn remove_failover_info(&self) -> Result<()> {
        if self.ctx.storage().remove_if_exists(node_path::FAILOVER).await? {
            info!("Cleared failover records of job {}", self.ctx.job_name());
        }
        Ok(())
    }

    /// React to the loss of another instance
    ///
    /// If the crashed instance was itself running failover work, only that
    /// work is re-queued; its ordinary assignment is left for resharding.
    /// Otherwise its assigned items are queued.
    pub async fn handle_instance_crashed(&self, crashed_id: &str) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() || !self.ctx.config().failover || crashed_id == self.ctx.instance().instance_id() {
            return Ok(Vec::new());
        }

        let in_flight = self.get_failover_items(crashed_id).await?;
        if !in_flight.is_empty() {
            for &item in &in_flight {
                self.requeue(item).await?;
            }
            info!("Re-queued failover items {:?} of crashed instance {}", in_flight, crashed_id);
        } else {
            let items = self.sharding.get_crashed_sharding_items(crashed_id).await?;
            let mut flagged = Vec::new();
            for item in items {
                if self.set_crashed_failover_flag(item).await? {
                    flagged.push(item);
                }
            }
            if !flagged.is_empty() {
                info!("Queued items {:?} of crashed instance {} for failover", flagged, crashed_id);
            }
        }

        self.failover_if_necessary().await
    }

    /// Repair leftovers from a cluster that went down entirely
    ///
    /// Only meaningful when the local instance is the sole available one:
    /// running markers and failover claims of instances that are gone are
    /// turned back into pending failover work, or dropped when failover is
    /// off.
    pub async fn recover_legacy(&self) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() {
            return Ok(Vec::new());
        }
        let live: HashSet<String> = load_live_instances(self.ctx.storage())
            .await?
            .into_iter()
            .map(|i| i.instance_id().to_string())
            .collect();
        let failover = self.ctx.config().failover;

        let mut recovered = Vec::new();
        for (item, owner) in self.execution.running_items().await? {
            if live.contains(&owner) {
                continue;
            }
            self.execution.clear_running_info(&[item]).await?;
            if failover && self.set_crashed_failover_flag(item).await? {
                recovered.push(item);
            }
        }
        for item in self.failover_records().await? {
            let claimant = self.ctx.storage().get_data(&JobNodePath::failover_item_node(item)).await?;
            if !matches!(claimant.as_deref(), Some(id) if !id.is_empty() && !live.contains(id)) {
                continue;
            }
            if failover {
                self.requeue(item).await?;
                recovered.push(item);
            } else {
                self.ctx.storage().remove_if_exists(&JobNodePath::failover_item_node(item)).await?;
            }
        }
        if !recovered.is_empty() {
            info!("Recovered stale items {:?} of job {}", recovered, self.ctx.job_name());
        }

        self.failover_if_necessary().await
    }
}
