//! Shard assignment
//!
//! The leader recomputes the whole assignment whenever
//! `sharding/necessary` is present and writes it in one transaction
//! together with the removal of that flag, so readers see either the old
//! or the new assignment, never a mix.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::config_service::ConfigService;
use super::context::JobContext;
use super::execution::ExecutionService;
use super::instance::{InstanceService, JobInstance};
use super::leader::LeaderService;
use super::server::ServerService;
use super::shard_assigner::StrategyRegistry;
use crate::error::Result;
use crate::metrics::standard;
use crate::runtime::{poll_until, PollOutcome};
use crate::storage::{node_path, parse_item, JobNodePath};

pub struct ShardingService {
    ctx: Arc<JobContext>,
    config: Arc<ConfigService>,
    leader: Arc<LeaderService>,
    servers: Arc<ServerService>,
    instances: Arc<InstanceService>,
    execution: Arc<ExecutionService>,
}

impl ShardingService {
    pub fn new(
        ctx: Arc<JobContext>,
        config: Arc<ConfigService>,
        leader: Arc<LeaderService>,
        servers: Arc<ServerService>,
        instances: Arc<InstanceService>,
        execution: Arc<ExecutionService>,
    ) -> Self {
        Self {
            ctx,
            config,
            leader,
            servers,
            instances,
            execution,
        }
    }

    /// Ask the leader to recompute the assignment
    pub async fn set_resharding_flag(&self) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        self.ctx.storage().create_if_needed(node_path::SHARDING_NECESSARY).await
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.ctx.storage().is_node_existed(node_path::SHARDING_NECESSARY).await
    }

    async fn is_sharding_processing(&self) -> Result<bool> {
        self.ctx.storage().is_node_existed(node_path::SHARDING_PROCESSING).await
    }

    /// Recompute and publish the assignment if a resharding is pending
    ///
    /// Followers block (bounded) until the leader has finished. On a
    /// rejected write the flag stays set so the next call retries.
    pub async fn sharding_if_necessary(&self) -> Result<()> {
        if self.ctx.is_shutdown() || !self.is_need_sharding().await? {
            return Ok(());
        }
        if self.instances.available_instances().await?.is_empty() {
            debug!("Job {} has no available instances; resharding deferred", self.ctx.job_name());
            return Ok(());
        }
        if !self.leader.is_leader_until_block().await {
            self.block_until_sharding_completed().await;
            return Ok(());
        }

        let config = self.config.load(false).await?;
        if config.monitor_execution {
            self.wait_running_items_completed().await;
        }
        // membership may have moved while waiting
        let candidates = self.instances.available_instances().await?;
        if candidates.is_empty() || !self.leader.is_leader().await {
            return Ok(());
        }

        let started = Instant::now();
        let storage = self.ctx.storage();
        let strategy = StrategyRegistry::resolve(&config.sharding_strategy)?;
        let assignment = strategy.sharding(&candidates, self.ctx.job_name(), config.sharding_total_count);

        let mut ops = Vec::new();
        for (instance, items) in &assignment {
            for &item in items {
                ops.push(storage.put_op(&JobNodePath::sharding_item_node(item), instance.instance_id()));
            }
        }
        for stale in self.assigned_items().await?.into_keys().filter(|&i| i >= config.sharding_total_count) {
            ops.push(storage.delete_op(&JobNodePath::sharding_item_node(stale)));
        }
        ops.push(storage.delete_op(node_path::SHARDING_NECESSARY));
        ops.push(storage.delete_op(node_path::SHARDING_PROCESSING));

        // nothing fallible between the marker and the commit
        storage
            .fill_ephemeral(node_path::SHARDING_PROCESSING, self.ctx.instance().instance_id())
            .await?;
        if let Err(e) = storage.commit(ops).await {
            warn!("Resharding of job {} rejected, will retry: {}", self.ctx.job_name(), e);
            if let Err(cleanup) = storage.remove_if_exists(node_path::SHARDING_PROCESSING).await {
                debug!("Could not clear sharding marker of job {}: {}", self.ctx.job_name(), cleanup);
            }
            return Err(e);
        }

        standard::RESHARDING_PASSES.inc();
        standard::LIVE_INSTANCES.set(candidates.len() as i64);
        standard::RESHARDING_DURATION.observe_since(started);
        info!(
            "Job {} resharded {} items across {} instances with {}",
            self.ctx.job_name(),
            config.sharding_total_count,
            candidates.len(),
            strategy.name()
        );
        Ok(())
    }

    async fn block_until_sharding_completed(&self) {
        let outcome = poll_until(&self.ctx.settings().sharding_policy(), self.ctx.shutdown_signal(), || async move {
            if self.leader.is_leader().await {
                return true;
            }
            let pending = self.is_need_sharding().await.unwrap_or(true)
                || self.is_sharding_processing().await.unwrap_or(true);
            !pending
        })
        .await;
        if outcome == PollOutcome::Exhausted {
            warn!("Job {} resharding did not finish within the wait budget", self.ctx.job_name());
        }
    }

    async fn wait_running_items_completed(&self) {
        let outcome = poll_until(&self.ctx.settings().sharding_policy(), self.ctx.shutdown_signal(), || async move {
            !self.execution.has_any_running().await.unwrap_or(false)
        })
        .await;
        if outcome == PollOutcome::Exhausted {
            warn!("Job {} items still running; resharding anyway", self.ctx.job_name());
        }
    }

    /// Current assignment: item -> instance id
    pub async fn assigned_items(&self) -> Result<BTreeMap<u32, String>> {
        let storage = self.ctx.storage();
        let mut assignment = BTreeMap::new();
        for item in storage.children(node_path::SHARDING).await?.iter().filter_map(|n| parse_item(n)) {
            if let Some(owner) = storage.get_data(&JobNodePath::sharding_item_node(item)).await? {
                assignment.insert(item, owner);
            }
        }
        Ok(assignment)
    }

    /// Items assigned to `instance_id`, empty unless it is available
    pub async fn get_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let instance = JobInstance::parse(instance_id)?;
        if !self.servers.is_available_server(instance.ip()).await?
            || !self.instances.is_instance_online(instance_id).await?
        {
            return Ok(Vec::new());
        }
        self.get_crashed_sharding_items(instance_id).await
    }

    /// Items still recorded against `instance_id`, live or not
    pub async fn get_crashed_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let total = self.ctx.config().sharding_total_count;
        Ok(self
            .assigned_items()
            .await?
            .into_iter()
            .filter(|(item, owner)| *item < total && owner == instance_id)
            .map(|(item, _)| item)
            .collect())
    }

    /// Items of the local instance, before take-off exclusion
    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() {
            return Ok(Vec::new());
        }
        self.get_sharding_items(self.ctx.instance().instance_id()).await
    }

    /// Whether some item is assigned to an instance that is gone
    pub async fn has_sharding_info_in_offline_servers(&self) -> Result<bool> {
        let live: HashSet<String> = self
            .instances
            .live_instances()
            .await?
            .into_iter()
            .map(|i| i.instance_id().to_string())
            .collect();
        let total = self.ctx.config().sharding_total_count;
        Ok(self
            .assigned_items()
            .await?
            .iter()
            .any(|(item, owner)| *item < total && !live.contains(owner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorSettings, JobConfig};
    use crate::coordinator::context::JobContext;
    use crate::coordinator::job::JobServices;
    use crate::store::MemoryStore;

    async fn leader_services(store: &MemoryStore) -> JobServices {
        let config = JobConfig::new("orders", "0/5 * * * * ?", 4);
        let ctx = Arc::new(JobContext::new(
            Arc::new(store.connect()),
            config.clone(),
            CoordinatorSettings::default(),
            JobInstance::from_parts("10.0.0.1", "local"),
        ));
        let services = JobServices::new(ctx);
        services.config.persist(&config).await.unwrap();
        assert!(services.leader.elect_leader().await);
        services.servers.persist_online(true).await.unwrap();
        services.instances.persist_online().await.unwrap();
        services
    }

    #[tokio::test]
    async fn test_leader_pass_publishes_assignment() {
        let store = MemoryStore::new();
        let services = leader_services(&store).await;
        services.sharding.set_resharding_flag().await.unwrap();

        services.sharding.sharding_if_necessary().await.unwrap();
        assert!(!services.sharding.is_need_sharding().await.unwrap());
        assert!(!services.sharding.is_sharding_processing().await.unwrap());
        assert_eq!(services.sharding.get_local_sharding_items().await.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_pass_leaves_no_processing_marker() {
        let store = MemoryStore::new();
        let services = leader_services(&store).await;
        services
            .ctx
            .storage()
            .fill(&JobNodePath::config_field_node("sharding_strategy"), "\"HASH_RING\"")
            .await
            .unwrap();
        services.sharding.set_resharding_flag().await.unwrap();

        assert!(services.sharding.sharding_if_necessary().await.is_err());
        assert!(!services.sharding.is_sharding_processing().await.unwrap());
        // the flag stays so a later pass retries
        assert!(services.sharding.is_need_sharding().await.unwrap());
        assert!(services.sharding.assigned_items().await.unwrap().is_empty());
    }
}
