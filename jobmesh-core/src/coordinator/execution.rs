//! Per-item execution markers and misfire flags
//!
//! `execution/{item}/running` is ephemeral and holds the owner's instance
//! id, so a crashed owner's markers vanish with its session.
//! `execution/{item}/misfire` is persistent and records a fire that
//! overlapped a running item.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use super::context::JobContext;
use super::instance::load_live_instances;
use super::leader::LeaderService;
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::{node_path, parse_item, JobNodePath};

pub struct ExecutionService {
    ctx: Arc<JobContext>,
    leader: Arc<LeaderService>,
}

impl ExecutionService {
    pub fn new(ctx: Arc<JobContext>, leader: Arc<LeaderService>) -> Self {
        Self { ctx, leader }
    }

    fn monitor_execution(&self) -> bool {
        self.ctx.config().monitor_execution
    }

    /// Mark items running; no-op unless execution is monitored
    pub async fn register_begin(&self, items: &[u32]) -> Result<()> {
        if !self.monitor_execution() {
            return Ok(());
        }
        let owner = self.ctx.instance().instance_id();
        for &item in items {
            self.ctx
                .storage()
                .fill_ephemeral(&JobNodePath::running_node(item), owner)
                .await?;
        }
        debug!("Job {} items {:?} running on {}", self.ctx.job_name(), items, owner);
        Ok(())
    }

    /// Clear running markers; no-op unless execution is monitored
    pub async fn register_completed(&self, items: &[u32]) -> Result<()> {
        if !self.monitor_execution() {
            return Ok(());
        }
        self.clear_running_info(items).await?;
        debug!("Job {} items {:?} completed", self.ctx.job_name(), items);
        Ok(())
    }

    pub async fn has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.monitor_execution() {
            return Ok(false);
        }
        for &item in items {
            if self.ctx.storage().is_node_existed(&JobNodePath::running_node(item)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Any item running anywhere in the cluster
    pub async fn has_any_running(&self) -> Result<bool> {
        Ok(!self.running_items().await?.is_empty())
    }

    /// Item -> owner instance id for every running marker
    pub async fn running_items(&self) -> Result<BTreeMap<u32, String>> {
        let storage = self.ctx.storage();
        let mut running = BTreeMap::new();
        for item in storage.children(node_path::EXECUTION).await?.iter().filter_map(|n| parse_item(n)) {
            if let Some(owner) = storage.get_data(&JobNodePath::running_node(item)).await? {
                running.insert(item, owner);
            }
        }
        Ok(running)
    }

    /// Check a fire against items still running from a previous fire
    ///
    /// Returns `true` when the caller must skip this fire. Overlapping items
    /// are flagged for the drain loop only when misfire handling is on.
    pub async fn misfire_if_necessary(&self, items: &[u32]) -> Result<bool> {
        if !self.monitor_execution() {
            return Ok(false);
        }
        let mut overlapping = Vec::new();
        for &item in items {
            if self.ctx.storage().is_node_existed(&JobNodePath::running_node(item)).await? {
                overlapping.push(item);
            }
        }
        if overlapping.is_empty() {
            return Ok(false);
        }
        if self.ctx.config().misfire {
            self.set_misfire(&overlapping).await?;
            standard::MISFIRES.inc();
            info!("Job {} items {:?} misfired", self.ctx.job_name(), overlapping);
        } else {
            debug!("Job {} items {:?} still running; fire skipped", self.ctx.job_name(), overlapping);
        }
        Ok(true)
    }

    pub async fn set_misfire(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.ctx.storage().create_if_needed(&JobNodePath::misfire_node(item)).await?;
        }
        Ok(())
    }

    pub async fn get_misfired_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut misfired = Vec::new();
        for &item in items {
            if self.ctx.storage().is_node_existed(&JobNodePath::misfire_node(item)).await? {
                misfired.push(item);
            }
        }
        Ok(misfired)
    }

    /// Whether any of `items` carries a misfire flag
    pub async fn is_execute_misfired(&self, items: &[u32]) -> Result<bool> {
        Ok(!self.get_misfired_items(items).await?.is_empty())
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.ctx.storage().remove_if_exists(&JobNodePath::misfire_node(item)).await?;
        }
        Ok(())
    }

    pub async fn clear_running_info(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.ctx.storage().remove_if_exists(&JobNodePath::running_node(item)).await?;
        }
        Ok(())
    }

    /// Drop every running marker of the job
    pub async fn clear_all_running_info(&self) -> Result<()> {
        let items: Vec<u32> = self.running_items().await?.into_keys().collect();
        self.clear_running_info(&items).await?;
        if !items.is_empty() {
            info!("Cleared running markers of job {} items {:?}", self.ctx.job_name(), items);
        }
        Ok(())
    }

    /// Leader-only sweep of stale execution state
    ///
    /// Removes running markers whose owner is no longer live and whole
    /// execution records of items beyond the current total count. Returns
    /// the number of records touched; followers touch nothing.
    pub async fn clean_previous_execution_info(&self) -> Result<usize> {
        if !self.leader.is_leader().await {
            return Ok(0);
        }
        let storage = self.ctx.storage();
        let total = self.ctx.config().sharding_total_count;
        let live: HashSet<String> = load_live_instances(storage)
            .await?
            .into_iter()
            .map(|i| i.instance_id().to_string())
            .collect();

        let mut cleaned = 0;
        for item in storage.children(node_path::EXECUTION).await?.iter().filter_map(|n| parse_item(n)) {
            if item >= total {
                storage.remove_if_exists(&JobNodePath::execution_item_node(item)).await?;
                cleaned += 1;
                continue;
            }
            let owner = storage.get_data(&JobNodePath::running_node(item)).await?;
            if matches!(owner, Some(ref id) if !live.contains(id)) {
                storage.remove_if_exists(&JobNodePath::running_node(item)).await?;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            info!("Cleaned {} stale execution records of job {}", cleaned, self.ctx.job_name());
        }
        Ok(cleaned)
    }
}
