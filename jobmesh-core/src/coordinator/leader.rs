//! Leader election
//!
//! At most one instance per job holds `leader/election/instance`. Elections
//! run under a distributed lock on `leader/election/latch` with a
//! double-check, so contenders that lose the race observe the winner
//! instead of overwriting it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::JobContext;
use super::server::ServerService;
use crate::error::{JobMeshError, Result};
use crate::metrics::standard;
use crate::runtime::{poll_until, PollOutcome};
use crate::storage::node_path;
use crate::store::DistributedLock;

pub struct LeaderService {
    ctx: Arc<JobContext>,
    servers: Arc<ServerService>,
}

impl LeaderService {
    pub fn new(ctx: Arc<JobContext>, servers: Arc<ServerService>) -> Self {
        Self { ctx, servers }
    }

    /// Contend for leadership; returns whether this call won
    ///
    /// Failures are logged, never surfaced: the next trigger retries.
    pub async fn elect_leader(&self) -> bool {
        if self.ctx.is_shutdown() {
            return false;
        }
        let lock = DistributedLock::new(
            self.ctx.storage().store().clone(),
            &self.ctx.nodes().full_path(node_path::LEADER_LATCH),
            self.ctx.instance().instance_id(),
            self.ctx.settings().lock_policy(),
        );
        let guard = match lock.acquire(self.ctx.shutdown_signal()).await {
            Ok(guard) => guard,
            Err(JobMeshError::Interrupted { .. }) => return false,
            Err(e) => {
                warn!("Leader election for job {} abandoned: {}", self.ctx.job_name(), e);
                return false;
            }
        };

        let won = match self.become_leader_if_vacant().await {
            Ok(won) => won,
            Err(e) => {
                warn!("Leader election for job {} failed: {}", self.ctx.job_name(), e);
                false
            }
        };
        if let Err(e) = guard.release().await {
            warn!("Failed to release election latch of job {}: {}", self.ctx.job_name(), e);
        }
        won
    }

    async fn become_leader_if_vacant(&self) -> Result<bool> {
        // shutdown may have fired while waiting on the latch
        if self.ctx.is_shutdown() || self.has_leader().await? {
            return Ok(false);
        }
        let won = self
            .ctx
            .storage()
            .try_create_ephemeral(node_path::LEADER_INSTANCE, self.ctx.instance().instance_id())
            .await?;
        if won {
            standard::LEADER_ELECTIONS_WON.inc();
            info!("Instance {} elected leader of job {}", self.ctx.instance(), self.ctx.job_name());
        }
        Ok(won)
    }

    /// Whether the local instance holds the leader node
    pub async fn is_leader(&self) -> bool {
        if self.ctx.is_shutdown() {
            return false;
        }
        match self.leader_id().await {
            Ok(id) => id.as_deref() == Some(self.ctx.instance().instance_id()),
            Err(e) => {
                debug!("Leader check for job {} failed: {}", self.ctx.job_name(), e);
                false
            }
        }
    }

    pub async fn has_leader(&self) -> Result<bool> {
        self.ctx.storage().is_node_existed(node_path::LEADER_INSTANCE).await
    }

    pub async fn leader_id(&self) -> Result<Option<String>> {
        self.ctx.storage().get_data(node_path::LEADER_INSTANCE).await
    }

    /// Wait (bounded) for some leader to exist, contending when eligible,
    /// then report whether it is the local instance
    ///
    /// Gives up early when no server is available to lead.
    pub async fn is_leader_until_block(&self) -> bool {
        let outcome = poll_until(&self.ctx.settings().leader_policy(), self.ctx.shutdown_signal(), || async move {
            if self.has_leader().await.unwrap_or(false) {
                return true;
            }
            if !self.servers.has_available_servers().await.unwrap_or(false) {
                return true;
            }
            debug!("Job {} has no leader; waiting", self.ctx.job_name());
            if self.servers.is_local_server_available().await.unwrap_or(false) {
                self.elect_leader().await;
            }
            self.has_leader().await.unwrap_or(false)
        })
        .await;

        if outcome == PollOutcome::Exhausted {
            warn!("Job {} still has no leader after the poll budget", self.ctx.job_name());
        }
        self.is_leader().await
    }

    /// Abdicate if the local instance is leader
    pub async fn remove_leader(&self) -> Result<()> {
        let local = self.ctx.instance().instance_id();
        if self.leader_id().await?.as_deref() == Some(local) {
            self.ctx.storage().remove_if_exists(node_path::LEADER_INSTANCE).await?;
            info!("Instance {} stepped down as leader of job {}", self.ctx.instance(), self.ctx.job_name());
        }
        Ok(())
    }
}
