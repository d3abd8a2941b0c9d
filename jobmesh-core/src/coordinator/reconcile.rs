//! Periodic consistency check
//!
//! Watches can be missed across reconnects. The leader periodically looks
//! for items still assigned to instances that are gone and requests a
//! resharding if it finds any.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::job::JobServices;
use crate::error::Result;

pub(crate) fn spawn_reconcile_loop(services: Arc<JobServices>) -> Option<JoinHandle<()>> {
    let period = services.ctx.settings().reconcile_interval?;
    let shutdown = services.ctx.shutdown_signal().clone();

    Some(tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = reconcile_once(&services).await {
                        debug!("Reconcile of job {} failed: {}", services.ctx.job_name(), e);
                    }
                }
            }
        }
        debug!("Reconcile loop of job {} stopped", services.ctx.job_name());
    }))
}

/// One pass; returns whether a resharding was requested
pub(crate) async fn reconcile_once(s: &JobServices) -> Result<bool> {
    if s.ctx.is_paused() || !s.leader.is_leader().await {
        return Ok(false);
    }
    if s.sharding.is_need_sharding().await? {
        return Ok(false);
    }
    if s.sharding.has_sharding_info_in_offline_servers().await? {
        warn!("Job {} has items assigned to offline instances, resharding", s.ctx.job_name());
        s.sharding.set_resharding_flag().await?;
        return Ok(true);
    }
    Ok(false)
}
