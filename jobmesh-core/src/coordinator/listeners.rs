//! Coordination callbacks wired onto the job's dispatcher
//!
//! Each callback is a small function of the change event. Errors are
//! logged and dropped; the next event or reconcile pass retries.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use super::job::JobServices;
use super::listener::ListenerManager;
use super::server::ServerStatus;
use crate::error::Result;
use crate::store::{TreeEvent, TreeEventKind};

pub const LEADER_ELECTION: &str = "leader-election";
pub const LEADER_ABDICATION: &str = "leader-abdication";
pub const MEMBERSHIP_RESHARDING: &str = "membership-resharding";
pub const CONFIG_CHANGES: &str = "config-changes";
pub const INSTANCE_CRASHED: &str = "instance-crashed";
pub const LEGACY_RECOVERY: &str = "legacy-recovery";

pub(crate) fn register_job_listeners(manager: &ListenerManager, services: &Arc<JobServices>) {
    bind(manager, LEADER_ELECTION, services, on_leader_election);
    bind(manager, LEADER_ABDICATION, services, on_leader_abdication);
    bind(manager, MEMBERSHIP_RESHARDING, services, on_membership_change);
    bind(manager, CONFIG_CHANGES, services, on_config_change);
    bind(manager, INSTANCE_CRASHED, services, on_instance_crashed);
    bind(manager, LEGACY_RECOVERY, services, on_local_instance_added);
}

fn bind<F, Fut>(manager: &ListenerManager, name: &'static str, services: &Arc<JobServices>, handler: F)
where
    F: Fn(Arc<JobServices>, TreeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let services = services.clone();
    manager.register(name, move |event: TreeEvent| {
        let job_name = services.ctx.job_name().to_string();
        let skip = services.ctx.is_shutdown();
        let work = handler(services.clone(), event);
        async move {
            if skip {
                return;
            }
            if let Err(e) = work.await {
                warn!("Listener {} of job {} failed: {}", name, job_name, e);
            }
        }
    });
}

/// Elect when the leader node vanishes, or when the local server comes up
/// enabled while nobody leads
async fn on_leader_election(s: Arc<JobServices>, event: TreeEvent) -> Result<()> {
    let nodes = s.ctx.nodes();
    let leader_gone = event.kind == TreeEventKind::Deleted && nodes.is_leader_instance_path(&event.path);
    if leader_gone {
        if s.servers.is_local_server_available().await? {
            s.leader.elect_leader().await;
        }
        return Ok(());
    }

    let local_enabled = event.kind != TreeEventKind::Deleted
        && nodes.server_ip_of(&event.path) == Some(s.ctx.instance().ip())
        && event.value.as_deref().map(ServerStatus::parse) == Some(ServerStatus::Enabled);
    if local_enabled && !s.leader.has_leader().await? {
        s.leader.elect_leader().await;
    }
    Ok(())
}

/// Step down when the local server is disabled
async fn on_leader_abdication(s: Arc<JobServices>, event: TreeEvent) -> Result<()> {
    let disabled = event.kind != TreeEventKind::Deleted
        && s.ctx.nodes().server_ip_of(&event.path) == Some(s.ctx.instance().ip())
        && event.value.as_deref().map(ServerStatus::parse) == Some(ServerStatus::Disabled);
    if disabled && s.leader.is_leader().await {
        s.leader.remove_leader().await?;
    }
    Ok(())
}

/// Instances joining or leaving and any server status change reshard
async fn on_membership_change(s: Arc<JobServices>, event: TreeEvent) -> Result<()> {
    let nodes = s.ctx.nodes();
    let instance_change = event.kind != TreeEventKind::Updated && nodes.instance_id_of(&event.path).is_some();
    let server_change = nodes.server_ip_of(&event.path).is_some();
    if instance_change || server_change {
        s.sharding.set_resharding_flag().await?;
    }
    Ok(())
}

/// Refresh the config cache whenever a writer bumps `config/version`
async fn on_config_change(s: Arc<JobServices>, event: TreeEvent) -> Result<()> {
    let is_version = s.ctx.nodes().config_field_of(&event.path) == Some(super::config_service::VERSION_FIELD);
    if !is_version || event.kind == TreeEventKind::Deleted {
        return Ok(());
    }

    let (previous, current) = s.config.refresh_cache().await?;
    if previous.sharding_total_count != current.sharding_total_count
        || !previous.sharding_strategy.eq_ignore_ascii_case(&current.sharding_strategy)
    {
        info!(
            "Job {} sharding changed ({} -> {} items), resharding",
            s.ctx.job_name(),
            previous.sharding_total_count,
            current.sharding_total_count
        );
        s.sharding.set_resharding_flag().await?;
    }
    if !current.failover {
        s.failover.remove_failover_info().await?;
    }
    if previous.monitor_execution && !current.monitor_execution {
        s.execution.clear_all_running_info().await?;
    }
    Ok(())
}

/// Another instance's presence node vanished
async fn on_instance_crashed(s: Arc<JobServices>, event: TreeEvent) -> Result<()> {
    if event.kind != TreeEventKind::Deleted {
        return Ok(());
    }
    let Some(crashed) = s.ctx.nodes().instance_id_of(&event.path) else {
        return Ok(());
    };
    if crashed == s.ctx.instance().instance_id() {
        return Ok(());
    }
    s.failover.handle_instance_crashed(crashed).await?;
    Ok(())
}

/// The local instance came online alone: repair leftovers of a cluster
/// that went down entirely
async fn on_local_instance_added(s: Arc<JobServices>, event: TreeEvent) -> Result<()> {
    if event.kind != TreeEventKind::Added
        || s.ctx.nodes().instance_id_of(&event.path) != Some(s.ctx.instance().instance_id())
    {
        return Ok(());
    }
    let available = s.instances.available_instances().await?;
    if available.len() == 1 && available[0] == *s.ctx.instance() {
        s.failover.recover_legacy().await?;
    }
    Ok(())
}
