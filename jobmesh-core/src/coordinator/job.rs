//! Job coordinator facade
//!
//! Wires the per-job services together, owns their background tasks and
//! exposes the surface an execution engine drives: local items, misfire
//! bookkeeping, failover claims and eligibility.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config_service::ConfigService;
use super::context::JobContext;
use super::execution::ExecutionService;
use super::failover::{FailoverService, FailoverTrigger};
use super::instance::{InstanceService, JobInstance};
use super::leader::LeaderService;
use super::listener::ListenerManager;
use super::listeners::register_job_listeners;
use super::reconcile::spawn_reconcile_loop;
use super::server::{ServerService, ServerStatus};
use super::sharding::ShardingService;
use crate::config::{CoordinatorSettings, JobConfig};
use crate::error::{JobMeshError, Result};
use crate::store::{ConnectionState, CoordinatorStore};

/// The services of one job, shared with listeners and background tasks
pub struct JobServices {
    pub(crate) ctx: Arc<JobContext>,
    pub(crate) config: Arc<ConfigService>,
    pub(crate) servers: Arc<ServerService>,
    pub(crate) instances: Arc<InstanceService>,
    pub(crate) leader: Arc<LeaderService>,
    pub(crate) execution: Arc<ExecutionService>,
    pub(crate) sharding: Arc<ShardingService>,
    pub(crate) failover: Arc<FailoverService>,
}

impl JobServices {
    pub(crate) fn new(ctx: Arc<JobContext>) -> Self {
        let config = Arc::new(ConfigService::new(ctx.clone()));
        let servers = Arc::new(ServerService::new(ctx.clone()));
        let instances = Arc::new(InstanceService::new(ctx.clone(), servers.clone()));
        let leader = Arc::new(LeaderService::new(ctx.clone(), servers.clone()));
        let execution = Arc::new(ExecutionService::new(ctx.clone(), leader.clone()));
        let sharding = Arc::new(ShardingService::new(
            ctx.clone(),
            config.clone(),
            leader.clone(),
            servers.clone(),
            instances.clone(),
            execution.clone(),
        ));
        let failover = Arc::new(FailoverService::new(
            ctx.clone(),
            servers.clone(),
            sharding.clone(),
            execution.clone(),
        ));
        Self {
            ctx,
            config,
            servers,
            instances,
            leader,
            execution,
            sharding,
            failover,
        }
    }
}

/// What the engine should run on the next fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingContext {
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    /// Item -> item parameter (empty when none is configured)
    pub items: BTreeMap<u32, String>,
    /// The items are failover work taken over from a crashed instance
    pub failover: bool,
}

/// Coordination kernel of one job on one process
pub struct JobCoordinator {
    services: Arc<JobServices>,
    local_config: JobConfig,
    listeners: ListenerManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobCoordinator {
    /// Coordinator for `config`, identified by this host's address
    pub fn new(store: Arc<dyn CoordinatorStore>, config: JobConfig, settings: CoordinatorSettings) -> Result<Self> {
        let instance = JobInstance::local(settings.instance_ip.as_deref());
        Self::with_instance(store, config, settings, instance)
    }

    pub fn with_instance(
        store: Arc<dyn CoordinatorStore>,
        config: JobConfig,
        settings: CoordinatorSettings,
        instance: JobInstance,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(JobContext::new(store, config.clone(), settings, instance));
        Ok(Self {
            listeners: ListenerManager::new(&config.job_name),
            services: Arc::new(JobServices::new(ctx)),
            local_config: config,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the local instance and start reacting to cluster changes
    ///
    /// Any failure here is fatal for the job and reported as
    /// [`JobMeshError::StartupFailed`].
    pub async fn start(&self) -> Result<()> {
        self.register_startup().await.map_err(|e| JobMeshError::StartupFailed {
            job_name: self.local_config.job_name.clone(),
            source: Box::new(e),
        })
    }

    async fn register_startup(&self) -> Result<()> {
        let s = &self.services;
        if s.ctx.is_shutdown() {
            return Err(JobMeshError::ShutdownInProgress);
        }
        let effective = s.config.persist(&self.local_config).await?;

        let events = s.ctx.storage().watch()?;
        register_job_listeners(&self.listeners, s);
        self.listeners.start(events, s.ctx.shutdown_signal().clone());

        s.leader.elect_leader().await;
        s.servers.persist_online(!effective.disabled).await?;
        s.instances.persist_online().await?;
        s.sharding.set_resharding_flag().await?;

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_connection_watcher(s.clone()));
        if let Some(handle) = spawn_reconcile_loop(s.clone()) {
            tasks.push(handle);
        }
        info!("Job {} started on instance {}", s.ctx.job_name(), s.ctx.instance());
        Ok(())
    }

    /// Leave the cluster gracefully
    ///
    /// Optionally disables the local server, steps down as leader, removes
    /// the instance node and stops background work.
    pub async fn shutdown(&self) {
        let s = &self.services;
        if s.ctx.is_shutdown() {
            return;
        }
        // set first so the local instance cannot re-elect itself
        s.ctx.shutdown_signal().shutdown();

        if s.ctx.settings().disable_server_on_shutdown {
            if let Err(e) = s.servers.set_status(s.ctx.instance().ip(), ServerStatus::Disabled).await {
                warn!("Could not disable server of job {}: {}", s.ctx.job_name(), e);
            }
        }
        if let Err(e) = s.leader.remove_leader().await {
            warn!("Could not step down as leader of job {}: {}", s.ctx.job_name(), e);
        }
        if let Err(e) = s.instances.remove_instance().await {
            warn!("Could not remove instance of job {}: {}", s.ctx.job_name(), e);
        }

        self.listeners.stop().await;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Job {} shut down on instance {}", s.ctx.job_name(), s.ctx.instance());
    }

    /// Stop local activity without touching the store
    ///
    /// For a session that is already gone; presence nodes vanish with it.
    pub fn halt(&self) {
        self.services.ctx.shutdown_signal().shutdown();
        self.listeners.abort();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        warn!("Job {} halted on instance {}", self.job_name(), self.instance());
    }

    pub fn job_name(&self) -> &str {
        self.services.ctx.job_name()
    }

    pub fn instance(&self) -> &JobInstance {
        self.services.ctx.instance()
    }

    /// Cached cluster configuration
    pub fn config(&self) -> JobConfig {
        self.services.ctx.config()
    }

    pub fn is_shutdown(&self) -> bool {
        self.services.ctx.is_shutdown()
    }

    pub fn leader(&self) -> &LeaderService {
        &self.services.leader
    }

    pub fn servers(&self) -> &ServerService {
        &self.services.servers
    }

    pub fn instances(&self) -> &InstanceService {
        &self.services.instances
    }

    pub fn sharding(&self) -> &ShardingService {
        &self.services.sharding
    }

    pub fn execution(&self) -> &ExecutionService {
        &self.services.execution
    }

    pub fn failover(&self) -> &FailoverService {
        &self.services.failover
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    pub async fn is_leader(&self) -> bool {
        self.services.leader.is_leader().await
    }

    /// Operator action: enable or disable a server of this job
    pub async fn set_server_status(&self, ip: &str, status: ServerStatus) -> Result<()> {
        self.services.servers.set_status(ip, status).await
    }

    /// Operator action: publish a new configuration to every instance
    pub async fn update_config(&self, config: &JobConfig) -> Result<()> {
        self.services.config.update(config).await
    }

    /// Items this instance should run, minus those taken over elsewhere
    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        let s = &self.services;
        let items = s.sharding.get_local_sharding_items().await?;
        let takeoff = s.failover.get_local_takeoff_items().await?;
        Ok(items.into_iter().filter(|item| !takeoff.contains(item)).collect())
    }

    pub async fn sharding_if_necessary(&self) -> Result<()> {
        self.services.sharding.sharding_if_necessary().await
    }

    /// What to run on the next fire: claimed failover work takes
    /// precedence over the ordinary assignment
    pub async fn sharding_context(&self) -> Result<ShardingContext> {
        let s = &self.services;
        let config = s.ctx.config();
        let parameters = config.item_parameters()?;

        let failover_items = if config.failover {
            s.failover.get_local_failover_items().await?
        } else {
            Vec::new()
        };
        let failover = !failover_items.is_empty();
        let items = if failover {
            failover_items
        } else {
            s.sharding.sharding_if_necessary().await?;
            self.get_local_sharding_items().await?
        };

        Ok(ShardingContext {
            job_name: config.job_name.clone(),
            sharding_total_count: config.sharding_total_count,
            job_parameter: config.job_parameter.clone(),
            items: items
                .into_iter()
                .map(|item| (item, parameters.get(&item).cloned().unwrap_or_default()))
                .collect(),
            failover,
        })
    }

    pub async fn misfire_if_necessary(&self, items: &[u32]) -> Result<bool> {
        self.services.execution.misfire_if_necessary(items).await
    }

    pub async fn register_begin(&self, items: &[u32]) -> Result<()> {
        self.services.execution.register_begin(items).await
    }

    pub async fn register_completed(&self, items: &[u32]) -> Result<()> {
        self.services.execution.register_completed(items).await
    }

    pub async fn is_execute_misfired(&self, items: &[u32]) -> Result<bool> {
        self.services.execution.is_execute_misfired(items).await
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        self.services.execution.clear_misfire(items).await
    }

    pub async fn clean_previous_execution_info(&self) -> Result<usize> {
        self.services.execution.clean_previous_execution_info().await
    }

    pub async fn failover_if_necessary(&self) -> Result<Vec<u32>> {
        self.services.failover.failover_if_necessary().await
    }

    pub async fn get_local_failover_items(&self) -> Result<Vec<u32>> {
        self.services.failover.get_local_failover_items().await
    }

    /// Report finished failover work; returns the next item claimed, if any
    pub async fn update_failover_complete(&self, items: &[u32]) -> Result<Vec<u32>> {
        self.services.failover.update_failover_complete(items).await
    }

    /// Items claimed through failover, as they are claimed
    pub fn subscribe_failover(&self) -> broadcast::Receiver<FailoverTrigger> {
        self.services.failover.subscribe()
    }

    /// `false` while paused, shutting down or waiting for a resharding
    pub async fn is_eligible_for_job_running(&self) -> bool {
        let ctx = &self.services.ctx;
        if ctx.is_shutdown() || ctx.is_paused() {
            return false;
        }
        matches!(self.services.sharding.is_need_sharding().await, Ok(false))
    }

    /// Run a batch, then re-run it while fires that overlapped it remain
    ///
    /// Returns the number of runs. Re-runs stop early once the job is no
    /// longer eligible, and after `misfire_drain_max_rounds` in any case.
    pub async fn execute_with_misfire_drain<F, Fut>(&self, items: &[u32], mut run: F) -> Result<u32>
    where
        F: FnMut(Vec<u32>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let max_rounds = self.services.ctx.settings().misfire_drain_max_rounds;
        let mut rounds = 0;
        loop {
            self.register_begin(items).await?;
            run(items.to_vec()).await;
            self.register_completed(items).await?;
            rounds += 1;

            if rounds >= max_rounds
                || !self.is_eligible_for_job_running().await
                || !self.is_execute_misfired(items).await?
            {
                break;
            }
            debug!("Job {} items {:?} misfired during run, re-running", self.job_name(), items);
            self.clear_misfire(items).await?;
        }
        Ok(rounds)
    }
}

fn spawn_connection_watcher(services: Arc<JobServices>) -> JoinHandle<()> {
    let mut states = services.ctx.storage().store().connection_events();
    let shutdown = services.ctx.shutdown_signal().clone();

    tokio::spawn(async move {
        loop {
            let state = tokio::select! {
                _ = shutdown.cancelled() => break,
                state = states.recv() => state,
            };
            match state {
                Ok(ConnectionState::Suspended) | Ok(ConnectionState::Lost) => {
                    services.ctx.pause();
                    warn!("Job {} lost its store connection; pausing", services.ctx.job_name());
                }
                Ok(ConnectionState::Reconnected) => {
                    if let Err(e) = handle_reconnected(&services).await {
                        warn!("Job {} could not re-register after reconnect: {}", services.ctx.job_name(), e);
                    }
                }
                Ok(ConnectionState::Connected) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Job {} skipped {} connection events", services.ctx.job_name(), skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_reconnected(s: &JobServices) -> Result<()> {
    if s.ctx.is_shutdown() {
        return Ok(());
    }
    let config = s.ctx.config();
    s.servers.persist_online(!config.disabled).await?;
    s.instances.persist_online().await?;
    let local_items = s.sharding.get_local_sharding_items().await?;
    s.execution.clear_running_info(&local_items).await?;
    s.ctx.resume();
    info!("Job {} re-registered instance {} after reconnect", s.ctx.job_name(), s.ctx.instance());
    Ok(())
}
