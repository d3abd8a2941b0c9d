//! Cluster simulation binary
//!
//! Runs several instances of one job over an in-process store, fires a few
//! cycles, crashes one instance and logs the failover that follows.

use jobmesh_core::store::{CoordinatorStore, MemorySession, MemoryStore};
use jobmesh_core::{CoordinatorSettings, JobConfig, JobCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Node {
    session: Arc<MemorySession>,
    coordinator: Arc<JobCoordinator>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let job_name = std::env::var("JOB_NAME").unwrap_or_else(|_| "demo-job".into());
    let instances: usize = env_or("INSTANCES", 3);
    let total: u32 = env_or("SHARDING_TOTAL", 9);
    let cycles: u32 = env_or("CYCLES", 3);

    info!("Simulating job {} with {} instances and {} items", job_name, instances, total);

    let config = JobConfig::new(&job_name, "0/10 * * * * ?", total)
        .with_failover(true)
        .with_item_parameters("0=alpha,1=beta,2=gamma");
    let store = MemoryStore::new();

    let mut nodes = Vec::with_capacity(instances);
    for i in 0..instances {
        let mut settings = CoordinatorSettings::from_env();
        settings.instance_ip = Some(format!("10.0.0.{}", i + 1));
        settings.leader_poll_interval = Duration::from_millis(20);
        settings.sharding_wait_interval = Duration::from_millis(20);

        let session = Arc::new(store.connect());
        let client: Arc<dyn CoordinatorStore> = session.clone();
        let coordinator = Arc::new(JobCoordinator::new(client, config.clone(), settings)?);
        coordinator.start().await?;
        nodes.push(Node { session, coordinator });
    }

    for cycle in 1..=cycles {
        info!("--- cycle {} ---", cycle);
        for node in &nodes {
            let coordinator = &node.coordinator;
            let context = coordinator.sharding_context().await?;
            let items: Vec<u32> = context.items.keys().copied().collect();
            if items.is_empty() {
                continue;
            }
            if coordinator.misfire_if_necessary(&items).await? {
                warn!("Instance {} skipped a fire of items {:?}", coordinator.instance(), items);
                continue;
            }
            let instance = coordinator.instance().to_string();
            let runs = coordinator
                .execute_with_misfire_drain(&items, |batch| {
                    let instance = instance.clone();
                    let params = context.items.clone();
                    async move {
                        info!("Instance {} running items {:?} ({:?})", instance, batch, params);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await?;
            if runs > 1 {
                info!("Instance {} drained {} misfired runs", instance, runs - 1);
            }
        }
    }

    if let Some(victim) = nodes.pop() {
        info!("Crashing instance {}", victim.coordinator.instance());
        victim.session.expire();
        victim.coordinator.halt();
        tokio::time::sleep(Duration::from_millis(200)).await;

        for node in &nodes {
            let coordinator = &node.coordinator;
            let mut claimed = coordinator.get_local_failover_items().await?;
            while !claimed.is_empty() {
                info!("Instance {} runs failover items {:?}", coordinator.instance(), claimed);
                claimed = coordinator.update_failover_complete(&claimed).await?;
            }
        }
        for node in &nodes {
            node.coordinator.sharding_if_necessary().await?;
            info!(
                "Instance {} now owns items {:?}",
                node.coordinator.instance(),
                node.coordinator.get_local_sharding_items().await?
            );
        }
    }

    println!("{}", jobmesh_core::metrics::gather_system_metrics());

    for node in &nodes {
        node.coordinator.shutdown().await;
    }
    info!("Simulation finished");
    Ok(())
}
