//! Job instance identity and registration
//!
//! Each process participating in a job owns one ephemeral node under
//! `instances/`. Its disappearance is the crash signal the failover path
//! reacts to.

use std::fmt;
use std::net::UdpSocket;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::context::JobContext;
use super::server::ServerService;
use crate::error::{JobMeshError, Result};
use crate::storage::{node_path, JobNodePath, JobNodeStorage};

/// Separator between IP and unique suffix in an instance id
pub const DELIMITER: &str = "@-@";

/// One running process participating in a job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobInstance {
    instance_id: String,
    ip: String,
}

impl JobInstance {
    /// Fresh identity for a process on `ip`
    pub fn new(ip: &str) -> Self {
        Self::from_parts(ip, &Uuid::new_v4().simple().to_string())
    }

    /// Identity advertised by this host
    pub fn local(ip_override: Option<&str>) -> Self {
        match ip_override {
            Some(ip) => Self::new(ip),
            None => Self::new(&local_ip()),
        }
    }

    pub fn from_parts(ip: &str, suffix: &str) -> Self {
        Self {
            instance_id: format!("{}{}{}", ip, DELIMITER, suffix),
            ip: ip.to_string(),
        }
    }

    /// Recover an instance from its id
    pub fn parse(instance_id: &str) -> Result<Self> {
        match instance_id.split_once(DELIMITER) {
            Some((ip, suffix)) if !ip.is_empty() && !suffix.is_empty() => Ok(Self {
                instance_id: instance_id.to_string(),
                ip: ip.to_string(),
            }),
            _ => Err(JobMeshError::InvalidInstanceId {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }
}

impl fmt::Display for JobInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.instance_id)
    }
}

/// Outbound IPv4 address of this host, falling back to loopback
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Every instance with a live node, sorted by id
pub async fn load_live_instances(storage: &JobNodeStorage) -> Result<Vec<JobInstance>> {
    let mut instances: Vec<JobInstance> = storage
        .children(node_path::INSTANCES)
        .await?
        .into_iter()
        .filter_map(|id| match JobInstance::parse(&id) {
            Ok(instance) => Some(instance),
            Err(e) => {
                warn!("Ignoring instance node: {}", e);
                None
            }
        })
        .collect();
    instances.sort();
    Ok(instances)
}

/// Registers the local instance and lists its peers
pub struct InstanceService {
    ctx: Arc<JobContext>,
    servers: Arc<ServerService>,
}

impl InstanceService {
    pub fn new(ctx: Arc<JobContext>, servers: Arc<ServerService>) -> Self {
        Self { ctx, servers }
    }

    /// Write the local ephemeral presence node
    pub async fn persist_online(&self) -> Result<()> {
        let instance = self.ctx.instance();
        self.ctx
            .storage()
            .fill_ephemeral(&JobNodePath::instance_node(instance.instance_id()), "")
            .await?;
        info!("Instance {} online for job {}", instance, self.ctx.job_name());
        Ok(())
    }

    /// Remove the local presence node on graceful shutdown
    pub async fn remove_instance(&self) -> Result<()> {
        let instance = self.ctx.instance();
        self.ctx
            .storage()
            .remove_if_exists(&JobNodePath::instance_node(instance.instance_id()))
            .await?;
        info!("Instance {} left job {}", instance, self.ctx.job_name());
        Ok(())
    }

    pub async fn is_local_instance_online(&self) -> Result<bool> {
        self.is_instance_online(self.ctx.instance().instance_id()).await
    }

    pub async fn is_instance_online(&self, instance_id: &str) -> Result<bool> {
        self.ctx
            .storage()
            .is_node_existed(&JobNodePath::instance_node(instance_id))
            .await
    }

    pub async fn live_instances(&self) -> Result<Vec<JobInstance>> {
        load_live_instances(self.ctx.storage()).await
    }

    /// Live instances whose server is enabled, sorted by id
    pub async fn available_instances(&self) -> Result<Vec<JobInstance>> {
        let mut available = Vec::new();
        for instance in self.live_instances().await? {
            if self.servers.is_enable_server(instance.ip()).await? {
                available.push(instance);
            }
        }
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_round_trip() {
        let instance = JobInstance::new("10.0.0.7");
        assert!(instance.instance_id().starts_with("10.0.0.7@-@"));
        assert_eq!(JobInstance::parse(instance.instance_id()).unwrap(), instance);
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(JobInstance::parse("10.0.0.7").is_err());
        assert!(JobInstance::parse("@-@abc").is_err());
    }

    #[test]
    fn test_instances_sort_by_id() {
        let mut list = vec![
            JobInstance::from_parts("10.0.0.2", "a"),
            JobInstance::from_parts("10.0.0.1", "b"),
        ];
        list.sort();
        assert_eq!(list[0].ip(), "10.0.0.1");
    }
}
