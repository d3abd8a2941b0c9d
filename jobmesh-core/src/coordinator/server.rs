//! Server enable/disable status
//!
//! One persistent node per physical IP. Status survives restarts; only an
//! operator or the local instance's disable-on-shutdown intent changes it.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::context::JobContext;
use super::instance::load_live_instances;
use crate::error::Result;
use crate::storage::{node_path, JobNodePath};

/// Server status as stored in `servers/{ip}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Enabled,
    Disabled,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Enabled => "ENABLED",
            ServerStatus::Disabled => "DISABLED",
        }
    }

    /// Anything other than `DISABLED` counts as enabled
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("DISABLED") {
            ServerStatus::Disabled
        } else {
            ServerStatus::Enabled
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ServerService {
    ctx: Arc<JobContext>,
}

impl ServerService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Announce the local server at startup
    ///
    /// An existing status is kept so an operator's disable survives
    /// restarts; a locally disabled job always writes `DISABLED`.
    pub async fn persist_online(&self, enabled: bool) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        let node = JobNodePath::server_node(self.ctx.instance().ip());
        if !enabled {
            self.ctx.storage().fill(&node, ServerStatus::Disabled.as_str()).await?;
        } else if !self.ctx.storage().is_node_existed(&node).await? {
            self.ctx.storage().fill(&node, ServerStatus::Enabled.as_str()).await?;
        }
        Ok(())
    }

    /// Idempotent status write
    pub async fn set_status(&self, ip: &str, status: ServerStatus) -> Result<()> {
        if self.status(ip).await? == Some(status) {
            return Ok(());
        }
        self.ctx
            .storage()
            .fill(&JobNodePath::server_node(ip), status.as_str())
            .await?;
        info!("Server {} of job {} is now {}", ip, self.ctx.job_name(), status);
        Ok(())
    }

    pub async fn status(&self, ip: &str) -> Result<Option<ServerStatus>> {
        Ok(self
            .ctx
            .storage()
            .get_data(&JobNodePath::server_node(ip))
            .await?
            .map(|v| ServerStatus::parse(&v)))
    }

    pub async fn is_enable_server(&self, ip: &str) -> Result<bool> {
        Ok(self.status(ip).await? == Some(ServerStatus::Enabled))
    }

    /// Enabled and hosting at least one live instance
    pub async fn is_available_server(&self, ip: &str) -> Result<bool> {
        if !self.is_enable_server(ip).await? {
            return Ok(false);
        }
        let live = load_live_instances(self.ctx.storage()).await?;
        Ok(live.iter().any(|i| i.ip() == ip))
    }

    pub async fn is_local_server_available(&self) -> Result<bool> {
        self.is_available_server(self.ctx.instance().ip()).await
    }

    /// IPs that are enabled and host a live instance
    pub async fn list_available(&self) -> Result<Vec<String>> {
        let live = load_live_instances(self.ctx.storage()).await?;
        let mut available = Vec::new();
        for ip in self.ctx.storage().children(node_path::SERVERS).await? {
            if live.iter().any(|i| i.ip() == ip) && self.is_enable_server(&ip).await? {
                available.push(ip);
            }
        }
        Ok(available)
    }

    pub async fn has_available_servers(&self) -> Result<bool> {
        Ok(!self.list_available().await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ServerStatus::parse("DISABLED"), ServerStatus::Disabled);
        assert_eq!(ServerStatus::parse("ENABLED"), ServerStatus::Enabled);
        assert_eq!(ServerStatus::parse(""), ServerStatus::Enabled);
    }
}
