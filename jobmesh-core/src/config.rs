//! Job and coordinator configuration
//!
//! [`JobConfig`] is the cluster-wide job definition persisted under the
//! job's `config` node. [`CoordinatorSettings`] is local to one process:
//! polling budgets and shutdown behaviour.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::shard_assigner::StrategyRegistry;
use crate::error::{JobMeshError, Result};
use crate::runtime::RetryPolicy;

/// Cluster-wide job definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Job name; also the root of the job's namespace
    pub job_name: String,
    /// Cron expression handed to the external trigger
    pub cron: String,
    /// Number of shard items
    pub sharding_total_count: u32,
    /// Per-item parameters, e.g. `0=Beijing,1=Shanghai`
    pub sharding_item_parameters: String,
    /// Free-form parameter for the job body
    pub job_parameter: String,
    /// Re-run crashed instances' items elsewhere
    pub failover: bool,
    /// Defer fires that overlap a running item
    pub misfire: bool,
    /// Track per-item running markers
    pub monitor_execution: bool,
    /// Local definition replaces the registry copy on startup
    pub overwrite: bool,
    /// Start with the local server disabled
    pub disabled: bool,
    /// Name of the sharding strategy
    pub sharding_strategy: String,
    pub description: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            cron: String::new(),
            sharding_total_count: 1,
            sharding_item_parameters: String::new(),
            job_parameter: String::new(),
            failover: false,
            misfire: true,
            monitor_execution: true,
            overwrite: false,
            disabled: false,
            sharding_strategy: StrategyRegistry::DEFAULT.to_string(),
            description: String::new(),
        }
    }
}

impl JobConfig {
    /// Minimal definition for a job
    pub fn new(job_name: impl Into<String>, cron: impl Into<String>, sharding_total_count: u32) -> Self {
        Self {
            job_name: job_name.into(),
            cron: cron.into(),
            sharding_total_count,
            ..Default::default()
        }
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn with_misfire(mut self, enabled: bool) -> Self {
        self.misfire = enabled;
        self
    }

    pub fn with_monitor_execution(mut self, enabled: bool) -> Self {
        self.monitor_execution = enabled;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        self.sharding_strategy = name.into();
        self
    }

    pub fn with_item_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.sharding_item_parameters = parameters.into();
        self
    }

    /// Reject definitions the kernel cannot schedule
    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() || self.job_name.contains('/') {
            return Err(JobMeshError::InvalidConfig {
                reason: format!("job name '{}' must be non-empty and contain no '/'", self.job_name),
            });
        }
        if self.cron.trim().is_empty() {
            return Err(JobMeshError::InvalidConfig {
                reason: "cron expression is required".into(),
            });
        }
        if self.sharding_total_count == 0 {
            return Err(JobMeshError::InvalidConfig {
                reason: "sharding total count must be positive".into(),
            });
        }
        if !StrategyRegistry::contains(&self.sharding_strategy) {
            return Err(JobMeshError::UnknownStrategy {
                name: self.sharding_strategy.clone(),
            });
        }
        self.item_parameters()?;
        Ok(())
    }

    /// Parse `sharding_item_parameters` into an item -> parameter map
    pub fn item_parameters(&self) -> Result<BTreeMap<u32, String>> {
        let mut map = BTreeMap::new();
        for pair in self.sharding_item_parameters.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (item, value) = pair.split_once('=').ok_or_else(|| JobMeshError::InvalidConfig {
                reason: format!("sharding item parameter '{}' is not of the form item=value", pair),
            })?;
            let item: u32 = item.trim().parse().map_err(|_| JobMeshError::InvalidConfig {
                reason: format!("sharding item '{}' is not a number", item.trim()),
            })?;
            map.insert(item, value.trim().to_string());
        }
        Ok(map)
    }
}

/// Process-local coordination settings
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Wait between leader checks in `is_leader_until_block`
    pub leader_poll_interval: Duration,
    /// Leader checks before giving up
    pub leader_poll_max_attempts: u32,
    /// First backoff step when the election lock is contended
    pub lock_retry_interval: Duration,
    /// Lock attempts before an election attempt is abandoned
    pub lock_max_attempts: u32,
    /// Wait between checks while resharding or running items settle
    pub sharding_wait_interval: Duration,
    pub sharding_wait_max_attempts: u32,
    /// Runs of one batch, the first included, when draining misfired fires
    pub misfire_drain_max_rounds: u32,
    /// Period of the reconcile loop; `None` disables it
    pub reconcile_interval: Option<Duration>,
    /// Mark the local server disabled on graceful shutdown
    pub disable_server_on_shutdown: bool,
    /// Override for the advertised instance IP
    pub instance_ip: Option<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            leader_poll_interval: Duration::from_millis(100),
            leader_poll_max_attempts: 300,
            lock_retry_interval: Duration::from_millis(20),
            lock_max_attempts: 50,
            sharding_wait_interval: Duration::from_millis(100),
            sharding_wait_max_attempts: 600,
            misfire_drain_max_rounds: 16,
            reconcile_interval: Some(Duration::from_secs(60)),
            disable_server_on_shutdown: false,
            instance_ip: None,
        }
    }
}

impl CoordinatorSettings {
    /// Defaults overridden by `JOBMESH_*` environment variables
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(ms) = env_u64("JOBMESH_LEADER_POLL_MS") {
            settings.leader_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("JOBMESH_LEADER_POLL_ATTEMPTS") {
            settings.leader_poll_max_attempts = n as u32;
        }
        if let Some(ms) = env_u64("JOBMESH_LOCK_RETRY_MS") {
            settings.lock_retry_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("JOBMESH_LOCK_ATTEMPTS") {
            settings.lock_max_attempts = n as u32;
        }
        if let Some(ms) = env_u64("JOBMESH_SHARDING_WAIT_MS") {
            settings.sharding_wait_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("JOBMESH_RECONCILE_SECS") {
            settings.reconcile_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Ok(value) = std::env::var("JOBMESH_DISABLE_ON_SHUTDOWN") {
            settings.disable_server_on_shutdown = matches!(value.as_str(), "1" | "true" | "yes");
        }
        settings.instance_ip = std::env::var("JOBMESH_INSTANCE_IP").ok().filter(|ip| !ip.is_empty());
        settings
    }

    pub fn leader_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.leader_poll_interval, self.leader_poll_max_attempts)
    }

    pub fn lock_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.lock_retry_interval, self.lock_retry_interval * 8, self.lock_max_attempts)
    }

    pub fn sharding_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.sharding_wait_interval, self.sharding_wait_max_attempts)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_config_default() {
        let cfg = JobConfig::default();
        assert_eq!(cfg.sharding_total_count, 1);
        assert!(cfg.misfire);
        assert!(cfg.monitor_execution);
        assert!(!cfg.failover);
        assert_eq!(cfg.sharding_strategy, "AVG_ALLOCATION");
    }

    #[test]
    fn validate_rejects_zero_items() {
        let cfg = JobConfig::new("orders", "0/5 * * * * ?", 0);
        assert!(matches!(cfg.validate(), Err(JobMeshError::InvalidConfig { .. })));
    }

    #[test]
    fn validate_rejects_unknown_strategy() {
        let cfg = JobConfig::new("orders", "0/5 * * * * ?", 3).with_strategy("HASH_RING");
        assert!(matches!(cfg.validate(), Err(JobMeshError::UnknownStrategy { .. })));
    }

    #[test]
    fn item_parameters_parse() {
        let cfg = JobConfig::new("orders", "0/5 * * * * ?", 3).with_item_parameters("0=Beijing, 1=Shanghai,2=");
        let params = cfg.item_parameters().unwrap();
        assert_eq!(params[&0], "Beijing");
        assert_eq!(params[&1], "Shanghai");
        assert_eq!(params[&2], "");
    }

    #[test]
    fn item_parameters_reject_garbage() {
        let cfg = JobConfig::new("orders", "0/5 * * * * ?", 3).with_item_parameters("a=b");
        assert!(cfg.item_parameters().is_err());
        let cfg = JobConfig::new("orders", "0/5 * * * * ?", 3).with_item_parameters("0");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: JobConfig = serde_json::from_str(r#"{"job_name":"orders","cron":"* * * * * ?","sharding_total_count":4}"#).unwrap();
        assert_eq!(cfg.sharding_total_count, 4);
        assert!(cfg.monitor_execution);
    }

    #[test]
    fn settings_policies() {
        let settings = CoordinatorSettings::default();
        assert_eq!(settings.leader_policy().interval, Duration::from_millis(100));
        assert_eq!(settings.lock_policy().max_interval, Duration::from_millis(160));
    }
}
