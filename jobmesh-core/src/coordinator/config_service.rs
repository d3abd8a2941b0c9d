//! Registry copy of the job configuration
//!
//! Layout: one node per field under `config/`, each holding the field's
//! JSON value, plus `config/version` and `config/updated_at`. Writers bump
//! `version` in the same transaction as the fields, so listeners only need
//! to watch that one node.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::context::JobContext;
use crate::config::JobConfig;
use crate::error::{JobMeshError, Result};
use crate::storage::{node_path, JobNodePath};

pub const VERSION_FIELD: &str = "version";
pub const UPDATED_AT_FIELD: &str = "updated_at";

pub struct ConfigService {
    ctx: Arc<JobContext>,
}

impl ConfigService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Publish the local definition at startup
    ///
    /// An existing registry copy wins unless the local definition sets
    /// `overwrite`. Returns the effective configuration, which is also
    /// installed in the local cache.
    pub async fn persist(&self, config: &JobConfig) -> Result<JobConfig> {
        config.validate()?;
        let current = self.version().await?;
        if current.is_none() || config.overwrite {
            self.write(config, current.unwrap_or(0) + 1).await?;
            info!("Published configuration of job {}", config.job_name);
        } else {
            debug!("Keeping registry configuration of job {}", config.job_name);
        }
        let effective = self.load(false).await?;
        self.ctx.replace_config(effective.clone());
        Ok(effective)
    }

    /// Operator update; listeners on every instance pick it up
    pub async fn update(&self, config: &JobConfig) -> Result<()> {
        config.validate()?;
        if config.job_name != self.ctx.job_name() {
            return Err(JobMeshError::InvalidConfig {
                reason: format!("cannot move job {} to {}", self.ctx.job_name(), config.job_name),
            });
        }
        let next = self.version().await?.unwrap_or(0) + 1;
        self.write(config, next).await?;
        info!("Updated configuration of job {} to version {}", config.job_name, next);
        Ok(())
    }

    /// Cached copy, or a fresh read from the registry
    pub async fn load(&self, from_cache: bool) -> Result<JobConfig> {
        if from_cache {
            return Ok(self.ctx.config());
        }
        let storage = self.ctx.storage();
        let fields = storage.children(node_path::CONFIG).await?;
        if fields.is_empty() {
            return Err(JobMeshError::ConfigNotFound {
                job_name: self.ctx.job_name().to_string(),
            });
        }

        let mut map = Map::new();
        for field in fields {
            if field == VERSION_FIELD || field == UPDATED_AT_FIELD {
                continue;
            }
            let node = JobNodePath::config_field_node(&field);
            let Some(raw) = storage.get_data(&node).await? else {
                continue;
            };
            let value: Value = serde_json::from_str(&raw).map_err(|source| JobMeshError::Decode {
                path: self.ctx.nodes().full_path(&node),
                source,
            })?;
            map.insert(field, value);
        }

        serde_json::from_value(Value::Object(map)).map_err(|source| JobMeshError::Decode {
            path: self.ctx.nodes().full_path(node_path::CONFIG),
            source,
        })
    }

    /// Reload from the registry into the cache, returning `(previous, current)`
    pub async fn refresh_cache(&self) -> Result<(JobConfig, JobConfig)> {
        let current = self.load(false).await?;
        let previous = self.ctx.replace_config(current.clone());
        Ok((previous, current))
    }

    pub async fn version(&self) -> Result<Option<u64>> {
        let raw = self
            .ctx
            .storage()
            .get_data(&JobNodePath::config_field_node(VERSION_FIELD))
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    async fn write(&self, config: &JobConfig, version: u64) -> Result<()> {
        let storage = self.ctx.storage();
        let Value::Object(fields) = serde_json::to_value(config).map_err(|source| JobMeshError::Decode {
            path: self.ctx.nodes().full_path(node_path::CONFIG),
            source,
        })?
        else {
            return Err(JobMeshError::Internal {
                message: "job configuration did not serialize to an object".into(),
            });
        };

        let mut ops: Vec<_> = fields
            .iter()
            .map(|(field, value)| storage.put_op(&JobNodePath::config_field_node(field), &value.to_string()))
            .collect();
        ops.push(storage.put_op(
            &JobNodePath::config_field_node(UPDATED_AT_FIELD),
            &Utc::now().to_rfc3339(),
        ));
        ops.push(storage.put_op(&JobNodePath::config_field_node(VERSION_FIELD), &version.to_string()));
        storage.commit(ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorSettings;
    use crate::coordinator::instance::JobInstance;
    use crate::store::{CoordinatorStore, MemoryStore};

    fn service(store: &MemoryStore, config: JobConfig) -> ConfigService {
        let session: Arc<dyn CoordinatorStore> = Arc::new(store.connect());
        let ctx = JobContext::new(session, config, CoordinatorSettings::default(), JobInstance::new("10.0.0.1"));
        ConfigService::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_persist_keeps_existing_unless_overwrite() {
        let store = MemoryStore::new();
        let first = JobConfig::new("orders", "0/5 * * * * ?", 3);
        service(&store, first.clone()).persist(&first).await.unwrap();

        let second = JobConfig::new("orders", "0/5 * * * * ?", 8);
        let effective = service(&store, second.clone()).persist(&second).await.unwrap();
        assert_eq!(effective.sharding_total_count, 3);

        let forced = second.with_overwrite(true);
        let svc = service(&store, forced.clone());
        let effective = svc.persist(&forced).await.unwrap();
        assert_eq!(effective.sharding_total_count, 8);
        assert_eq!(svc.version().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_fields_are_stored_individually() {
        let store = MemoryStore::new();
        let config = JobConfig::new("orders", "0/5 * * * * ?", 4).with_failover(true);
        service(&store, config.clone()).persist(&config).await.unwrap();

        let nodes = store.snapshot("/orders/config");
        assert_eq!(nodes["/orders/config/sharding_total_count"], "4");
        assert_eq!(nodes["/orders/config/failover"], "true");
        assert!(nodes.contains_key("/orders/config/updated_at"));
    }

    #[tokio::test]
    async fn test_load_without_registry_copy() {
        let store = MemoryStore::new();
        let svc = service(&store, JobConfig::new("orders", "* * * * * ?", 1));
        assert!(matches!(svc.load(false).await, Err(JobMeshError::ConfigNotFound { .. })));
    }
}
