//! Per-job coordination context
//!
//! Everything one job's services share: identity, store access, settings,
//! the cached configuration and lifecycle flags. Passed explicitly to each
//! service so several jobs can live in one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::instance::JobInstance;
use crate::config::{CoordinatorSettings, JobConfig};
use crate::runtime::ShutdownSignal;
use crate::storage::{JobNodePath, JobNodeStorage};
use crate::store::CoordinatorStore;

pub struct JobContext {
    instance: JobInstance,
    storage: JobNodeStorage,
    settings: CoordinatorSettings,
    shutdown: ShutdownSignal,
    config: RwLock<JobConfig>,
    paused: AtomicBool,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        config: JobConfig,
        settings: CoordinatorSettings,
        instance: JobInstance,
    ) -> Self {
        Self {
            instance,
            storage: JobNodeStorage::new(store, &config.job_name),
            settings,
            shutdown: ShutdownSignal::new(),
            config: RwLock::new(config),
            paused: AtomicBool::new(false),
        }
    }

    pub fn job_name(&self) -> &str {
        self.storage.nodes().job_name()
    }

    pub fn instance(&self) -> &JobInstance {
        &self.instance
    }

    pub fn storage(&self) -> &JobNodeStorage {
        &self.storage
    }

    pub fn nodes(&self) -> &JobNodePath {
        self.storage.nodes()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Cached configuration
    pub fn config(&self) -> JobConfig {
        self.config.read().clone()
    }

    /// Swap the cached configuration, returning the previous one
    pub fn replace_config(&self, config: JobConfig) -> JobConfig {
        std::mem::replace(&mut *self.config.write(), config)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
