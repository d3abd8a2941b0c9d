//! Distributed mutual exclusion over ephemeral nodes
//!
//! The lock is a single ephemeral node holding the owner id. Creating it is
//! the acquisition; contenders back off and retry. A holder that crashes
//! releases the lock when its session ends.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{CoordinatorStore, NodeMode};
use crate::error::{JobMeshError, Result};
use crate::runtime::{RetryPolicy, ShutdownSignal};

/// Lock recipe bound to one latch path
pub struct DistributedLock {
    store: Arc<dyn CoordinatorStore>,
    path: String,
    owner: String,
    policy: RetryPolicy,
}

impl DistributedLock {
    /// `latch` is the parent node; the lock lives at `{latch}/lock`
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        latch: &str,
        owner: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            path: format!("{}/lock", latch),
            owner: owner.into(),
            policy,
        }
    }

    /// Block (bounded) until the lock is held
    ///
    /// Returns [`JobMeshError::Interrupted`] when shutdown fires and
    /// [`JobMeshError::LockTimeout`] when the retry budget runs out.
    pub async fn acquire(&self, shutdown: &ShutdownSignal) -> Result<LockGuard> {
        for attempt in 0..=self.policy.max_attempts {
            if shutdown.is_shutdown() {
                break;
            }
            match self.store.create(&self.path, &self.owner, NodeMode::Ephemeral).await {
                Ok(()) => {
                    debug!("Lock {} acquired by {}", self.path, self.owner);
                    return Ok(LockGuard {
                        store: self.store.clone(),
                        path: self.path.clone(),
                        owner: self.owner.clone(),
                        released: false,
                    });
                }
                Err(JobMeshError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
            if attempt == self.policy.max_attempts {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.policy.delay(attempt)) => {}
            }
        }

        if shutdown.is_shutdown() {
            return Err(JobMeshError::Interrupted {
                operation: format!("acquiring {}", self.path),
            });
        }
        Err(JobMeshError::LockTimeout {
            path: self.path.clone(),
            attempts: self.policy.max_attempts + 1,
        })
    }
}

/// Held lock; call [`release`](Self::release) when done
pub struct LockGuard {
    store: Arc<dyn CoordinatorStore>,
    path: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Delete the lock node if this guard still owns it
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_owned(self.store.as_ref(), &self.path, &self.owner).await
    }
}

async fn release_owned(store: &dyn CoordinatorStore, path: &str, owner: &str) -> Result<()> {
    if store.get(path).await?.as_deref() == Some(owner) {
        store.delete(path).await?;
        debug!("Lock {} released by {}", path, owner);
    }
    Ok(())
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let path = std::mem::take(&mut self.path);
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_owned(store.as_ref(), &path, &owner).await {
                        warn!("Failed to release dropped lock {}: {}", path, e);
                    }
                });
            }
            Err(_) => warn!("Lock {} dropped outside a runtime; relying on session expiry", path),
        }
    }
}
