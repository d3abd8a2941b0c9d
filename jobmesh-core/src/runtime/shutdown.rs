//! Graceful shutdown handling
//!
//! Watch-based shutdown signalling. Blocking coordination loops race their
//! sleeps against [`ShutdownSignal::cancelled`] so a stopping job never
//! waits out a full poll budget.

use std::sync::Arc;
use tokio::sync::watch;

/// Shutdown signal shared by every component of one job
///
/// Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown; idempotent
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives as long as self, so this only errors on drop
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
