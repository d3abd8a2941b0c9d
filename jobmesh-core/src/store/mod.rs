//! Coordination store client interface
//!
//! The kernel only talks to the shared hierarchical store through
//! [`CoordinatorStore`]. A session-backed client provides atomic node
//! operations, ephemeral nodes, transactional batches and subtree watches.

pub mod lock;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

pub use lock::{DistributedLock, LockGuard};
pub use memory::{MemorySession, MemoryStore};

/// Lifetime of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

/// Kind of change delivered by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEventKind {
    Added,
    Updated,
    Deleted,
}

/// Change notification for a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEvent {
    pub kind: TreeEventKind,
    /// Absolute path of the changed node
    pub path: String,
    /// New value; the last known value for deletions
    pub value: Option<String>,
}

impl TreeEvent {
    pub fn new(kind: TreeEventKind, path: impl Into<String>, value: Option<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            value,
        }
    }
}

/// Client connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection dropped; the session may still be alive
    Suspended,
    /// Session expired; ephemeral nodes are gone
    Lost,
    /// Connection re-established, possibly with a fresh session
    Reconnected,
}

/// One step of an all-or-nothing batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Fails the batch if the node exists
    Create {
        path: String,
        value: String,
        mode: NodeMode,
    },
    /// Fails the batch if the node is missing
    Update { path: String, value: String },
    /// Create or overwrite
    Put {
        path: String,
        value: String,
        mode: NodeMode,
    },
    /// Fails the batch if the node is missing
    Delete { path: String },
    /// Delete when present, no-op otherwise
    DeleteIfExists { path: String },
}

/// Session-backed client for the shared coordination store
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// Identifier of the current session
    fn session_id(&self) -> u64;

    /// Atomically create a node; missing parents are created as persistent nodes
    async fn create(&self, path: &str, value: &str, mode: NodeMode) -> Result<()>;

    /// Replace the value of an existing node
    async fn update(&self, path: &str, value: &str) -> Result<()>;

    /// Create the node or replace its value
    async fn put(&self, path: &str, value: &str, mode: NodeMode) -> Result<()>;

    /// Read a node value; `None` when the node does not exist
    async fn get(&self, path: &str) -> Result<Option<String>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of direct children in lexical order
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a node and its subtree; returns whether anything was removed
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Apply every operation or none of them
    async fn commit(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Subscribe to changes of every node at or below `prefix`
    fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<TreeEvent>>;

    /// Subscribe to connection state transitions
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;
}
