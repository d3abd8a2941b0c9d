//! Job-scoped access to the coordination store

use std::sync::Arc;

use tokio::sync::mpsc;

use super::node_path::JobNodePath;
use crate::error::{JobMeshError, Result};
use crate::store::{CoordinatorStore, NodeMode, TreeEvent, TxnOp};

/// Store client that resolves relative node names against one job root
#[derive(Clone)]
pub struct JobNodeStorage {
    store: Arc<dyn CoordinatorStore>,
    nodes: JobNodePath,
}

impl JobNodeStorage {
    pub fn new(store: Arc<dyn CoordinatorStore>, job_name: &str) -> Self {
        Self {
            store,
            nodes: JobNodePath::new(job_name),
        }
    }

    pub fn nodes(&self) -> &JobNodePath {
        &self.nodes
    }

    pub fn store(&self) -> &Arc<dyn CoordinatorStore> {
        &self.store
    }

    pub async fn is_node_existed(&self, node: &str) -> Result<bool> {
        self.store.exists(&self.nodes.full_path(node)).await
    }

    pub async fn get_data(&self, node: &str) -> Result<Option<String>> {
        self.store.get(&self.nodes.full_path(node)).await
    }

    /// Child names in lexical order; empty when the node is missing
    pub async fn children(&self, node: &str) -> Result<Vec<String>> {
        self.store.children(&self.nodes.full_path(node)).await
    }

    /// Create an empty persistent node unless it exists
    pub async fn create_if_needed(&self, node: &str) -> Result<()> {
        match self.store.create(&self.nodes.full_path(node), "", NodeMode::Persistent).await {
            Ok(()) | Err(JobMeshError::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Atomically create an ephemeral node; `false` if it already exists
    pub async fn try_create_ephemeral(&self, node: &str, value: &str) -> Result<bool> {
        match self.store.create(&self.nodes.full_path(node), value, NodeMode::Ephemeral).await {
            Ok(()) => Ok(true),
            Err(JobMeshError::NodeExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create or overwrite a persistent node
    pub async fn fill(&self, node: &str, value: &str) -> Result<()> {
        self.store.put(&self.nodes.full_path(node), value, NodeMode::Persistent).await
    }

    /// Create or overwrite an ephemeral node owned by this session
    pub async fn fill_ephemeral(&self, node: &str, value: &str) -> Result<()> {
        self.store.put(&self.nodes.full_path(node), value, NodeMode::Ephemeral).await
    }

    pub async fn remove_if_exists(&self, node: &str) -> Result<bool> {
        self.store.delete(&self.nodes.full_path(node)).await
    }

    pub async fn commit(&self, ops: Vec<TxnOp>) -> Result<()> {
        self.store.commit(ops).await
    }

    pub fn put_op(&self, node: &str, value: &str) -> TxnOp {
        TxnOp::Put {
            path: self.nodes.full_path(node),
            value: value.to_string(),
            mode: NodeMode::Persistent,
        }
    }

    pub fn delete_op(&self, node: &str) -> TxnOp {
        TxnOp::DeleteIfExists {
            path: self.nodes.full_path(node),
        }
    }

    /// Watch the whole job subtree
    pub fn watch(&self) -> Result<mpsc::UnboundedReceiver<TreeEvent>> {
        self.store.watch(self.nodes.root())
    }
}
