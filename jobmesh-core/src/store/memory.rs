//! In-process coordination store
//!
//! A single shared tree with session-scoped ephemeral nodes and prefix
//! watches. Every mutation and its notifications happen under one lock,
//! so watchers observe changes in commit order. Sessions can be expired or
//! interrupted to exercise crash and reconnect paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{ConnectionState, CoordinatorStore, NodeMode, TreeEvent, TreeEventKind, TxnOp};
use crate::error::{JobMeshError, Result};

#[derive(Debug, Clone)]
struct Node {
    value: String,
    mode: NodeMode,
    owner: u64,
}

#[derive(Debug, Clone, Default)]
struct NodeTable {
    nodes: BTreeMap<String, Node>,
}

impl NodeTable {
    fn contains(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn ensure_parents(&mut self, path: &str, session: u64, events: &mut Vec<TreeEvent>) {
        let mut end = 0;
        while let Some(idx) = path[end + 1..].find('/') {
            end += idx + 1;
            let ancestor = &path[..end];
            if !self.nodes.contains_key(ancestor) {
                self.nodes.insert(
                    ancestor.to_string(),
                    Node {
                        value: String::new(),
                        mode: NodeMode::Persistent,
                        owner: session,
                    },
                );
                events.push(TreeEvent::new(TreeEventKind::Added, ancestor, Some(String::new())));
            }
        }
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        let mut keys: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if self.nodes.contains_key(path) {
            keys.push(path.to_string());
        }
        // deepest first
        keys.sort_by(|a, b| b.matches('/').count().cmp(&a.matches('/').count()).then(b.cmp(a)));
        keys
    }

    fn remove_subtree(&mut self, path: &str, events: &mut Vec<TreeEvent>) -> bool {
        let keys = self.subtree(path);
        for key in &keys {
            if let Some(node) = self.nodes.remove(key) {
                events.push(TreeEvent::new(TreeEventKind::Deleted, key.clone(), Some(node.value)));
            }
        }
        !keys.is_empty()
    }

    fn apply(&mut self, op: &TxnOp, session: u64, events: &mut Vec<TreeEvent>) -> Result<()> {
        match op {
            TxnOp::Create { path, value, mode } => {
                validate_path(path)?;
                if self.contains(path) {
                    return Err(JobMeshError::NodeExists { path: path.clone() });
                }
                self.ensure_parents(path, session, events);
                self.nodes.insert(
                    path.clone(),
                    Node {
                        value: value.clone(),
                        mode: *mode,
                        owner: session,
                    },
                );
                events.push(TreeEvent::new(TreeEventKind::Added, path.clone(), Some(value.clone())));
            }
            TxnOp::Update { path, value } => {
                let node = self
                    .nodes
                    .get_mut(path)
                    .ok_or_else(|| JobMeshError::NoNode { path: path.clone() })?;
                node.value = value.clone();
                events.push(TreeEvent::new(TreeEventKind::Updated, path.clone(), Some(value.clone())));
            }
            TxnOp::Put { path, value, mode } => {
                validate_path(path)?;
                let kind = if self.nodes.contains_key(path) {
                    TreeEventKind::Updated
                } else {
                    self.ensure_parents(path, session, events);
                    TreeEventKind::Added
                };
                self.nodes.insert(
                    path.clone(),
                    Node {
                        value: value.clone(),
                        mode: *mode,
                        owner: session,
                    },
                );
                events.push(TreeEvent::new(kind, path.clone(), Some(value.clone())));
            }
            TxnOp::Delete { path } => {
                if !self.remove_subtree(path, events) {
                    return Err(JobMeshError::NoNode { path: path.clone() });
                }
            }
            TxnOp::DeleteIfExists { path } => {
                self.remove_subtree(path, events);
            }
        }
        Ok(())
    }

    fn ephemerals_of(&self, session: u64) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.mode == NodeMode::Ephemeral && n.owner == session)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(JobMeshError::Internal {
            message: format!("invalid node path '{}'", path),
        });
    }
    Ok(())
}

struct Watcher {
    client_id: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<TreeEvent>,
}

impl Watcher {
    fn matches(&self, path: &str) -> bool {
        path == self.prefix
            || self.prefix == "/"
            || (path.starts_with(&self.prefix) && path[self.prefix.len()..].starts_with('/'))
    }
}

#[derive(Default)]
struct Tree {
    table: NodeTable,
    watchers: Vec<Watcher>,
}

impl Tree {
    fn publish(&mut self, events: Vec<TreeEvent>) {
        for event in events {
            self.watchers
                .retain(|w| !w.matches(&event.path) || w.tx.send(event.clone()).is_ok());
        }
    }

    fn expire_ephemerals(&mut self, session: u64) -> usize {
        let mut events = Vec::new();
        let paths = self.table.ephemerals_of(session);
        for path in &paths {
            self.table.remove_subtree(path, &mut events);
        }
        self.publish(events);
        paths.len()
    }
}

/// Shared in-process tree; hand out one [`MemorySession`] per participant
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session
    pub fn connect(&self) -> MemorySession {
        let (events, _) = broadcast::channel(16);
        let session = MemorySession {
            store: self.clone(),
            client_id: self.allocate_id(),
            session_id: AtomicU64::new(self.allocate_id()),
            state: Mutex::new(SessionState::Connected),
            events,
        };
        debug!("Opened memory session {}", session.session_id());
        session
    }

    /// Copy of every node value at or below `prefix`
    pub fn snapshot(&self, prefix: &str) -> BTreeMap<String, String> {
        let tree = self.tree.lock();
        tree.table
            .nodes
            .iter()
            .filter(|(k, _)| k.as_str() == prefix || k.starts_with(&format!("{}/", prefix)))
            .map(|(k, n)| (k.clone(), n.value.clone()))
            .collect()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Suspended,
    Expired,
}

/// One participant's connection to a [`MemoryStore`]
pub struct MemorySession {
    store: MemoryStore,
    client_id: u64,
    session_id: AtomicU64,
    state: Mutex<SessionState>,
    events: broadcast::Sender<ConnectionState>,
}

impl MemorySession {
    /// Simulate a crash: the session ends, its ephemeral nodes disappear
    /// and its watches stop. Every later call fails.
    pub fn expire(&self) {
        let session = self.session_id();
        {
            let mut tree = self.store.tree.lock();
            let removed = tree.expire_ephemerals(session);
            tree.watchers.retain(|w| w.client_id != self.client_id);
            debug!("Expired session {} ({} ephemeral nodes removed)", session, removed);
        }
        *self.state.lock() = SessionState::Expired;
        let _ = self.events.send(ConnectionState::Lost);
    }

    /// Simulate a dropped connection; calls fail until [`restore`](Self::restore)
    pub fn interrupt(&self) {
        *self.state.lock() = SessionState::Suspended;
        let _ = self.events.send(ConnectionState::Suspended);
    }

    /// Re-establish the connection. With `session_lost` the old session's
    /// ephemeral nodes are removed and a fresh session id is issued.
    pub fn restore(&self, session_lost: bool) {
        if session_lost {
            let old = self.session_id();
            self.store.tree.lock().expire_ephemerals(old);
            let _ = self.events.send(ConnectionState::Lost);
            self.session_id.store(self.store.allocate_id(), Ordering::SeqCst);
        }
        *self.state.lock() = SessionState::Connected;
        let _ = self.events.send(ConnectionState::Reconnected);
    }

    fn live(&self) -> Result<u64> {
        match *self.state.lock() {
            SessionState::Connected => Ok(self.session_id()),
            SessionState::Suspended => Err(JobMeshError::ConnectionLoss),
            SessionState::Expired => Err(JobMeshError::SessionExpired {
                session_id: self.session_id(),
            }),
        }
    }

    fn apply(&self, op: TxnOp) -> Result<()> {
        let session = self.live()?;
        let mut tree = self.store.tree.lock();
        let mut events = Vec::new();
        tree.table.apply(&op, session, &mut events)?;
        tree.publish(events);
        Ok(())
    }
}

#[async_trait]
impl CoordinatorStore for MemorySession {
    fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    async fn create(&self, path: &str, value: &str, mode: NodeMode) -> Result<()> {
        self.apply(TxnOp::Create {
            path: path.into(),
            value: value.into(),
            mode,
        })
    }

    async fn update(&self, path: &str, value: &str) -> Result<()> {
        self.apply(TxnOp::Update {
            path: path.into(),
            value: value.into(),
        })
    }

    async fn put(&self, path: &str, value: &str, mode: NodeMode) -> Result<()> {
        self.apply(TxnOp::Put {
            path: path.into(),
            value: value.into(),
            mode,
        })
    }

    async fn get(&self, path: &str) -> Result<Option<String>> {
        self.live()?;
        Ok(self.store.tree.lock().table.nodes.get(path).map(|n| n.value.clone()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.live()?;
        Ok(self.store.tree.lock().table.contains(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.live()?;
        let tree = self.store.tree.lock();
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        Ok(tree
            .table
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let _ = self.live()?;
        let mut tree = self.store.tree.lock();
        let mut events = Vec::new();
        let removed = tree.table.remove_subtree(path, &mut events);
        tree.publish(events);
        Ok(removed)
    }

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<()> {
        let session = self.live()?;
        let mut tree = self.store.tree.lock();
        let mut staged = tree.table.clone();
        let mut events = Vec::new();
        for op in &ops {
            if let Err(e) = staged.apply(op, session, &mut events) {
                let path = match op {
                    TxnOp::Create { path, .. }
                    | TxnOp::Update { path, .. }
                    | TxnOp::Put { path, .. }
                    | TxnOp::Delete { path }
                    | TxnOp::DeleteIfExists { path } => path.clone(),
                };
                return Err(JobMeshError::TransactionRejected {
                    path,
                    reason: e.to_string(),
                });
            }
        }
        tree.table = staged;
        tree.publish(events);
        Ok(())
    }

    fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<TreeEvent>> {
        self.live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.store.tree.lock().watchers.push(Watcher {
            client_id: self.client_id,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }
}
