// src/storage/storage_mod.rs
// Node Store - durable node records plus the parent -> children index
// Multi-backend persistence behind `StorageAdapter`, with per-node write serialization

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error_mod::{EngineError, EngineResult};
use crate::node_mod::{DeletePolicy, Node, NodeId};

/// Storage errors with detailed context
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Transient backend failure: {backend} - {error}")]
    Transient { backend: String, error: String },

    #[error("Backend error: {backend} - {error}")]
    BackendError { backend: String, error: String },

    #[error("Serialization error: {error}")]
    SerializationError { error: String },

    #[error("Database unavailable: {reason}")]
    DatabaseUnavailable { reason: String },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    /// Failures that leave the backend unusable for writes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Transient { .. } | StorageError::BackendError { .. } | StorageError::DatabaseUnavailable { .. }
        )
    }
}

/// Index key of the root list in the child index.
pub const ROOT_KEY: &str = "root";

pub fn parent_key(parent: Option<&NodeId>) -> String {
    match parent {
        Some(id) => id.to_string(),
        None => ROOT_KEY.to_string(),
    }
}

/// One mutation inside a transactional batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutNode(Node),
    RemoveNode(NodeId),
    LinkChild { parent: Option<NodeId>, child: NodeId },
    UnlinkChild { parent: Option<NodeId>, child: NodeId },
}

/// Node records and the index entries that reference them, applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, node: Node) -> Self {
        self.ops.push(WriteOp::PutNode(node));
        self
    }

    pub fn remove(mut self, id: NodeId) -> Self {
        self.ops.push(WriteOp::RemoveNode(id));
        self
    }

    pub fn link(mut self, parent: Option<NodeId>, child: NodeId) -> Self {
        self.ops.push(WriteOp::LinkChild { parent, child });
        self
    }

    pub fn unlink(mut self, parent: Option<NodeId>, child: NodeId) -> Self {
        self.ops.push(WriteOp::UnlinkChild { parent, child });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub backend: String,
    pub total_nodes: u64,
    pub nodes_by_kind: HashMap<String, u64>,
    pub draft_nodes: u64,
    pub storage_size_bytes: u64,
    pub operations_total: u64,
    pub retries_total: u64,
    pub errors_total: u64,
    pub degraded: Option<String>,
}

/// Storage adapter trait
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend name used in logs and errors
    fn name(&self) -> &str;

    /// Initialize the storage backend
    async fn initialize(&mut self) -> Result<(), StorageError>;

    /// Check if the backend is healthy
    async fn health_check(&self) -> Result<(), StorageError>;

    /// Load a single node record
    async fn load_node(&self, id: &NodeId) -> Result<Option<Node>, StorageError>;

    /// Ordered child ids of `parent` (`None` = roots)
    async fn load_children(&self, parent: Option<&NodeId>) -> Result<Vec<NodeId>, StorageError>;

    /// Apply a batch atomically
    async fn apply(&self, batch: &WriteBatch) -> Result<(), StorageError>;

    /// Get storage statistics
    async fn get_stats(&self) -> Result<StorageStats, StorageError>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    nodes: HashMap<NodeId, Node>,
    children: HashMap<String, Vec<NodeId>>,
}

/// In-memory adapter used as the default backend and in unit tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdapter {
    inner: Arc<RwLock<MemoryTables>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&mut self) -> Result<(), StorageError> {
        // Nothing to initialize for in-memory store
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_node(&self, id: &NodeId) -> Result<Option<Node>, StorageError> {
        let tables = self.inner.read().await;
        Ok(tables.nodes.get(id).cloned())
    }

    async fn load_children(&self, parent: Option<&NodeId>) -> Result<Vec<NodeId>, StorageError> {
        let tables = self.inner.read().await;
        Ok(tables.children.get(&parent_key(parent)).cloned().unwrap_or_default())
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let mut tables = self.inner.write().await;
        for op in &batch.ops {
            match op {
                WriteOp::PutNode(node) => {
                    tables.nodes.insert(node.id, node.clone());
                }
                WriteOp::RemoveNode(id) => {
                    tables.nodes.remove(id);
                    tables.children.remove(&id.to_string());
                }
                WriteOp::LinkChild { parent, child } => {
                    let list = tables.children.entry(parent_key(parent.as_ref())).or_default();
                    if !list.contains(child) {
                        list.push(*child);
                    }
                }
                WriteOp::UnlinkChild { parent, child } => {
                    let key = parent_key(parent.as_ref());
                    if let Some(list) = tables.children.get_mut(&key) {
                        list.retain(|c| c != child);
                        if list.is_empty() {
                            tables.children.remove(&key);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let tables = self.inner.read().await;
        let mut by_kind: HashMap<String, u64> = HashMap::new();
        let mut size: u64 = 0;
        let mut drafts = 0;
        for node in tables.nodes.values() {
            *by_kind.entry(node.kind.to_string()).or_insert(0) += 1;
            if node.is_draft {
                drafts += 1;
            }
            if let Ok(bytes) = serde_json::to_vec(node) {
                size += bytes.len() as u64;
            }
        }
        Ok(StorageStats {
            backend: self.name().to_string(),
            total_nodes: tables.nodes.len() as u64,
            nodes_by_kind: by_kind,
            draft_nodes: drafts,
            storage_size_bytes: size,
            ..StorageStats::default()
        })
    }
}

/// Retry policy for transient backend failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Default)]
struct StoreMetrics {
    operations_total: AtomicU64,
    retries_total: AtomicU64,
    errors_total: AtomicU64,
}

/// Per-node mutex guards, always acquired in ascending id order.
pub struct NodeLocks {
    guards: Vec<(NodeId, OwnedMutexGuard<()>)>,
}

impl NodeLocks {
    pub fn covers(&self, id: &NodeId) -> bool {
        self.guards.iter().any(|(locked, _)| locked == id)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl std::fmt::Debug for NodeLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.guards.iter().map(|(id, _)| id)).finish()
    }
}

/// Nodes removed or moved by a delete, in the order they were processed.
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    /// Deepest nodes first; the deleted node itself is last.
    pub removed: Vec<Node>,
    /// Children moved by `ReparentTo`, with their new version.
    pub reparented: Vec<Node>,
}

const LOCK_TABLE_PRUNE_THRESHOLD: usize = 256;

/// The single writer over the persisted tree.
pub struct NodeStore {
    adapter: Box<dyn StorageAdapter>,
    node_locks: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
    topology: RwLock<()>,
    retry: RetryPolicy,
    degraded: RwLock<Option<String>>,
    metrics: StoreMetrics,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("backend", &self.adapter.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl NodeStore {
    /// Initialize the adapter and wrap it.
    pub async fn open(mut adapter: Box<dyn StorageAdapter>, retry: RetryPolicy) -> EngineResult<Self> {
        adapter.initialize().await.map_err(|e| StorageError::BackendError {
            backend: adapter.name().to_string(),
            error: format!("Initialization failed: {}", e),
        })?;
        tracing::info!(backend = adapter.name(), "node store opened");
        Ok(Self {
            adapter,
            node_locks: Mutex::new(HashMap::new()),
            topology: RwLock::new(()),
            retry,
            degraded: RwLock::new(None),
            metrics: StoreMetrics::default(),
        })
    }

    pub async fn in_memory() -> EngineResult<Self> {
        Self::open(Box::new(MemoryAdapter::new()), RetryPolicy::default()).await
    }

    pub fn backend(&self) -> &str {
        self.adapter.name()
    }

    /// Reason the store stopped accepting writes, if it did.
    pub async fn degraded(&self) -> Option<String> {
        self.degraded.read().await.clone()
    }

    pub async fn health_check(&self) -> EngineResult<()> {
        self.adapter.health_check().await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> EngineResult<StorageStats> {
        let mut stats = self.with_retry("stats", || self.adapter.get_stats()).await?;
        stats.operations_total = self.metrics.operations_total.load(Ordering::Relaxed);
        stats.retries_total = self.metrics.retries_total.load(Ordering::Relaxed);
        stats.errors_total = self.metrics.errors_total.load(Ordering::Relaxed);
        stats.degraded = self.degraded().await;
        Ok(stats)
    }

    // Reads

    pub async fn find(&self, id: &NodeId) -> EngineResult<Option<Node>> {
        self.metrics.operations_total.fetch_add(1, Ordering::Relaxed);
        Ok(self.with_retry("load_node", || self.adapter.load_node(id)).await?)
    }

    pub async fn get(&self, id: &NodeId) -> EngineResult<Node> {
        self.find(id).await?.ok_or_else(|| EngineError::node_not_found(id))
    }

    pub async fn child_ids(&self, parent: Option<&NodeId>) -> EngineResult<Vec<NodeId>> {
        self.metrics.operations_total.fetch_add(1, Ordering::Relaxed);
        Ok(self.with_retry("load_children", || self.adapter.load_children(parent)).await?)
    }

    /// Children in insertion order, keyed children first when sort keys are set.
    pub async fn get_children(&self, parent: Option<&NodeId>) -> EngineResult<Vec<Node>> {
        if let Some(parent) = parent {
            self.get(parent).await?;
        }
        let mut children = Vec::new();
        for id in self.child_ids(parent).await? {
            match self.find(&id).await? {
                Some(node) => children.push(node),
                None => tracing::warn!(parent = %parent_key(parent), child = %id, "child index points at a missing node"),
            }
        }
        children.sort_by_key(|n| (n.sort_key.is_none(), n.sort_key));
        Ok(children)
    }

    /// Every node below `id`, breadth-first, excluding `id`.
    pub async fn subtree_ids(&self, id: &NodeId) -> EngineResult<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([*id]);
        let mut queue = VecDeque::from([*id]);
        while let Some(current) = queue.pop_front() {
            for child in self.child_ids(Some(&current)).await? {
                if seen.insert(child) {
                    out.push(child);
                    queue.push_back(child);
                }
            }
        }
        Ok(out)
    }

    // Locking

    /// Serializes shape changes (insert, move, delete).
    pub async fn topology_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.topology.write().await
    }

    pub async fn topology_read(&self) -> RwLockReadGuard<'_, ()> {
        self.topology.read().await
    }

    pub async fn lock(&self, ids: &[NodeId]) -> NodeLocks {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mutexes: Vec<(NodeId, Arc<Mutex<()>>)> = {
            let mut table = self.node_locks.lock().await;
            if table.len() > LOCK_TABLE_PRUNE_THRESHOLD {
                table.retain(|_, m| Arc::strong_count(m) > 1);
            }
            ids.iter()
                .map(|id| (*id, table.entry(*id).or_default().clone()))
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for (id, mutex) in mutexes {
            guards.push((id, mutex.lock_owned().await));
        }
        NodeLocks { guards }
    }

    // Writes

    /// Compare-and-swap on `version`.
    pub async fn put(&self, node: Node, expected_version: u64) -> EngineResult<Node> {
        let locks = self.lock(&[node.id]).await;
        self.put_locked(&locks, node, expected_version).await
    }

    pub async fn put_locked(&self, locks: &NodeLocks, node: Node, expected_version: u64) -> EngineResult<Node> {
        require_lock(locks, &node.id)?;
        let current = self.get(&node.id).await?;
        if current.version != expected_version {
            return Err(EngineError::VersionConflict {
                id: node.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        if current.parent_id != node.parent_id {
            return Err(EngineError::invalid("parent changes must go through move"));
        }
        if current.kind != node.kind {
            return Err(EngineError::invalid("node kind cannot change"));
        }

        let mut next = node;
        next.version = expected_version + 1;
        next.created_at = current.created_at;
        next.updated_at = Utc::now();
        self.write(WriteBatch::new().put(next.clone())).await?;
        tracing::debug!(node = %next.id, version = next.version, "node stored");
        Ok(next)
    }

    /// Persist a new node and link it into its parent's child list.
    /// Callers hold the topology write guard.
    pub async fn insert(&self, node: Node) -> EngineResult<Node> {
        if self.find(&node.id).await?.is_some() {
            return Err(EngineError::invalid(format!("node {} already exists", node.id)));
        }
        if let Some(parent) = &node.parent_id {
            self.get(parent).await?;
        }
        let batch = WriteBatch::new().put(node.clone()).link(node.parent_id, node.id);
        self.write(batch).await?;
        tracing::debug!(node = %node.id, parent = %parent_key(node.parent_id.as_ref()), "node inserted");
        Ok(node)
    }

    /// Move `id` to the end of `new_parent`'s child list and bump its version.
    /// Cycle checks are the caller's job; callers hold the topology write guard.
    pub async fn reparent_locked(&self, locks: &NodeLocks, id: &NodeId, new_parent: Option<NodeId>) -> EngineResult<Node> {
        require_lock(locks, id)?;
        let current = self.get(id).await?;
        if let Some(parent) = &new_parent {
            self.get(parent).await?;
        }
        let mut next = current.clone();
        next.parent_id = new_parent;
        next.version = current.version + 1;
        next.updated_at = Utc::now();
        let batch = WriteBatch::new()
            .unlink(current.parent_id, *id)
            .link(new_parent, *id)
            .put(next.clone());
        self.write(batch).await?;
        Ok(next)
    }

    /// Delete with an explicit policy for the descendants.
    pub async fn delete(&self, id: &NodeId, policy: DeletePolicy) -> EngineResult<DeleteOutcome> {
        let _topology = self.topology_write().await;
        let affected = self.delete_lock_set(id, policy).await?;
        let locks = self.lock(&affected).await;
        self.delete_locked(&locks, id, policy).await
    }

    /// Ids whose locks `delete_locked` needs.
    pub async fn delete_lock_set(&self, id: &NodeId, policy: DeletePolicy) -> EngineResult<Vec<NodeId>> {
        self.get(id).await?;
        let mut ids = vec![*id];
        match policy {
            DeletePolicy::Cascade => ids.extend(self.subtree_ids(id).await?),
            DeletePolicy::ReparentTo { .. } => ids.extend(self.child_ids(Some(id)).await?),
        }
        Ok(ids)
    }

    pub async fn delete_locked(&self, locks: &NodeLocks, id: &NodeId, policy: DeletePolicy) -> EngineResult<DeleteOutcome> {
        require_lock(locks, id)?;
        let target = self.get(id).await?;
        let mut outcome = DeleteOutcome::default();
        let mut batch = WriteBatch::new();

        match policy {
            DeletePolicy::Cascade => {
                let mut doomed = self.subtree_ids(id).await?;
                doomed.reverse();
                for child in &doomed {
                    require_lock(locks, child)?;
                    if let Some(node) = self.find(child).await? {
                        batch = batch.remove(*child);
                        outcome.removed.push(node);
                    }
                }
            }
            DeletePolicy::ReparentTo { parent_id } => {
                if parent_id == Some(*id) {
                    return Err(EngineError::Cycle { id: *id, new_parent: *id });
                }
                if let Some(parent) = &parent_id {
                    self.get(parent).await?;
                }
                let now = Utc::now();
                for child in self.child_ids(Some(id)).await? {
                    require_lock(locks, &child)?;
                    let Some(mut node) = self.find(&child).await? else {
                        continue;
                    };
                    node.parent_id = parent_id;
                    node.version += 1;
                    node.updated_at = now;
                    batch = batch.unlink(Some(*id), child).link(parent_id, child).put(node.clone());
                    outcome.reparented.push(node);
                }
            }
        }

        batch = batch.unlink(target.parent_id, *id).remove(*id);
        outcome.removed.push(target);
        self.write(batch).await?;
        tracing::debug!(
            node = %id,
            removed = outcome.removed.len(),
            reparented = outcome.reparented.len(),
            "node deleted"
        );
        Ok(outcome)
    }

    // Private helper methods

    async fn write(&self, batch: WriteBatch) -> EngineResult<()> {
        if let Some(reason) = self.degraded().await {
            return Err(EngineError::Degraded { reason });
        }
        self.metrics.operations_total.fetch_add(1, Ordering::Relaxed);
        match self.with_retry("apply", || self.adapter.apply(&batch)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                let reason = format!("{} backend failed: {}", self.adapter.name(), e);
                tracing::error!(backend = self.adapter.name(), error = %e, "storage failure, switching to read-only mode");
                *self.degraded.write().await = Some(reason.clone());
                Err(EngineError::Degraded { reason })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut attempt: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    self.metrics.retries_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(op, error = %e, retry = retries, "transient storage failure, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) => {
                    self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }
}

fn require_lock(locks: &NodeLocks, id: &NodeId) -> EngineResult<()> {
    if locks.covers(id) {
        Ok(())
    } else {
        Err(EngineError::invalid(format!("node {} is not locked by this operation", id)))
    }
}
