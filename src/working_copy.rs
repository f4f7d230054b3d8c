// src/working_copy.rs
// Working-Copy Manager - isolated drafts with optimistic commit/discard
//
// Lifecycle per node: NoDraft -> Open -> {Committed, Discarded}. Both terminal
// states free the node for the next `begin`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::change_bus::{ChangeBus, ChangeEvent, ChangeKind};
use crate::error_mod::{EngineError, EngineResult};
use crate::kind_registry::KindRegistry;
use crate::node_mod::{DeletePolicy, DraftHandle, FieldEdit, Node, NodeId};
use crate::storage::validation_mod::validate_name;
use crate::storage::NodeStore;
use crate::tree_navigator::TreeNavigator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DraftOrigin {
    /// The node was inserted for this draft and has never been committed.
    Creation,
    /// Edit of an already committed node.
    Edit,
}

/// Exclusively owned snapshot of one node plus its pending edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingCopy {
    pub handle: DraftHandle,
    pub node_id: NodeId,
    pub base_version: u64,
    pub origin: DraftOrigin,
    pub snapshot: Node,
    pub changes: Vec<FieldEdit>,
    pub opened_at: DateTime<Utc>,
}

impl WorkingCopy {
    fn open(snapshot: Node, origin: DraftOrigin) -> Self {
        Self {
            handle: DraftHandle::new(),
            node_id: snapshot.id,
            base_version: snapshot.version,
            origin,
            snapshot,
            changes: Vec::new(),
            opened_at: Utc::now(),
        }
    }

    /// The snapshot with every pending edit applied.
    pub fn preview(&self) -> EngineResult<Node> {
        let mut node = self.snapshot.clone();
        apply_all(&mut node, &self.changes)?;
        Ok(node)
    }
}

fn apply_all(node: &mut Node, changes: &[FieldEdit]) -> EngineResult<()> {
    for edit in changes {
        node.apply_edit(edit).map_err(|message| EngineError::Validation {
            field: edit.field.to_string(),
            message,
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub node_id: NodeId,
    pub new_version: u64,
    pub is_draft: bool,
    pub changes: Vec<FieldEdit>,
    /// Change Bus sequence of the published event, if anything was written.
    pub sequence: Option<u64>,
}

#[derive(Debug, Default)]
struct DraftTable {
    by_handle: HashMap<DraftHandle, WorkingCopy>,
    by_node: HashMap<NodeId, DraftHandle>,
}

impl DraftTable {
    fn close(&mut self, handle: &DraftHandle) -> Option<WorkingCopy> {
        let copy = self.by_handle.remove(handle)?;
        self.by_node.remove(&copy.node_id);
        Some(copy)
    }
}

#[derive(Debug)]
pub struct WorkingCopyManager {
    store: Arc<NodeStore>,
    navigator: TreeNavigator,
    bus: Arc<ChangeBus>,
    kinds: Arc<KindRegistry>,
    drafts: Mutex<DraftTable>,
}

impl WorkingCopyManager {
    pub fn new(store: Arc<NodeStore>, bus: Arc<ChangeBus>, kinds: Arc<KindRegistry>) -> Self {
        Self {
            navigator: TreeNavigator::new(store.clone()),
            store,
            bus,
            kinds,
            drafts: Mutex::new(DraftTable::default()),
        }
    }

    /// Open a draft on a committed node. Fails with `Conflict` while another draft is open.
    pub async fn begin(&self, id: &NodeId) -> EngineResult<WorkingCopy> {
        let node = self.store.get(id).await?;
        let mut table = self.drafts.lock().await;
        if let Some(existing) = table.by_node.get(id) {
            return Err(EngineError::Conflict { id: *id, draft: *existing });
        }
        let copy = WorkingCopy::open(node, DraftOrigin::Edit);
        table.by_node.insert(copy.node_id, copy.handle);
        table.by_handle.insert(copy.handle, copy.clone());
        tracing::debug!(node = %id, draft = %copy.handle, base_version = copy.base_version, "draft opened");
        Ok(copy)
    }

    /// Insert `node` flagged as draft and open a creation draft on it.
    pub async fn begin_creation(&self, mut node: Node) -> EngineResult<WorkingCopy> {
        validate_name(&node.name)?;
        self.kinds.validate_schema(&node.kind, &node.payload)?;
        node.version = 1;
        node.is_draft = true;

        let _topology = self.store.topology_write().await;
        if let Some(parent) = node.parent_id {
            self.ensure_committed(&parent, "parentId").await?;
        }
        let stored = self.store.insert(node).await?;
        let copy = WorkingCopy::open(stored, DraftOrigin::Creation);
        let mut table = self.drafts.lock().await;
        table.by_node.insert(copy.node_id, copy.handle);
        table.by_handle.insert(copy.handle, copy.clone());
        tracing::debug!(node = %copy.node_id, draft = %copy.handle, "creation draft opened");
        Ok(copy)
    }

    /// Append one edit. No store access.
    pub async fn apply(&self, handle: &DraftHandle, edit: FieldEdit) -> EngineResult<WorkingCopy> {
        let mut table = self.drafts.lock().await;
        let copy = table
            .by_handle
            .get_mut(handle)
            .ok_or_else(|| EngineError::draft_not_found(handle))?;
        copy.changes.push(edit);
        Ok(copy.clone())
    }

    pub async fn get(&self, handle: &DraftHandle) -> EngineResult<WorkingCopy> {
        let table = self.drafts.lock().await;
        table.by_handle.get(handle).cloned().ok_or_else(|| EngineError::draft_not_found(handle))
    }

    pub async fn draft_for(&self, id: &NodeId) -> Option<DraftHandle> {
        self.drafts.lock().await.by_node.get(id).copied()
    }

    /// Fails with a validation error on `field` while `id` is an uncommitted creation draft.
    /// Callers hold the topology write guard.
    pub async fn ensure_committed(&self, id: &NodeId, field: &str) -> EngineResult<()> {
        let table = self.drafts.lock().await;
        let pending = table
            .by_node
            .get(id)
            .and_then(|handle| table.by_handle.get(handle))
            .is_some_and(|copy| copy.origin == DraftOrigin::Creation);
        if pending {
            return Err(EngineError::Validation {
                field: field.to_string(),
                message: format!("node {} has not been committed yet", id),
            });
        }
        Ok(())
    }

    pub async fn open_drafts(&self) -> Vec<WorkingCopy> {
        let table = self.drafts.lock().await;
        let mut drafts: Vec<_> = table.by_handle.values().cloned().collect();
        drafts.sort_by_key(|d| d.opened_at);
        drafts
    }

    /// Apply the draft if the store is still at its base version.
    ///
    /// A version mismatch closes the draft; validation failures leave it open
    /// so the caller can append corrections.
    pub async fn commit(&self, handle: &DraftHandle) -> EngineResult<CommitResult> {
        let node_id = self.get(handle).await?.node_id;
        let _topology = self.store.topology_read().await;
        let locks = self.store.lock(&[node_id]).await;
        let copy = self.get(handle).await?;

        let Some(current) = self.store.find(&node_id).await? else {
            self.close(handle).await;
            return Err(EngineError::node_not_found(&node_id));
        };
        if current.version != copy.base_version {
            self.close(handle).await;
            tracing::info!(node = %node_id, draft = %handle, expected = copy.base_version, actual = current.version, "commit rejected: stale draft");
            return Err(EngineError::VersionConflict {
                id: node_id,
                expected: copy.base_version,
                actual: current.version,
            });
        }

        if copy.changes.is_empty() && copy.origin == DraftOrigin::Edit {
            self.close(handle).await;
            return Ok(CommitResult {
                node_id,
                new_version: current.version,
                is_draft: current.is_draft,
                changes: Vec::new(),
                sequence: None,
            });
        }

        let mut next = current.clone();
        apply_all(&mut next, &copy.changes)?;
        validate_name(&next.name)?;
        self.kinds.validate_schema(&next.kind, &next.payload)?;
        next.is_draft = match self.kinds.check_complete(&next.kind, &next.payload) {
            Ok(()) => false,
            Err(reason) if current.is_draft => {
                tracing::debug!(node = %node_id, %reason, "content saved as draft");
                true
            }
            Err(reason) => return Err(reason.into()),
        };

        let ancestry = self.navigator.ancestry_ids(&node_id).await?;
        let stored = self.store.put_locked(&locks, next, copy.base_version).await?;
        let change = match copy.origin {
            DraftOrigin::Creation => ChangeKind::Added { node: stored.clone() },
            DraftOrigin::Edit => ChangeKind::Updated {
                changes: copy.changes.clone(),
                is_draft: stored.is_draft,
            },
        };
        let sequence = self
            .bus
            .publish(ChangeEvent::new(node_id, stored.version, ancestry, change))
            .await;
        self.close(handle).await;
        drop(locks);

        tracing::info!(node = %node_id, draft = %handle, version = stored.version, "draft committed");
        Ok(CommitResult {
            node_id,
            new_version: stored.version,
            is_draft: stored.is_draft,
            changes: copy.changes,
            sequence: Some(sequence),
        })
    }

    /// Drop the draft. A creation draft also takes its placeholder node out of the store.
    pub async fn discard(&self, handle: &DraftHandle) -> EngineResult<()> {
        let copy = self.get(handle).await?;
        if copy.origin == DraftOrigin::Edit {
            self.close(handle).await.ok_or_else(|| EngineError::draft_not_found(handle))?;
            tracing::debug!(node = %copy.node_id, draft = %handle, "draft discarded");
            return Ok(());
        }

        let _topology = self.store.topology_write().await;
        let affected = match self.store.find(&copy.node_id).await? {
            Some(_) => self.store.delete_lock_set(&copy.node_id, DeletePolicy::Cascade).await?,
            None => Vec::new(),
        };
        let locks = self.store.lock(&affected).await;

        // a commit may have taken the handle before the locks were ours
        let copy = self.get(handle).await?;
        let Some(stored) = self.store.find(&copy.node_id).await? else {
            self.close(handle).await;
            return Ok(());
        };
        if stored.version != copy.base_version {
            self.close(handle).await;
            return Err(EngineError::VersionConflict {
                id: copy.node_id,
                expected: copy.base_version,
                actual: stored.version,
            });
        }

        self.close(handle).await;
        let outcome = self.store.delete_locked(&locks, &copy.node_id, DeletePolicy::Cascade).await?;
        let removed: Vec<NodeId> = outcome.removed.iter().map(|n| n.id).collect();
        self.release_nodes(&removed).await;
        tracing::debug!(node = %copy.node_id, draft = %handle, removed = removed.len(), "creation draft discarded");
        Ok(())
    }

    /// Close drafts whose nodes no longer exist.
    pub async fn release_nodes(&self, ids: &[NodeId]) -> usize {
        let mut table = self.drafts.lock().await;
        let mut released = 0;
        for id in ids {
            if let Some(handle) = table.by_node.get(id).copied() {
                table.close(&handle);
                released += 1;
            }
        }
        released
    }

    async fn close(&self, handle: &DraftHandle) -> Option<WorkingCopy> {
        self.drafts.lock().await.close(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_bus::{BusMessage, SubscriptionFilter};
    use crate::node_mod::{NodeField, NodeKind};
    use serde_json::json;

    async fn setup() -> (Arc<NodeStore>, Arc<ChangeBus>, WorkingCopyManager) {
        let store = Arc::new(NodeStore::in_memory().await.unwrap());
        let bus = Arc::new(ChangeBus::new(32));
        let kinds = Arc::new(KindRegistry::with_builtins());
        let manager = WorkingCopyManager::new(store.clone(), bus.clone(), kinds);
        (store, bus, manager)
    }

    async fn root(store: &NodeStore, kind: &str, payload: serde_json::Value) -> Node {
        store.insert(Node::new(None, "root", NodeKind::new(kind), payload)).await.unwrap()
    }

    #[tokio::test]
    async fn second_begin_conflicts_until_closed() {
        let (store, _bus, manager) = setup().await;
        let node = root(&store, "container", json!({})).await;

        let first = manager.begin(&node.id).await.unwrap();
        let err = manager.begin(&node.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { draft, .. } if draft == first.handle));

        manager.discard(&first.handle).await.unwrap();
        assert!(manager.begin(&node.id).await.is_ok());
    }

    #[tokio::test]
    async fn commit_applies_edits_and_publishes() {
        let (store, bus, manager) = setup().await;
        let node = root(&store, "container", json!({})).await;
        let mut sub = bus.subscribe(SubscriptionFilter::All).await;

        let draft = manager.begin(&node.id).await.unwrap();
        let draft = manager.apply(&draft.handle, FieldEdit::rename("Projects")).await.unwrap();
        assert_eq!(draft.preview().unwrap().name, "Projects");
        assert_eq!(store.get(&node.id).await.unwrap().name, "root");

        let result = manager.commit(&draft.handle).await.unwrap();
        assert_eq!(result.new_version, 2);
        assert_eq!(store.get(&node.id).await.unwrap().name, "Projects");

        match sub.recv().await {
            Some(BusMessage::Event(event)) => {
                assert_eq!(event.node_id, node.id);
                assert_eq!(
                    event.change,
                    ChangeKind::Updated { changes: vec![FieldEdit::rename("Projects")], is_draft: false }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.draft_for(&node.id).await.is_none());
    }

    #[tokio::test]
    async fn stale_draft_is_a_version_conflict() {
        let (store, _bus, manager) = setup().await;
        let node = root(&store, "container", json!({})).await;
        let draft = manager.begin(&node.id).await.unwrap();
        manager.apply(&draft.handle, FieldEdit::rename("mine")).await.unwrap();

        let mut theirs = node.clone();
        theirs.name = "theirs".to_string();
        store.put(theirs, 1).await.unwrap();

        let err = manager.commit(&draft.handle).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { expected: 1, actual: 2, .. }));
        assert_eq!(store.get(&node.id).await.unwrap().name, "theirs");
        assert!(matches!(manager.get(&draft.handle).await, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn blank_name_keeps_draft_open() {
        let (store, _bus, manager) = setup().await;
        let node = root(&store, "container", json!({})).await;
        let draft = manager.begin(&node.id).await.unwrap();
        manager.apply(&draft.handle, FieldEdit::rename("   ")).await.unwrap();

        let err = manager.commit(&draft.handle).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "name"));

        manager.apply(&draft.handle, FieldEdit::rename("fixed")).await.unwrap();
        assert_eq!(manager.commit(&draft.handle).await.unwrap().new_version, 2);
    }

    #[tokio::test]
    async fn incomplete_payload_rejected_on_complete_node() {
        let (store, _bus, manager) = setup().await;
        let node = root(&store, "shape", json!({"geometry": {"type": "Point"}})).await;
        let draft = manager.begin(&node.id).await.unwrap();
        manager
            .apply(&draft.handle, FieldEdit::new(NodeField::Payload, json!({"properties": {}})))
            .await
            .unwrap();
        let err = manager.commit(&draft.handle).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(store.get(&node.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn creation_draft_lifecycle() {
        let (store, _bus, manager) = setup().await;
        let draft = manager
            .begin_creation(Node::new(None, "shape", NodeKind::new("shape"), json!({})))
            .await
            .unwrap();
        assert!(store.get(&draft.node_id).await.unwrap().is_draft);

        // still incomplete: saved, flag kept
        manager.apply(&draft.handle, FieldEdit::rename("circle")).await.unwrap();
        let result = manager.commit(&draft.handle).await.unwrap();
        assert!(result.is_draft);

        let edit = manager.begin(&draft.node_id).await.unwrap();
        manager
            .apply(&edit.handle, FieldEdit::payload(json!({"geometry": {"r": 1}})))
            .await
            .unwrap();
        let result = manager.commit(&edit.handle).await.unwrap();
        assert!(!result.is_draft);
        assert_eq!(result.new_version, 3);
    }

    #[tokio::test]
    async fn discard_semantics() {
        let (store, _bus, manager) = setup().await;

        let created = manager
            .begin_creation(Node::new(None, "tmp", NodeKind::container(), json!({})))
            .await
            .unwrap();
        manager.discard(&created.handle).await.unwrap();
        assert!(matches!(store.get(&created.node_id).await, Err(EngineError::NotFound { .. })));

        let node = root(&store, "container", json!({})).await;
        let edit = manager.begin(&node.id).await.unwrap();
        manager.apply(&edit.handle, FieldEdit::rename("never")).await.unwrap();
        manager.discard(&edit.handle).await.unwrap();
        assert_eq!(store.get(&node.id).await.unwrap(), node);
    }
}
