// src/state_mod.rs
// Engine State - wires store, navigator, drafts, bus and kind registry together
// and owns the structural operations (create, move, delete)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change_bus::{ChangeBus, ChangeEvent, ChangeKind};
use crate::config_mod::{EngineConfig, StorageBackend};
use crate::error_mod::{EngineError, EngineResult};
use crate::kind_registry::KindRegistry;
use crate::node_mod::{DeletePolicy, NewNode, Node, NodeId};
use crate::storage::validation_mod::validate_name;
use crate::storage::{DeleteOutcome, MemoryAdapter, NodeStore, SqliteAdapter, StorageAdapter, StorageStats};
use crate::tree_navigator::TreeNavigator;
use crate::working_copy::{WorkingCopy, WorkingCopyManager};

/// Engine state shared by every request handler
#[derive(Debug)]
pub struct EngineState {
    pub config: EngineConfig,
    pub store: Arc<NodeStore>,
    pub navigator: TreeNavigator,
    pub drafts: Arc<WorkingCopyManager>,
    pub bus: Arc<ChangeBus>,
    pub kinds: Arc<KindRegistry>,
    pub started_at: DateTime<Utc>,
}

/// Shared EngineState handle used across engine modules
pub type EngineStateType = Arc<EngineState>;

/// Health snapshot returned by `engine.stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub storage: StorageStats,
    pub open_drafts: usize,
    pub subscribers: usize,
    pub kinds: Vec<String>,
    pub degraded: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl EngineState {
    /// Build state with the backend selected in `config` and the builtin kinds.
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let adapter: Box<dyn StorageAdapter> = match config.storage.backend {
            StorageBackend::Memory => Box::new(MemoryAdapter::new()),
            StorageBackend::Sqlite => Box::new(SqliteAdapter::new(config.storage.sqlite_path.clone())),
        };
        Self::with_adapter(config, adapter, KindRegistry::with_builtins()).await
    }

    pub async fn with_adapter(config: EngineConfig, adapter: Box<dyn StorageAdapter>, kinds: KindRegistry) -> EngineResult<Self> {
        let store = Arc::new(NodeStore::open(adapter, config.retry_policy()).await?);
        let bus = Arc::new(ChangeBus::new(config.bus.subscriber_buffer));
        let kinds = Arc::new(kinds);
        let drafts = Arc::new(WorkingCopyManager::new(store.clone(), bus.clone(), kinds.clone()));
        tracing::info!(backend = store.backend(), kinds = ?kinds.kinds(), "engine state initialized");
        Ok(Self {
            config,
            navigator: TreeNavigator::new(store.clone()),
            store,
            drafts,
            bus,
            kinds,
            started_at: Utc::now(),
        })
    }

    pub async fn in_memory() -> EngineResult<Self> {
        Self::new(EngineConfig::default()).await
    }

    /// Create and commit a node in one step (version 1).
    pub async fn create_node(&self, request: NewNode) -> EngineResult<Node> {
        validate_name(&request.name)?;
        self.kinds.validate_schema(&request.kind, &request.payload)?;
        let mut node = request.into_node();
        node.is_draft = self.kinds.check_complete(&node.kind, &node.payload).is_err();

        let _topology = self.store.topology_write().await;
        if let Some(parent) = node.parent_id {
            self.drafts.ensure_committed(&parent, "parentId").await?;
        }
        let ancestry = self.lineage(node.parent_id.as_ref()).await?;
        let stored = self.store.insert(node).await?;
        self.bus
            .publish(ChangeEvent::new(stored.id, stored.version, ancestry, ChangeKind::Added { node: stored.clone() }))
            .await;
        tracing::info!(node = %stored.id, kind = %stored.kind, "node created");
        Ok(stored)
    }

    /// Insert a draft node and open a creation working copy on it.
    pub async fn begin_create(&self, request: NewNode) -> EngineResult<WorkingCopy> {
        self.drafts.begin_creation(request.into_node()).await
    }

    /// Reparent `id`. Rejected with `Cycle` when `new_parent` is the node or one of its descendants.
    pub async fn move_node(&self, id: &NodeId, new_parent: Option<NodeId>) -> EngineResult<Node> {
        let _topology = self.store.topology_write().await;
        let node = self.store.get(id).await?;
        self.drafts.ensure_committed(id, "id").await?;
        if let Some(parent) = new_parent {
            self.store.get(&parent).await?;
            self.drafts.ensure_committed(&parent, "newParentId").await?;
            if self.navigator.would_create_cycle(id, Some(&parent)).await? {
                tracing::info!(node = %id, new_parent = %parent, "move rejected: cycle");
                return Err(EngineError::Cycle { id: *id, new_parent: parent });
            }
        }
        if node.parent_id == new_parent {
            return Ok(node);
        }

        let previous_ancestry = self.navigator.ancestry_ids(id).await?;
        let ancestry = self.lineage(new_parent.as_ref()).await?;
        let locks = self.store.lock(&[*id]).await;
        let moved = self.store.reparent_locked(&locks, id, new_parent).await?;
        self.bus
            .publish(ChangeEvent::new(
                moved.id,
                moved.version,
                ancestry,
                ChangeKind::Moved { from: node.parent_id, to: new_parent, previous_ancestry },
            ))
            .await;
        tracing::info!(node = %id, version = moved.version, "node moved");
        Ok(moved)
    }

    /// Delete `id`; `policy` decides what happens to its children.
    pub async fn delete_node(&self, id: &NodeId, policy: DeletePolicy) -> EngineResult<DeleteOutcome> {
        let _topology = self.store.topology_write().await;
        self.store.get(id).await?;

        let mut target_lineage = Vec::new();
        if let DeletePolicy::ReparentTo { parent_id: Some(target) } = policy {
            if target == *id {
                return Err(EngineError::Cycle { id: *id, new_parent: target });
            }
            self.store.get(&target).await?;
            self.drafts.ensure_committed(&target, "policy.parentId").await?;
            for child in self.store.child_ids(Some(id)).await? {
                if self.navigator.would_create_cycle(&child, Some(&target)).await? {
                    return Err(EngineError::Cycle { id: child, new_parent: target });
                }
            }
            target_lineage = self.lineage(Some(&target)).await?;
        }

        // ancestry of every node that is about to disappear, captured while it still exists
        let base = self.navigator.ancestry_ids(id).await?;
        let mut lineages: HashMap<NodeId, Vec<NodeId>> = HashMap::from([(*id, base)]);
        if policy == DeletePolicy::Cascade {
            for node in self.navigator.descendants_of(id).await? {
                let Some(parent) = node.parent_id else { continue };
                let mut lineage = lineages.get(&parent).cloned().unwrap_or_default();
                lineage.push(parent);
                lineages.insert(node.id, lineage);
            }
        }

        let affected = self.store.delete_lock_set(id, policy).await?;
        let locks = self.store.lock(&affected).await;
        let outcome = self.store.delete_locked(&locks, id, policy).await?;

        let mut previous = lineages.get(id).cloned().unwrap_or_default();
        previous.push(*id);
        for child in &outcome.reparented {
            self.bus
                .publish(ChangeEvent::new(
                    child.id,
                    child.version,
                    target_lineage.clone(),
                    ChangeKind::Moved { from: Some(*id), to: child.parent_id, previous_ancestry: previous.clone() },
                ))
                .await;
        }
        for node in &outcome.removed {
            let lineage = lineages.remove(&node.id).unwrap_or_default();
            self.bus
                .publish(ChangeEvent::new(node.id, node.version, lineage, ChangeKind::Deleted { parent_id: node.parent_id }))
                .await;
        }
        drop(locks);

        let removed: Vec<NodeId> = outcome.removed.iter().map(|n| n.id).collect();
        let released = self.drafts.release_nodes(&removed).await;
        tracing::info!(node = %id, removed = removed.len(), released_drafts = released, "node deleted");
        Ok(outcome)
    }

    pub async fn status(&self) -> EngineResult<EngineStatus> {
        Ok(EngineStatus {
            storage: self.store.get_stats().await?,
            open_drafts: self.drafts.open_drafts().await.len(),
            subscribers: self.bus.subscriber_count().await,
            kinds: self.kinds.kinds(),
            degraded: self.store.degraded().await,
            started_at: self.started_at,
        })
    }

    /// Ancestor ids of a prospective child of `parent`, root-first, including `parent`.
    async fn lineage(&self, parent: Option<&NodeId>) -> EngineResult<Vec<NodeId>> {
        match parent {
            Some(parent) => {
                let mut ids = self.navigator.ancestry_ids(parent).await?;
                ids.push(*parent);
                Ok(ids)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_bus::{BusMessage, SubscriptionFilter};
    use crate::node_mod::{FieldEdit, NodeKind};
    use std::time::Duration;

    fn container(parent: Option<NodeId>, name: &str) -> NewNode {
        NewNode::new(parent, name, NodeKind::container())
    }

    #[tokio::test]
    async fn move_into_own_descendant_is_rejected() {
        let state = EngineState::in_memory().await.unwrap();
        let b = state.create_node(container(None, "b")).await.unwrap();
        let mid = state.create_node(container(Some(b.id), "mid")).await.unwrap();
        let c = state.create_node(container(Some(mid.id), "c")).await.unwrap();

        let err = state.move_node(&b.id, Some(c.id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Cycle { .. }));
        assert_eq!(state.store.get(&b.id).await.unwrap().version, 1);
        assert_eq!(state.store.get(&c.id).await.unwrap().version, 1);
        assert!(state.store.get(&b.id).await.unwrap().parent_id.is_none());
    }

    #[tokio::test]
    async fn move_bumps_version_and_notifies_both_subtrees() {
        let state = EngineState::in_memory().await.unwrap();
        let left = state.create_node(container(None, "left")).await.unwrap();
        let right = state.create_node(container(None, "right")).await.unwrap();
        let leaf = state.create_node(container(Some(left.id), "leaf")).await.unwrap();

        let mut old_side = state.bus.subscribe(SubscriptionFilter::Subtree { root: left.id }).await;
        let mut new_side = state.bus.subscribe(SubscriptionFilter::Subtree { root: right.id }).await;

        let moved = state.move_node(&leaf.id, Some(right.id)).await.unwrap();
        assert_eq!(moved.version, 2);
        assert!(state.navigator.ancestry_ids(&leaf.id).await.unwrap() == vec![right.id]);

        for sub in [&mut old_side, &mut new_side] {
            match sub.recv().await {
                Some(BusMessage::Event(e)) => assert!(matches!(e.change, ChangeKind::Moved { .. })),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn reparent_into_deleted_subtree_is_a_cycle() {
        let state = EngineState::in_memory().await.unwrap();
        let a = state.create_node(container(None, "a")).await.unwrap();
        let b = state.create_node(container(Some(a.id), "b")).await.unwrap();
        let c = state.create_node(container(Some(b.id), "c")).await.unwrap();

        let err = state
            .delete_node(&a.id, DeletePolicy::ReparentTo { parent_id: Some(c.id) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cycle { .. }));
        assert!(state.store.find(&a.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cascade_delete_emits_deleted_events_and_releases_drafts() {
        let state = EngineState::in_memory().await.unwrap();
        let a = state.create_node(container(None, "a")).await.unwrap();
        let b = state.create_node(container(Some(a.id), "b")).await.unwrap();
        state.drafts.begin(&b.id).await.unwrap();
        let mut sub = state.bus.subscribe(SubscriptionFilter::Subtree { root: a.id }).await;

        let outcome = state.delete_node(&a.id, DeletePolicy::Cascade).await.unwrap();
        assert_eq!(outcome.removed.len(), 2);
        assert!(state.drafts.draft_for(&b.id).await.is_none());

        let mut deleted = Vec::new();
        while let Some(BusMessage::Event(e)) = sub.try_recv() {
            assert!(matches!(e.change, ChangeKind::Deleted { .. }));
            deleted.push(e.node_id);
        }
        assert_eq!(deleted, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn create_rejects_unknown_kind_and_blank_name() {
        let state = EngineState::in_memory().await.unwrap();
        let err = state.create_node(NewNode::new(None, "x", NodeKind::new("mystery"))).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "kind"));
        let err = state.create_node(container(None, "  ")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        let err = state.create_node(container(Some(NodeId::new()), "orphan")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn uncommitted_creation_draft_cannot_take_children() {
        let state = EngineState::in_memory().await.unwrap();
        let pending = state.begin_create(container(None, "pending")).await.unwrap();
        let other = state.create_node(container(None, "other")).await.unwrap();
        let mut sub = state.bus.subscribe(SubscriptionFilter::All).await;

        let err = state.create_node(container(Some(pending.node_id), "child")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "parentId"));
        let err = state.begin_create(container(Some(pending.node_id), "child")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "parentId"));
        let err = state.move_node(&other.id, Some(pending.node_id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "newParentId"));
        let err = state.move_node(&pending.node_id, Some(other.id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "id"));
        assert!(state.store.child_ids(Some(&pending.node_id)).await.unwrap().is_empty());

        state.drafts.discard(&pending.handle).await.unwrap();
        assert!(state.store.find(&pending.node_id).await.unwrap().is_none());
        assert!(state.store.find(&other.id).await.unwrap().is_some());
        assert!(sub.try_recv().is_none());

        // once committed it is an ordinary parent
        let parent = state.begin_create(container(None, "parent")).await.unwrap();
        state.drafts.commit(&parent.handle).await.unwrap();
        assert!(state.create_node(container(Some(parent.node_id), "child")).await.is_ok());
    }

    #[tokio::test]
    async fn discard_losing_to_commit_keeps_the_committed_node() {
        let state = Arc::new(EngineState::in_memory().await.unwrap());
        let draft = state.begin_create(container(None, "pending")).await.unwrap();
        let (handle, node_id) = (draft.handle, draft.node_id);
        let mut sub = state.bus.subscribe(SubscriptionFilter::All).await;

        let held = state.store.lock(&[node_id]).await;
        let committing = tokio::spawn({
            let state = state.clone();
            async move { state.drafts.commit(&handle).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let discarding = tokio::spawn({
            let state = state.clone();
            async move { state.drafts.discard(&handle).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let committed = committing.await.unwrap().unwrap();
        assert_eq!(committed.new_version, 2);
        assert!(matches!(discarding.await.unwrap(), Err(EngineError::NotFound { .. })));
        assert_eq!(state.store.get(&node_id).await.unwrap().version, 2);

        match sub.try_recv() {
            Some(BusMessage::Event(e)) => assert!(matches!(e.change, ChangeKind::Added { .. })),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn ancestor_move_waits_for_pending_commit() {
        let state = Arc::new(EngineState::in_memory().await.unwrap());
        let watched = state.create_node(container(None, "watched")).await.unwrap();
        let branch = state.create_node(container(None, "branch")).await.unwrap();
        let leaf = state.create_node(container(Some(branch.id), "leaf")).await.unwrap();
        let draft = state.drafts.begin(&leaf.id).await.unwrap();
        state.drafts.apply(&draft.handle, FieldEdit::rename("renamed")).await.unwrap();
        let handle = draft.handle;
        let mut all = state.bus.subscribe(SubscriptionFilter::All).await;
        let mut inside = state.bus.subscribe(SubscriptionFilter::Subtree { root: watched.id }).await;

        let held = state.store.lock(&[leaf.id]).await;
        let committing = tokio::spawn({
            let state = state.clone();
            async move { state.drafts.commit(&handle).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (branch_id, watched_id) = (branch.id, watched.id);
        let moving = tokio::spawn({
            let state = state.clone();
            async move { state.move_node(&branch_id, Some(watched_id)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(state.store.get(&branch.id).await.unwrap().parent_id.is_none());
        drop(held);

        committing.await.unwrap().unwrap();
        moving.await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Some(BusMessage::Event(e)) = all.try_recv() {
            seen.push(e);
        }
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0].change, ChangeKind::Updated { .. }));
        assert_eq!(seen[0].ancestry, vec![branch.id]);
        assert_eq!(seen[1].node_id, branch.id);
        assert!(matches!(seen[1].change, ChangeKind::Moved { .. }));

        // the update happened outside the watched subtree; only the move lands there
        match inside.try_recv() {
            Some(BusMessage::Event(e)) => assert_eq!(e.node_id, branch.id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(inside.try_recv().is_none());
        assert_eq!(state.navigator.ancestry_ids(&leaf.id).await.unwrap(), vec![watched.id, branch.id]);
    }
}
