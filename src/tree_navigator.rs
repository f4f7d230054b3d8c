// src/tree_navigator.rs
// Tree Navigator - path resolution, ancestor/descendant walks and cycle detection

use std::collections::HashSet;
use std::sync::Arc;

use crate::error_mod::{EngineError, EngineResult};
use crate::node_mod::{Node, NodeId};
use crate::storage::NodeStore;

#[derive(Debug, Clone)]
pub struct TreeNavigator {
    store: Arc<NodeStore>,
}

impl TreeNavigator {
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self { store }
    }

    /// Walk `path` from the roots. With duplicate sibling names the first child wins.
    pub async fn resolve_path(&self, path: &[String]) -> EngineResult<NodeId> {
        if path.is_empty() {
            return Err(EngineError::invalid("path must contain at least one name"));
        }
        let mut parent: Option<NodeId> = None;
        for (depth, name) in path.iter().enumerate() {
            let children = self.store.get_children(parent.as_ref()).await?;
            let next = children.into_iter().find(|c| &c.name == name).ok_or_else(|| EngineError::NotFound {
                what: format!("path /{}", path[..=depth].join("/")),
            })?;
            parent = Some(next.id);
        }
        parent.ok_or_else(|| EngineError::invalid("empty path"))
    }

    /// Ancestors root-first, excluding `id` itself.
    pub async fn ancestors_of(&self, id: &NodeId) -> EngineResult<Vec<Node>> {
        let node = self.store.get(id).await?;
        let mut chain = Vec::new();
        let mut seen = HashSet::from([*id]);
        let mut next = node.parent_id;
        while let Some(parent_id) = next {
            if !seen.insert(parent_id) {
                tracing::error!(node = %id, looped_at = %parent_id, "parent chain loops");
                return Err(EngineError::Cycle { id: *id, new_parent: parent_id });
            }
            let parent = self.store.get(&parent_id).await?;
            next = parent.parent_id;
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Ancestor ids root-first, excluding `id`.
    pub async fn ancestry_ids(&self, id: &NodeId) -> EngineResult<Vec<NodeId>> {
        Ok(self.ancestors_of(id).await?.into_iter().map(|n| n.id).collect())
    }

    /// Every node below `id`, breadth-first.
    pub async fn descendants_of(&self, id: &NodeId) -> EngineResult<Vec<Node>> {
        self.store.get(id).await?;
        let mut out = Vec::new();
        for child in self.store.subtree_ids(id).await? {
            if let Some(node) = self.store.find(&child).await? {
                out.push(node);
            }
        }
        Ok(out)
    }

    /// True when placing `node_id` under `new_parent` would make it its own ancestor.
    pub async fn would_create_cycle(&self, node_id: &NodeId, new_parent: Option<&NodeId>) -> EngineResult<bool> {
        let Some(new_parent) = new_parent else {
            return Ok(false);
        };
        if new_parent == node_id {
            return Ok(true);
        }
        let mut seen = HashSet::new();
        let mut next = Some(*new_parent);
        while let Some(current) = next {
            if current == *node_id {
                return Ok(true);
            }
            if !seen.insert(current) {
                // the chain already loops without passing through node_id
                return Ok(true);
            }
            next = self.store.get(&current).await?.parent_id;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_mod::NodeKind;
    use serde_json::json;

    async fn chain() -> (Arc<NodeStore>, TreeNavigator, Vec<Node>) {
        let store = Arc::new(NodeStore::in_memory().await.unwrap());
        let a = store.insert(Node::new(None, "a", NodeKind::container(), json!({}))).await.unwrap();
        let b = store.insert(Node::new(Some(a.id), "b", NodeKind::container(), json!({}))).await.unwrap();
        let c = store.insert(Node::new(Some(b.id), "c", NodeKind::container(), json!({}))).await.unwrap();
        let navigator = TreeNavigator::new(store.clone());
        (store, navigator, vec![a, b, c])
    }

    #[tokio::test]
    async fn ancestors_are_root_first_and_exclude_self() {
        let (_store, navigator, nodes) = chain().await;
        let ids: Vec<_> = navigator.ancestors_of(&nodes[2].id).await.unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![nodes[0].id, nodes[1].id]);
        assert!(navigator.ancestors_of(&nodes[0].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cycle_detection() {
        let (_store, navigator, nodes) = chain().await;
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        assert!(navigator.would_create_cycle(&a, Some(&c)).await.unwrap());
        assert!(navigator.would_create_cycle(&b, Some(&b)).await.unwrap());
        assert!(!navigator.would_create_cycle(&c, Some(&a)).await.unwrap());
        assert!(!navigator.would_create_cycle(&b, None).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_path_walks_names() {
        let (store, navigator, nodes) = chain().await;
        let path = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(navigator.resolve_path(&path).await.unwrap(), nodes[2].id);

        // duplicate sibling name: the first in child order is chosen
        store
            .insert(Node::new(Some(nodes[0].id), "b", NodeKind::container(), json!({})))
            .await
            .unwrap();
        let path = vec!["a".to_string(), "b".to_string()];
        assert_eq!(navigator.resolve_path(&path).await.unwrap(), nodes[1].id);

        let missing = vec!["a".to_string(), "zzz".to_string()];
        assert!(matches!(navigator.resolve_path(&missing).await, Err(EngineError::NotFound { .. })));
        assert!(navigator.resolve_path(&[]).await.is_err());
    }

    #[tokio::test]
    async fn descendants_breadth_first() {
        let (_store, navigator, nodes) = chain().await;
        let names: Vec<_> = navigator.descendants_of(&nodes[0].id).await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
