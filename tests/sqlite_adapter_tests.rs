use canopy::node_mod::{DeletePolicy, Node, NodeKind};
use canopy::storage::{NodeStore, RetryPolicy, SqliteAdapter, StorageAdapter, WriteBatch};
use serde_json::json;

fn db_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("tree.sqlite").to_string_lossy().into_owned()
}

#[tokio::test]
async fn nodes_and_child_order_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = db_path(&dir);

    let root = Node::new(None, "root", NodeKind::container(), json!(null));
    let first = Node::new(Some(root.id), "first", NodeKind::container(), json!(null));
    let second = Node::new(Some(root.id), "second", NodeKind::new(NodeKind::SHAPE), json!({ "geometry": { "x": 1 } }));

    {
        let store = NodeStore::open(Box::new(SqliteAdapter::new(path.clone())), RetryPolicy::default())
            .await
            .expect("open");
        store.insert(root.clone()).await.expect("insert root");
        store.insert(second.clone()).await.expect("insert second");
        store.insert(first.clone()).await.expect("insert first");
    }

    let store = NodeStore::open(Box::new(SqliteAdapter::new(path)), RetryPolicy::default())
        .await
        .expect("reopen");
    let loaded = store.get(&second.id).await.expect("second");
    assert_eq!(loaded.payload, json!({ "geometry": { "x": 1 } }));
    assert_eq!(loaded.kind, NodeKind::new(NodeKind::SHAPE));

    // insertion order is the child order when no sort keys are set
    let children = store.child_ids(Some(&root.id)).await.expect("children");
    assert_eq!(children, vec![second.id, first.id]);
    assert_eq!(store.child_ids(None).await.expect("roots"), vec![root.id]);

    let stats = store.get_stats().await.expect("stats");
    assert_eq!(stats.backend, "sqlite");
    assert_eq!(stats.total_nodes, 3);
    assert_eq!(stats.nodes_by_kind.get("container"), Some(&2));
}

#[tokio::test]
async fn cascade_delete_clears_rows_and_index() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = NodeStore::open(Box::new(SqliteAdapter::new(db_path(&dir))), RetryPolicy::default())
        .await
        .expect("open");

    let a = store.insert(Node::new(None, "a", NodeKind::container(), json!(null))).await.expect("a");
    let b = store.insert(Node::new(Some(a.id), "b", NodeKind::container(), json!(null))).await.expect("b");
    store.insert(Node::new(Some(b.id), "c", NodeKind::container(), json!(null))).await.expect("c");

    let outcome = store.delete(&a.id, DeletePolicy::Cascade).await.expect("delete");
    assert_eq!(outcome.removed.len(), 3);
    assert!(store.find(&b.id).await.expect("find").is_none());
    assert!(store.child_ids(None).await.expect("roots").is_empty());
    assert_eq!(store.get_stats().await.expect("stats").total_nodes, 0);
}

#[tokio::test]
async fn batch_is_atomic_on_the_adapter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut adapter = SqliteAdapter::new(db_path(&dir));
    adapter.initialize().await.expect("initialize");
    adapter.health_check().await.expect("healthy");

    let node = Node::new(None, "solo", NodeKind::container(), json!(null));
    let batch = WriteBatch::new().put(node.clone()).link(None, node.id);
    adapter.apply(&batch).await.expect("apply");

    assert_eq!(adapter.load_node(&node.id).await.expect("load"), Some(node.clone()));
    assert_eq!(adapter.load_children(None).await.expect("children"), vec![node.id]);

    let batch = WriteBatch::new().unlink(None, node.id).remove(node.id);
    adapter.apply(&batch).await.expect("apply");
    assert!(adapter.load_node(&node.id).await.expect("load").is_none());
    assert!(adapter.load_children(None).await.expect("children").is_empty());
}
