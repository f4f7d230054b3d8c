use crate::node_mod::{Node, NodeId};
use crate::storage::{parent_key, StorageAdapter, StorageError, StorageStats, WriteBatch, WriteOp};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::str::FromStr;

const BACKEND: &str = "sqlite";

/// Schema for the durable tree: one JSON record per node and one JSON array of
/// child ids per parent key, written in the same transaction.
const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tree_nodes (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        kind TEXT NOT NULL,
        is_draft INTEGER NOT NULL DEFAULT 0,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tree_children (
        parent_key TEXT PRIMARY KEY,
        child_ids TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_tree_nodes_parent ON tree_nodes(parent_id)",
];

/// SQLite-backed adapter using `sqlx`. Creates its tables on first run and
/// keeps node records and the child index consistent through transactions.
pub struct SqliteAdapter {
    pub pool: Option<SqlitePool>,
    pub db_path: String,
}

impl SqliteAdapter {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self { pool: None, db_path: db_path.into() }
    }

    fn pool(&self) -> Result<&SqlitePool, StorageError> {
        self.pool.as_ref().ok_or(StorageError::DatabaseUnavailable { reason: "pool not initialized".to_string() })
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED and pool exhaustion are worth one more try.
fn map_sqlx(context: &str, e: sqlx::Error) -> StorageError {
    let transient = match &e {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    };
    let error = format!("{} failed: {}", context, e);
    if transient {
        StorageError::Transient { backend: BACKEND.to_string(), error }
    } else {
        StorageError::BackendError { backend: BACKEND.to_string(), error }
    }
}

fn decode_node(value: &str) -> Result<Node, StorageError> {
    serde_json::from_str(value).map_err(|e| StorageError::SerializationError { error: format!("node record: {}", e) })
}

fn decode_children(value: &str) -> Result<Vec<NodeId>, StorageError> {
    serde_json::from_str(value).map_err(|e| StorageError::SerializationError { error: format!("child index: {}", e) })
}

async fn read_children(tx: &mut Transaction<'_, Sqlite>, key: &str) -> Result<Vec<NodeId>, StorageError> {
    let row = sqlx::query("SELECT child_ids FROM tree_children WHERE parent_key = ?")
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx("read child index", e))?;
    match row {
        Some(r) => decode_children(&r.get::<String, _>(0)),
        None => Ok(Vec::new()),
    }
}

async fn write_children(tx: &mut Transaction<'_, Sqlite>, key: &str, children: &[NodeId]) -> Result<(), StorageError> {
    if children.is_empty() {
        sqlx::query("DELETE FROM tree_children WHERE parent_key = ?")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx("clear child index", e))?;
        return Ok(());
    }
    let value = serde_json::to_string(children).map_err(|e| StorageError::SerializationError { error: e.to_string() })?;
    sqlx::query("INSERT INTO tree_children(parent_key, child_ids) VALUES (?, ?) ON CONFLICT(parent_key) DO UPDATE SET child_ids = excluded.child_ids")
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx("write child index", e))?;
    Ok(())
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn initialize(&mut self) -> Result<(), StorageError> {
        let in_memory = self.db_path == ":memory:";
        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| map_sqlx("parse connection string", e))?
        } else {
            // Ensure parent directory exists
            let db_path_buf = std::path::PathBuf::from(&self.db_path);
            if let Some(parent) = db_path_buf.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| StorageError::BackendError { backend: BACKEND.to_string(), error: format!("Failed to create db dir: {}", e) })?;
                }
            }
            SqliteConnectOptions::new().filename(&self.db_path).create_if_missing(true)
        };

        // Every connection to `:memory:` is a separate database, so pin the pool to one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(|e| StorageError::BackendError { backend: BACKEND.to_string(), error: format!("Failed to connect: {}", e) })?;

        for stmt in MIGRATIONS {
            sqlx::query(stmt).execute(&pool).await.map_err(|e| map_sqlx("migration", e))?;
        }

        tracing::info!(db_path = %self.db_path, "SQLite tree store initialized");
        self.pool = Some(pool);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let pool = self.pool()?;
        sqlx::query("SELECT 1").execute(pool).await.map_err(|e| map_sqlx("health check", e))?;
        Ok(())
    }

    async fn load_node(&self, id: &NodeId) -> Result<Option<Node>, StorageError> {
        let pool = self.pool()?;
        let row = sqlx::query("SELECT value FROM tree_nodes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx("load node", e))?;
        match row {
            Some(r) => decode_node(&r.get::<String, _>(0)).map(Some),
            None => Ok(None),
        }
    }

    async fn load_children(&self, parent: Option<&NodeId>) -> Result<Vec<NodeId>, StorageError> {
        let pool = self.pool()?;
        let row = sqlx::query("SELECT child_ids FROM tree_children WHERE parent_key = ?")
            .bind(parent_key(parent))
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx("load children", e))?;
        match row {
            Some(r) => decode_children(&r.get::<String, _>(0)),
            None => Ok(Vec::new()),
        }
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await.map_err(|e| map_sqlx("begin transaction", e))?;

        for op in &batch.ops {
            match op {
                WriteOp::PutNode(node) => {
                    let value = serde_json::to_string(node).map_err(|e| StorageError::SerializationError { error: format!("serialize failed: {}", e) })?;
                    sqlx::query("INSERT INTO tree_nodes(id, parent_id, kind, is_draft, value, updated_at) VALUES (?, ?, ?, ?, ?, datetime('now')) ON CONFLICT(id) DO UPDATE SET parent_id = excluded.parent_id, kind = excluded.kind, is_draft = excluded.is_draft, value = excluded.value, updated_at = datetime('now')")
                        .bind(node.id.to_string())
                        .bind(node.parent_id.map(|p| p.to_string()))
                        .bind(node.kind.as_str())
                        .bind(node.is_draft)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx("put node", e))?;
                }
                WriteOp::RemoveNode(id) => {
                    let key = id.to_string();
                    sqlx::query("DELETE FROM tree_nodes WHERE id = ?")
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx("remove node", e))?;
                    write_children(&mut tx, &key, &[]).await?;
                }
                WriteOp::LinkChild { parent, child } => {
                    let key = parent_key(parent.as_ref());
                    let mut children = read_children(&mut tx, &key).await?;
                    if !children.contains(child) {
                        children.push(*child);
                    }
                    write_children(&mut tx, &key, &children).await?;
                }
                WriteOp::UnlinkChild { parent, child } => {
                    let key = parent_key(parent.as_ref());
                    let mut children = read_children(&mut tx, &key).await?;
                    children.retain(|c| c != child);
                    write_children(&mut tx, &key, &children).await?;
                }
            }
        }

        tx.commit().await.map_err(|e| map_sqlx("commit transaction", e))?;
        Ok(())
    }

    async fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let pool = self.pool()?;
        let rows = sqlx::query("SELECT kind, COUNT(*), SUM(is_draft), SUM(LENGTH(value)) FROM tree_nodes GROUP BY kind")
            .fetch_all(pool)
            .await
            .map_err(|e| map_sqlx("stats query", e))?;
        let mut stats = StorageStats { backend: BACKEND.to_string(), nodes_by_kind: HashMap::new(), ..StorageStats::default() };
        for r in rows {
            let kind: String = r.get(0);
            let count: i64 = r.get(1);
            let drafts: i64 = r.get::<Option<i64>, _>(2).unwrap_or(0);
            let size: i64 = r.get::<Option<i64>, _>(3).unwrap_or(0);
            stats.total_nodes += count as u64;
            stats.draft_nodes += drafts as u64;
            stats.storage_size_bytes += size as u64;
            stats.nodes_by_kind.insert(kind, count as u64);
        }
        Ok(stats)
    }
}
