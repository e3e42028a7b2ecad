//! SQLite storage backend

use crate::{matches_pattern, Storage, StorageError, StorageStats, StoredDocument};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// SQLite storage backend
///
/// Embedded persistence for single-node deployments. One row per document.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database at the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Database(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StorageError::Database(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                revision INTEGER NOT NULL,
                owner TEXT,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        let conn = self.conn.lock();

        conn.query_row(
            "SELECT content, revision, owner, updated_at FROM documents WHERE id = ?1",
            params![id],
            |row| {
                Ok(StoredDocument {
                    content: row.get(0)?,
                    revision: row.get::<_, i64>(1)? as u64,
                    owner: row.get(2)?,
                    updated_at: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn put(&self, id: &str, doc: &StoredDocument) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        // The WHERE clause keeps an older write from replacing a newer one
        conn.execute(
            r#"
            INSERT INTO documents (id, content, revision, owner, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                revision = excluded.revision,
                owner = COALESCE(documents.owner, excluded.owner),
                updated_at = excluded.updated_at
            WHERE excluded.revision >= documents.revision
            "#,
            params![
                id,
                doc.content,
                doc.revision as i64,
                doc.owner,
                doc.updated_at as i64
            ],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let affected = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(affected > 0)
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT id FROM documents ORDER BY id")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut ids = Vec::new();
        for row in rows {
            let id = row.map_err(|e| StorageError::Database(e.to_string()))?;
            if pattern.map_or(true, |p| matches_pattern(&id, p)) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let (count, size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(content AS BLOB))), 0) FROM documents",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(StorageStats {
            document_count: count as usize,
            total_size_bytes: size as usize,
        })
    }
}
