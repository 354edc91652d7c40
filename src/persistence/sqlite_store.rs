//! SQLite-backed [`KvStore`] engine.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::{debug, error};

use super::{DatabaseError, DbPool, KvStore};

/// Key-value store over the `kv_store` table
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// The pool must come from [`super::init_database`] so the table exists
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get {}: {}", key, e);
                DatabaseError::QueryError(format!("Failed to get {}: {}", key, e))
            })?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to put {}: {}", key, e);
            DatabaseError::QueryError(format!("Failed to put {}: {}", key, e))
        })?;

        debug!("Stored {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete {}: {}", key, e);
                DatabaseError::QueryError(format!("Failed to delete {}: {}", key, e))
            })?;

        debug!("Deleted {}", key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to scan prefix {}: {}", prefix, e);
            DatabaseError::QueryError(format!("Failed to scan prefix {}: {}", prefix, e))
        })?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            entries.push((key, value));
        }

        Ok(entries)
    }
}
