//! Persistence Layer
//!
//! The ledger and the materializer only see the [`KvStore`] capability:
//! string keys, JSON string values, per-key atomic get/put/delete and an
//! ordered prefix scan. Any engine providing those four operations can back
//! the blotter.
//!
//! # Engines
//! - [`MemoryStore`]: in-process ordered map, used by tests and tooling
//! - [`SqliteStore`]: single `kv_store` table in SQLite via sqlx
//!
//! # Key Layout
//! - `TRADE:<ticker>:<sequence>:<tradeId>`: canonical trade records
//! - `POSITION:<book>:<ticker>`: materialized position snapshots
//! - `POSITION_FILL:<book>:<ticker>:<sequence>:<tradeId>`: fill journal rows
//! - `HEAD_SEQ_BLOTTER`: ledger head sequence
//! - `HEAD_SEQ_PORTFOLIO`: materializer replay cursor

pub mod keys;
pub mod memory_store;
pub mod sqlite_store;

pub use memory_store::MemoryStore;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Key-value capability the core persists through
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn put(&self, key: &str, value: String) -> Result<(), DatabaseError>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), DatabaseError>;

    /// All entries whose key starts with `prefix`, in ascending key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, DatabaseError>;
}

/// Serialize `value` as JSON and store it under `key`
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), DatabaseError> {
    let encoded = serde_json::to_string(value)?;
    store.put(key, encoded).await
}

/// Load and decode the JSON value stored under `key`
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, DatabaseError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Initialize the SQLite connection pool backing [`SqliteStore`]
///
/// # Arguments
/// - `database_url`: e.g. `sqlite://data/blotter.db` or `sqlite::memory:`
/// - `max_connections`: pool size; forced to 1 for in-memory databases since
///   every SQLite memory connection is a separate database
///
/// # Errors
/// Returns error if the connection or the migrations fail
pub async fn init_database(database_url: &str, max_connections: u32) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let in_memory = database_url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let mut pool_options = SqlitePoolOptions::new();
    pool_options = if in_memory {
        pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create kv_store table: {}", e)))?;

    info!("✓ Database migrations completed");
    Ok(())
}
