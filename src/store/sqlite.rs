// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage backend.
//!
//! One table holds every namespace:
//!
//! ```sql
//! CREATE TABLE records (
//!     namespace TEXT NOT NULL,
//!     key       TEXT NOT NULL,
//!     value     BLOB NOT NULL,
//!     PRIMARY KEY (namespace, key)
//! )
//! ```
//!
//! WAL journal mode is enabled at open for concurrent reads during writes.
//! [`LocalStore::apply`] runs the whole batch inside a single transaction,
//! which is what makes the entity-write + queue-enqueue pair crash-safe.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use crate::retry::{retry, RetryConfig};
use super::traits::{BatchOp, LocalStore, Namespace, StoreError, WriteBatch};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    ///
    /// Returns [`StoreError::Unavailable`] when the file cannot be opened at
    /// all; the caller is expected to fall back to the in-memory backend.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path);
        info!(path = %path, "Opening local store");

        let pool = retry("store_open", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Enable WAL journal mode (concurrent reads during writes, single fsync).
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to enable WAL mode: {}", e)))?;

        // NORMAL is safe under WAL and considerably faster than FULL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        retry("store_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS records (
                    namespace TEXT NOT NULL,
                    key       TEXT NOT NULL,
                    value     BLOB NOT NULL,
                    PRIMARY KEY (namespace, key)
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_vec();

        retry("store_put", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO records (namespace, key, value) VALUES (?, ?, ?)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            )
            .bind(namespace.as_str())
            .bind(&key)
            .bind(&value)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();

        retry("store_get", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT value FROM records WHERE namespace = ? AND key = ?")
                .bind(namespace.as_str())
                .bind(&key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            match row {
                Some(row) => {
                    let value: Vec<u8> = row
                        .try_get("value")
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_all(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        retry("store_get_all", &RetryConfig::query(), || async {
            let rows =
                sqlx::query("SELECT key, value FROM records WHERE namespace = ? ORDER BY key")
                    .bind(namespace.as_str())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let key: String = row
                    .try_get("key")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let value: Vec<u8> = row
                    .try_get("value")
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                out.push((key, value));
            }
            Ok(out)
        })
        .await
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();

        retry("store_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM records WHERE namespace = ? AND key = ?")
                .bind(namespace.as_str())
                .bind(&key)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn clear(&self, namespace: Namespace) -> Result<(), StoreError> {
        retry("store_clear", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM records WHERE namespace = ?")
                .bind(namespace.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for op in &batch.ops {
            match op {
                BatchOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    sqlx::query(
                        "INSERT INTO records (namespace, key, value) VALUES (?, ?, ?)
                         ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(namespace.as_str())
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                }
                BatchOp::Delete { namespace, key } => {
                    sqlx::query("DELETE FROM records WHERE namespace = ? AND key = ?")
                        .bind(namespace.as_str())
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
