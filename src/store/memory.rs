//! In-memory store backend.
//!
//! Used directly in tests and as the degraded-mode fallback when the SQLite
//! backend cannot be opened. Offers the same atomicity guarantees as the
//! durable backend within a single process, but nothing survives a restart.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{BatchOp, LocalStore, Namespace, StoreError, WriteBatch};

pub struct InMemoryStore {
    data: DashMap<(Namespace, String), Vec<u8>>,
    /// Serializes `apply` against itself so a batch is observed all-or-nothing.
    batch_lock: Mutex<()>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            batch_lock: Mutex::new(()),
        }
    }

    /// Total entry count across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.data.insert((namespace, key.to_string()), value.to_vec());
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .data
            .get(&(namespace, key.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn get_all(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let _guard = self.batch_lock.lock();
        let mut rows: Vec<(String, Vec<u8>)> = self
            .data
            .iter()
            .filter(|r| r.key().0 == namespace)
            .map(|r| (r.key().1.clone(), r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        self.data.remove(&(namespace, key.to_string()));
        Ok(())
    }

    async fn clear(&self, namespace: Namespace) -> Result<(), StoreError> {
        let _guard = self.batch_lock.lock();
        self.data.retain(|k, _| k.0 != namespace);
        Ok(())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let _guard = self.batch_lock.lock();
        for op in batch.ops {
            match op {
                BatchOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    self.data.insert((namespace, key), value);
                }
                BatchOp::Delete { namespace, key } => {
                    self.data.remove(&(namespace, key));
                }
            }
        }
        Ok(())
    }
}
