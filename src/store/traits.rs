use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The durable backend could not be opened (quota, permissions, corrupt
    /// file). Callers degrade to memory-only operation; never fatal.
    #[error("local store unavailable: {0}")]
    Unavailable(String),
    #[error("local store backend error: {0}")]
    Backend(String),
}

/// Store namespaces. One per entity kind, plus dedicated namespaces for the
/// sync queue and the cached auth session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Profile,
    Reports,
    Prescriptions,
    Session,
    Queue,
}

impl Namespace {
    /// Namespaces holding cached entities (excludes queue and session).
    pub const ENTITY: [Namespace; 3] = [
        Namespace::Profile,
        Namespace::Reports,
        Namespace::Prescriptions,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Reports => "reports",
            Self::Prescriptions => "prescriptions",
            Self::Session => "session",
            Self::Queue => "queue",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        namespace: Namespace,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        namespace: Namespace,
        key: String,
    },
}

/// A set of mutations applied atomically in one storage transaction.
///
/// This is what holds the orphan invariant together: an entity write and its
/// matching queue item land (or fail) as one unit, so a crash can never leave
/// a pending entity without a queue item or vice versa.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, namespace: Namespace, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            namespace,
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, namespace: Namespace, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete {
            namespace,
            key: key.into(),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable key/value persistence, namespaced per entity kind plus the queue.
///
/// Single-key operations are atomic; `get_all` returns a point-in-time
/// snapshot; `apply` commits a whole [`WriteBatch`] in one transaction.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn get_all(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError>;
    async fn clear(&self, namespace: Namespace) -> Result<(), StoreError>;

    /// Apply all operations in one atomic transaction.
    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

// Stores are shared via Arc; let the decorators wrap shared handles too.
#[async_trait]
impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).put(namespace, key, value).await
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(namespace, key).await
    }

    async fn get_all(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        (**self).get_all(namespace).await
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        (**self).delete(namespace, key).await
    }

    async fn clear(&self, namespace: Namespace) -> Result<(), StoreError> {
        (**self).clear(namespace).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).apply(batch).await
    }
}
