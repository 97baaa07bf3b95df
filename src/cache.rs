//! Typed read/write façade over the local store.
//!
//! The cache manager is the only component application code talks to for
//! cached state. Reads are served from the local store and never block on the
//! network. Writes always land locally first, with the matching sync queue
//! item staged into the SAME storage transaction, so there is no window in
//! which a crash leaves a pending entity without its queue item (the orphan
//! invariant).
//!
//! `refresh_from_remote` merges server-authoritative records back in:
//! server-wins against `synced` records, `updated_at` comparison against
//! records with pending local edits.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entity::{now_millis, AuthSession, Entity, EntityKind, SyncState};
use crate::queue::{Operation, SyncQueue};
use crate::remote::RemoteRecord;
use crate::store::traits::{LocalStore, Namespace, StoreError, WriteBatch};

const SESSION_KEY: &str = "current";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A local mutation requested by the application layer.
#[derive(Debug, Clone)]
pub enum Mutation {
    Create { payload: Value },
    Update { id: String, payload: Value },
    Delete { id: String },
}

/// Counts from one `refresh_from_remote` merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Server records written over synced (or absent) local copies.
    pub applied: usize,
    /// Pending local edits superseded by a newer server record.
    pub superseded: usize,
    /// Pending local edits preserved (still newer than the server).
    pub kept: usize,
    /// Synced local records removed because the server no longer has them.
    pub removed: usize,
}

pub struct CacheManager {
    store: Arc<dyn LocalStore>,
    queue: Arc<SyncQueue>,
}

impl CacheManager {
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>, queue: Arc<SyncQueue>) -> Self {
        Self { store, queue }
    }

    fn namespace(kind: EntityKind) -> Namespace {
        match kind {
            EntityKind::Profile => Namespace::Profile,
            EntityKind::Report => Namespace::Reports,
            EntityKind::Prescription => Namespace::Prescriptions,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Entity, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Stage an entity upsert into `batch`.
    pub(crate) fn stage_entity_put(batch: &mut WriteBatch, entity: &Entity) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entity)?;
        batch.put(Self::namespace(entity.kind), entity.id.clone(), bytes);
        Ok(())
    }

    /// Stage an entity removal into `batch`.
    pub(crate) fn stage_entity_delete(batch: &mut WriteBatch, kind: EntityKind, id: &str) {
        batch.delete(Self::namespace(kind), id);
    }

    // --- Reads ---

    /// All cached entities of `kind`, excluding ones pending deletion.
    /// Serves from the local store only; never blocks on the network.
    pub async fn read(&self, kind: EntityKind) -> Result<Vec<Entity>, CacheError> {
        let entities = self.read_including_deleted(kind).await?;
        Ok(entities
            .into_iter()
            .filter(|e| e.sync_state != SyncState::PendingDelete)
            .collect())
    }

    /// Like [`read`](Self::read) with a caller-supplied predicate
    /// (e.g. filter reports by patient id inside the payload).
    pub async fn read_where<F>(&self, kind: EntityKind, predicate: F) -> Result<Vec<Entity>, CacheError>
    where
        F: Fn(&Entity) -> bool,
    {
        let entities = self.read(kind).await?;
        Ok(entities.into_iter().filter(|e| predicate(e)).collect())
    }

    /// One entity by id, excluding ones pending deletion.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, CacheError> {
        Ok(self
            .get_any(kind, id)
            .await?
            .filter(|e| e.sync_state != SyncState::PendingDelete))
    }

    /// One entity by id, pending-delete included (reconciler internals).
    pub(crate) async fn get_any(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, CacheError> {
        let bytes = self.store.get(Self::namespace(kind), id).await?;
        match bytes {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All entities of `kind`, pending-delete included. Undecodable rows are
    /// dropped with an integrity warning rather than failing the whole read.
    pub(crate) async fn read_including_deleted(&self, kind: EntityKind) -> Result<Vec<Entity>, CacheError> {
        let rows = self.store.get_all(Self::namespace(kind)).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            match Self::decode(&bytes) {
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    warn!(kind = %kind, key = %key, error = %e, "Undecodable cached entity, skipping");
                }
            }
        }
        Ok(entities)
    }

    // --- Writes ---

    /// Apply a local mutation: persist the entity with the appropriate sync
    /// state AND enqueue the matching queue item in one storage transaction.
    ///
    /// Returns the local-facing id (a temporary id for creates).
    #[tracing::instrument(skip(self, mutation), fields(kind = %kind))]
    pub async fn write(&self, kind: EntityKind, mutation: Mutation) -> Result<String, CacheError> {
        let mut batch = WriteBatch::new();

        let id = match mutation {
            Mutation::Create { payload } => {
                let entity = Entity::new_local(kind, payload.clone());
                Self::stage_entity_put(&mut batch, &entity)?;
                self.queue
                    .stage(Operation::Create, kind, &entity.id, payload, &mut batch)?;
                entity.id
            }
            Mutation::Update { id, payload } => {
                let Some(mut entity) = self.get(kind, &id).await? else {
                    crate::metrics::record_cache_op("write", "not_found");
                    return Err(CacheError::NotFound(id));
                };
                entity.payload = payload.clone();
                // Monotonic per entity even on same-millisecond writes
                entity.updated_at = now_millis().max(entity.updated_at + 1);
                if entity.sync_state == SyncState::Synced {
                    entity.sync_state = SyncState::PendingUpdate;
                }
                Self::stage_entity_put(&mut batch, &entity)?;
                self.queue
                    .stage(Operation::Update, kind, &id, payload, &mut batch)?;
                id
            }
            Mutation::Delete { id } => {
                let Some(mut entity) = self.get(kind, &id).await? else {
                    crate::metrics::record_cache_op("write", "not_found");
                    return Err(CacheError::NotFound(id));
                };
                entity.sync_state = SyncState::PendingDelete;
                entity.updated_at = now_millis().max(entity.updated_at + 1);
                Self::stage_entity_put(&mut batch, &entity)?;
                self.queue
                    .stage(Operation::Delete, kind, &id, Value::Null, &mut batch)?;
                id
            }
        };

        // Entity write and queue insert commit (or fail) together
        self.store.apply(batch).await?;

        debug!(id = %id, "Local write persisted and queued");
        crate::metrics::record_cache_op("write", "ok");
        Ok(id)
    }

    // --- Server merge ---

    /// Merge server-authoritative records into the local store.
    ///
    /// Merge rule, applied per incoming record:
    /// - no local copy, or local copy `synced` → server record wins outright
    /// - local copy has a pending edit → the newer `updated_at` wins; when the
    ///   server is newer the pending edit is superseded and its queue items
    ///   are removed in the same transaction
    ///
    /// Local `synced` records absent from the server are removed (the server
    /// is authoritative); pending records absent from the server are kept.
    /// Applying the same payload twice is a no-op the second time.
    #[tracing::instrument(skip(self, records), fields(kind = %kind, incoming = records.len()))]
    pub async fn refresh_from_remote(
        &self,
        kind: EntityKind,
        records: &[RemoteRecord],
    ) -> Result<RefreshOutcome, CacheError> {
        let local = self.read_including_deleted(kind).await?;
        let local_by_id: HashMap<&str, &Entity> =
            local.iter().map(|e| (e.id.as_str(), e)).collect();
        let incoming_ids: std::collections::HashSet<&str> =
            records.iter().map(|r| r.id.as_str()).collect();

        let mut outcome = RefreshOutcome::default();
        let mut batch = WriteBatch::new();

        for record in records {
            match local_by_id.get(record.id.as_str()) {
                None => {
                    let entity = Entity::from_remote(kind, record);
                    Self::stage_entity_put(&mut batch, &entity)?;
                    outcome.applied += 1;
                }
                Some(existing) if existing.sync_state == SyncState::Synced => {
                    let entity = Entity::from_remote(kind, record);
                    if entity != **existing {
                        Self::stage_entity_put(&mut batch, &entity)?;
                    }
                    outcome.applied += 1;
                }
                Some(existing) => {
                    if record.updated_at > existing.updated_at {
                        // Server is newer: the pending local edit is superseded
                        let entity = Entity::from_remote(kind, record);
                        Self::stage_entity_put(&mut batch, &entity)?;
                        for item in self.queue.items_for_entity(kind, &record.id).await? {
                            self.queue.stage_delete(&mut batch, item.item_id);
                        }
                        outcome.superseded += 1;
                    } else {
                        outcome.kept += 1;
                    }
                }
            }
        }

        // Server no longer has these; drop synced local copies
        for entity in &local {
            if entity.sync_state == SyncState::Synced && !incoming_ids.contains(entity.id.as_str()) {
                Self::stage_entity_delete(&mut batch, kind, &entity.id);
                outcome.removed += 1;
            }
        }

        if !batch.is_empty() {
            self.store.apply(batch).await?;
        }

        if outcome.superseded > 0 {
            info!(
                kind = %kind,
                superseded = outcome.superseded,
                "Pending local edits superseded by newer server records"
            );
        }
        crate::metrics::record_cache_op("refresh", "ok");
        Ok(outcome)
    }

    // --- Auth session ---

    pub async fn session(&self) -> Result<Option<AuthSession>, CacheError> {
        let bytes = self.store.get(Namespace::Session, SESSION_KEY).await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn store_session(&self, session: &AuthSession) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(session)?;
        self.store.put(Namespace::Session, SESSION_KEY, &bytes).await?;
        Ok(())
    }

    pub async fn clear_session(&self) -> Result<(), CacheError> {
        self.store.delete(Namespace::Session, SESSION_KEY).await?;
        Ok(())
    }
}
