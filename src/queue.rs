// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable sync queue: FIFO-per-entity mutation intents with retry state.
//!
//! Every local write enqueues one [`QueueItem`] describing the mutation to
//! replay against the remote service. Items move through a small state
//! machine:
//!
//! ```text
//! pending → in_flight → done
//!               │
//!               ├→ pending (attempts+1, backoff)   transient failure
//!               └→ abandoned                        permanent failure or
//!                                                   retry budget exhausted
//! ```
//!
//! `done` and `abandoned` are terminal. Items for the *same* entity are
//! delivered strictly in enqueue order; items for different entities have no
//! relative ordering. There is no clear-and-readd anywhere: each item is a
//! durable row that transitions in place, so a crash can never drop the
//! queue on the floor mid-retry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::entity::{now_millis, EntityKind};
use crate::store::traits::{LocalStore, Namespace, StoreError, WriteBatch};

/// The mutation a queue item replays against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Delivery state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InFlight,
    Done,
    Abandoned,
}

impl ItemStatus {
    /// `done` and `abandoned` never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Done => write!(f, "done"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// How a delivery failure counts against the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Consumes one attempt; retried with exponential backoff.
    Transient,
    /// Escalates straight to `abandoned`.
    Permanent,
}

/// One durable intention to mutate the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Locally unique, monotonically increasing. Doubles as enqueue order.
    pub item_id: u64,
    pub operation: Operation,
    pub entity_kind: EntityKind,
    /// Entity this item targets. Rewritten from temporary to server id when
    /// an earlier create for the same entity is acknowledged.
    pub entity_id: String,
    /// Payload snapshot taken at enqueue time.
    pub payload: Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Epoch millis.
    pub enqueued_at: i64,
    /// Earliest epoch millis this item may be attempted again.
    pub next_attempt_at: i64,
    pub status: ItemStatus,
}

/// Durable FIFO-per-entity queue over the local store's `queue` namespace.
pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    config: SyncConfig,
    next_id: AtomicU64,
}

impl SyncQueue {
    /// Open the queue, seeding the id counter from what is already stored.
    pub async fn open(store: Arc<dyn LocalStore>, config: SyncConfig) -> Result<Self, StoreError> {
        let items = Self::load_from(&*store).await?;
        let max_id = items.iter().map(|i| i.item_id).max().unwrap_or(0);

        Ok(Self {
            store,
            config,
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    fn item_key(item_id: u64) -> String {
        // Zero-padded so lexical key order matches numeric enqueue order
        format!("{:020}", item_id)
    }

    fn encode(item: &QueueItem) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(item).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn load_from(store: &dyn LocalStore) -> Result<Vec<QueueItem>, StoreError> {
        let rows = store.get_all(Namespace::Queue).await?;
        let mut items = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            match serde_json::from_slice::<QueueItem>(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable queue item, skipping");
                }
            }
        }
        items.sort_by_key(|i| i.item_id);
        Ok(items)
    }

    /// All decodable items, sorted by enqueue order.
    pub async fn load_all(&self) -> Result<Vec<QueueItem>, StoreError> {
        Self::load_from(&*self.store).await
    }

    async fn load_item(&self, item_id: u64) -> Result<Option<QueueItem>, StoreError> {
        let bytes = self.store.get(Namespace::Queue, &Self::item_key(item_id)).await?;
        match bytes {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Backend(e.to_string())),
            None => Ok(None),
        }
    }

    async fn persist(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.store
            .put(Namespace::Queue, &Self::item_key(item.item_id), &Self::encode(item)?)
            .await
    }

    /// Build a fresh item and its store write, without applying anything.
    ///
    /// The cache manager folds the returned op into the same [`WriteBatch`]
    /// as the entity write so both land atomically (the orphan invariant).
    pub(crate) fn stage(
        &self,
        operation: Operation,
        entity_kind: EntityKind,
        entity_id: &str,
        payload: Value,
        batch: &mut WriteBatch,
    ) -> Result<QueueItem, StoreError> {
        let now = now_millis();
        let item = QueueItem {
            item_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            operation,
            entity_kind,
            entity_id: entity_id.to_string(),
            payload,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            next_attempt_at: now,
            status: ItemStatus::Pending,
        };
        self.stage_put(batch, &item)?;
        Ok(item)
    }

    /// Add a put of `item` to `batch` (reconciler ack paths compose these).
    pub(crate) fn stage_put(&self, batch: &mut WriteBatch, item: &QueueItem) -> Result<(), StoreError> {
        batch.put(Namespace::Queue, Self::item_key(item.item_id), Self::encode(item)?);
        Ok(())
    }

    /// Add a removal of an item row to `batch` (superseded pending work).
    pub(crate) fn stage_delete(&self, batch: &mut WriteBatch, item_id: u64) {
        batch.delete(Namespace::Queue, Self::item_key(item_id));
    }

    /// Append a new pending item and persist it immediately.
    pub async fn enqueue(
        &self,
        operation: Operation,
        entity_kind: EntityKind,
        entity_id: &str,
        payload: Value,
    ) -> Result<QueueItem, StoreError> {
        let mut batch = WriteBatch::new();
        let item = self.stage(operation, entity_kind, entity_id, payload, &mut batch)?;
        self.store.apply(batch).await?;

        debug!(
            item_id = item.item_id,
            operation = %item.operation,
            entity = %item.entity_id,
            "Queue item enqueued"
        );
        crate::metrics::record_queue_op(item.operation.as_ref(), "enqueued");
        Ok(item)
    }

    /// Take up to `max_items` due items and mark them in-flight.
    ///
    /// Per-entity serialization: only the EARLIEST non-terminal item of each
    /// entity is ever eligible, and only while it is `pending` and due. A
    /// later item never overtakes an earlier one that is in flight or parked
    /// in backoff, so a create can never be reordered behind its own update
    /// or delete.
    pub async fn next_batch(&self, max_items: usize, now: i64) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.load_all().await?;

        let mut entities_seen: HashSet<(EntityKind, String)> = HashSet::new();
        let mut batch = Vec::new();

        for item in items {
            if item.status.is_terminal() {
                continue;
            }
            let entity = (item.entity_kind, item.entity_id.clone());
            if !entities_seen.insert(entity) {
                // Not the head item for this entity
                continue;
            }
            if item.status != ItemStatus::Pending || item.next_attempt_at > now {
                // Head item is in flight or still backing off; entity blocked
                continue;
            }
            batch.push(item);
            if batch.len() >= max_items {
                break;
            }
        }

        for item in &mut batch {
            item.status = ItemStatus::InFlight;
            self.persist(item).await?;
        }

        Ok(batch)
    }

    /// Whether any entity head item is pending and due at `now`.
    pub async fn has_due(&self, now: i64) -> Result<bool, StoreError> {
        Ok(!self.next_peek(now).await?.is_empty())
    }

    /// Like `next_batch(1, now)` but without marking anything in-flight.
    async fn next_peek(&self, now: i64) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.load_all().await?;
        let mut entities_seen: HashSet<(EntityKind, String)> = HashSet::new();
        let mut due = Vec::new();

        for item in items {
            if item.status.is_terminal() {
                continue;
            }
            let entity = (item.entity_kind, item.entity_id.clone());
            if !entities_seen.insert(entity) {
                continue;
            }
            if item.status == ItemStatus::Pending && item.next_attempt_at <= now {
                due.push(item);
                break;
            }
        }
        Ok(due)
    }

    /// Mark an item delivered. Terminal; the row is removed at compaction.
    pub async fn mark_done(&self, item_id: u64) -> Result<(), StoreError> {
        let Some(mut item) = self.load_item(item_id).await? else {
            return Ok(());
        };
        if item.status.is_terminal() {
            return Ok(());
        }
        item.status = ItemStatus::Done;
        self.persist(&item).await?;
        crate::metrics::record_queue_op(item.operation.as_ref(), "done");
        Ok(())
    }

    /// Record a delivery failure.
    ///
    /// Transient failures consume one attempt and park the item with
    /// exponential backoff; permanent failures, or running out of attempts,
    /// abandon the item. Returns the resulting status.
    pub async fn mark_failed(
        &self,
        item_id: u64,
        error: &str,
        class: FailureClass,
    ) -> Result<ItemStatus, StoreError> {
        let Some(mut item) = self.load_item(item_id).await? else {
            return Ok(ItemStatus::Done);
        };
        if item.status.is_terminal() {
            return Ok(item.status);
        }

        item.attempts += 1;
        item.last_error = Some(error.to_string());

        let exhausted = item.attempts >= self.config.max_attempts;
        if class == FailureClass::Permanent || exhausted {
            item.status = ItemStatus::Abandoned;
            warn!(
                item_id = item.item_id,
                operation = %item.operation,
                entity = %item.entity_id,
                attempts = item.attempts,
                error = %error,
                "Queue item abandoned"
            );
            crate::metrics::record_queue_op(item.operation.as_ref(), "abandoned");
        } else {
            let delay = self.config.backoff_delay_ms(item.attempts);
            item.status = ItemStatus::Pending;
            item.next_attempt_at = now_millis() + delay as i64;
            debug!(
                item_id = item.item_id,
                attempts = item.attempts,
                delay_ms = delay,
                "Queue item failed, retrying after backoff"
            );
            crate::metrics::record_queue_op(item.operation.as_ref(), "retried");
        }

        self.persist(&item).await?;
        Ok(item.status)
    }

    /// Return an in-flight item to `pending` without consuming an attempt.
    ///
    /// Used when the failure was not the item's fault: connectivity dropped
    /// mid-drain, or authentication expired.
    pub async fn release(&self, item_id: u64) -> Result<(), StoreError> {
        let Some(mut item) = self.load_item(item_id).await? else {
            return Ok(());
        };
        if item.status != ItemStatus::InFlight {
            return Ok(());
        }
        item.status = ItemStatus::Pending;
        self.persist(&item).await
    }

    /// Explicitly re-enqueue an abandoned item (a user action, never
    /// automatic). Resets the attempt counter.
    pub async fn retry_abandoned(&self, item_id: u64) -> Result<bool, StoreError> {
        let Some(mut item) = self.load_item(item_id).await? else {
            return Ok(false);
        };
        if item.status != ItemStatus::Abandoned {
            return Ok(false);
        }
        item.status = ItemStatus::Pending;
        item.attempts = 0;
        item.next_attempt_at = now_millis();
        self.persist(&item).await?;
        crate::metrics::record_queue_op(item.operation.as_ref(), "requeued");
        Ok(true)
    }

    /// Items not yet delivered (pending or in flight). Excludes terminal.
    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        let items = self.load_all().await?;
        Ok(items.iter().filter(|i| !i.status.is_terminal()).count())
    }

    /// Terminally failed items, for UI display and manual retry.
    pub async fn abandoned_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.load_all().await?;
        Ok(items
            .into_iter()
            .filter(|i| i.status == ItemStatus::Abandoned)
            .collect())
    }

    /// Non-terminal items targeting one entity, in enqueue order.
    pub async fn items_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let items = self.load_all().await?;
        Ok(items
            .into_iter()
            .filter(|i| {
                !i.status.is_terminal() && i.entity_kind == kind && i.entity_id == entity_id
            })
            .collect())
    }

    /// Remove a single item row outright (startup integrity repair).
    pub(crate) async fn discard(&self, item_id: u64) -> Result<(), StoreError> {
        self.store
            .delete(Namespace::Queue, &Self::item_key(item_id))
            .await
    }

    /// Startup recovery: items left in-flight by a crashed drain go back to
    /// pending (attempts untouched).
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let items = self.load_all().await?;
        let mut recovered = 0;
        for mut item in items {
            if item.status == ItemStatus::InFlight {
                item.status = ItemStatus::Pending;
                self.persist(&item).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "Recovered in-flight queue items from previous run");
        }
        Ok(recovered)
    }

    /// Remove delivered items. Abandoned items are kept for manual retry.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let items = self.load_all().await?;
        let mut removed = 0;
        let mut batch = WriteBatch::new();
        for item in items {
            if item.status == ItemStatus::Done {
                batch.delete(Namespace::Queue, Self::item_key(item.item_id));
                removed += 1;
            }
        }
        if removed > 0 {
            self.store.apply(batch).await?;
            debug!(removed, "Compacted delivered queue items");
        }
        Ok(removed)
    }

    /// Drop every item, including pending ones. Only the explicit
    /// discard-and-sign-out path calls this.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear(Namespace::Queue).await
    }
}

impl AsRef<str> for Operation {
    fn as_ref(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}
