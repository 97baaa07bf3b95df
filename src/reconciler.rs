// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciler: drains the sync queue against the remote service and merges
//! authoritative results back into the cache.
//!
//! # State machine
//!
//! ```text
//!        connectivity regained / manual sync / periodic tick
//! Idle ──────────────────────────────────────────────────────▶ Draining
//!   ▲                                                             │
//!   │  queue has no due items left                                │
//!   ◀─────────────────────────────────────────────────────────────┤
//!   │                                                             │
//!   │  back online            remote unreachable mid-drain        │
//!   ◀────────── Backoff ◀─────────────────────────────────────────┘
//! ```
//!
//! Only one drain cycle runs at a time; triggers that arrive mid-drain are
//! coalesced into one follow-up cycle, never queued. The reconciler is the
//! sole owner of entity `sync_state` transitions and queue item transitions,
//! and the only component that talks to the remote service for mutations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheManager};
use crate::config::SyncConfig;
use crate::connectivity::StatusBoard;
use crate::entity::{now_millis, AuthSession, EntityKind, SyncState};
use crate::queue::{FailureClass, ItemStatus, Operation, QueueItem, SyncQueue};
use crate::remote::{RemoteError, RemoteService};
use crate::store::traits::{LocalStore, StoreError, WriteBatch};

/// Top-level sync failures surfaced to the application.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Token refresh failed; the user has to re-authenticate before drains
    /// can continue. Queue items are untouched.
    #[error("authentication expired, sign-in required")]
    AuthExpired,
    /// Sign-out was requested while unsynced changes are still queued.
    #[error("sign-out rejected: {0} unsynced changes pending")]
    PendingChanges(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Reconciler phase, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing to do (or waiting for the next trigger).
    Idle,
    /// Actively delivering queue items.
    Draining,
    /// Remote unreachable mid-drain; waiting for connectivity.
    Backoff,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Draining => write!(f, "Draining"),
            Self::Backoff => write!(f, "Backoff"),
        }
    }
}

/// Summary of one `sync_now` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items delivered and acknowledged.
    pub completed: usize,
    /// Items that failed transiently and will retry after backoff.
    pub retried: usize,
    /// Items that became terminally abandoned this cycle.
    pub abandoned: usize,
    /// Server records merged back in by the post-drain pull.
    pub pulled: usize,
    /// True when this call found a drain already running and only scheduled
    /// a follow-up cycle.
    pub coalesced: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
        self.pulled += other.pulled;
    }
}

enum ItemOutcome {
    Completed,
    Retried,
    Abandoned,
    /// Connectivity lost; not the item's fault.
    Unreachable,
    /// Token refresh failed; not the item's fault.
    AuthLost,
}

enum DrainEnd {
    Complete,
    Unreachable,
}

pub struct Reconciler {
    store: Arc<dyn LocalStore>,
    cache: Arc<CacheManager>,
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteService>,
    config: SyncConfig,
    status: Arc<StatusBoard>,
    /// Mutual exclusion: one drain cycle at a time per process.
    drain_lock: Mutex<()>,
    /// Set by triggers that arrive mid-drain; drained cycles check it.
    rerun: AtomicBool,
    phase_tx: watch::Sender<SyncPhase>,
    phase_rx: watch::Receiver<SyncPhase>,
}

impl Reconciler {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        cache: Arc<CacheManager>,
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteService>,
        config: SyncConfig,
        status: Arc<StatusBoard>,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Idle);
        Self {
            store,
            cache,
            queue,
            remote,
            config,
            status,
            drain_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            phase_tx,
            phase_rx,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase_rx.borrow()
    }

    /// Watch phase changes.
    #[must_use]
    pub fn phase_receiver(&self) -> watch::Receiver<SyncPhase> {
        self.phase_rx.clone()
    }

    fn set_phase(&self, phase: SyncPhase) {
        let _ = self.phase_tx.send(phase);
    }

    /// Run a drain cycle now (manual trigger).
    ///
    /// If a cycle is already running the call returns immediately with
    /// `coalesced = true` and the running cycle is followed by exactly one
    /// more, regardless of how many triggers piled up.
    #[tracing::instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            self.rerun.store(true, Ordering::Release);
            debug!("Drain already in progress, coalescing trigger");
            return Ok(DrainReport {
                coalesced: true,
                ..DrainReport::default()
            });
        };

        let mut report = self.drain_cycle().await?;
        while self.rerun.swap(false, Ordering::AcqRel) {
            debug!("Running coalesced follow-up drain cycle");
            report.absorb(self.drain_cycle().await?);
        }
        Ok(report)
    }

    async fn drain_cycle(&self) -> Result<DrainReport, SyncError> {
        let start = Instant::now();
        let mut report = DrainReport::default();

        self.set_phase(SyncPhase::Draining);
        self.status.begin_sync();

        let end = self.drain_queue(&mut report).await;
        self.publish_depth().await;

        match end {
            Ok(DrainEnd::Complete) => {
                if self.config.pull_after_drain {
                    report.pulled = self.pull_remote().await;
                    self.publish_depth().await;
                }
                self.set_phase(SyncPhase::Idle);
                self.status.finish_sync(None, now_millis());
                crate::metrics::record_drain(start.elapsed());
                info!(
                    completed = report.completed,
                    retried = report.retried,
                    abandoned = report.abandoned,
                    pulled = report.pulled,
                    "Drain cycle complete"
                );
                Ok(report)
            }
            Ok(DrainEnd::Unreachable) => {
                self.set_phase(SyncPhase::Backoff);
                self.status
                    .finish_sync(Some("remote unreachable, waiting for connectivity".into()), now_millis());
                warn!("Remote unreachable mid-drain, backing off until online");
                Ok(report)
            }
            Err(e) => {
                self.set_phase(SyncPhase::Idle);
                self.status.finish_sync(Some(e.to_string()), now_millis());
                Err(e)
            }
        }
    }

    async fn drain_queue(&self, report: &mut DrainReport) -> Result<DrainEnd, SyncError> {
        // Refresh an already-expired token up front so the batch does not
        // burn a round of per-item auth failures.
        if let Some(session) = self.cache.session().await? {
            if session.is_expired(now_millis()) {
                debug!("Cached token expired, refreshing before drain");
                self.refresh_session().await?;
            }
        }

        loop {
            let batch = self
                .queue
                .next_batch(self.config.drain_batch_size, now_millis())
                .await?;
            if batch.is_empty() {
                return Ok(DrainEnd::Complete);
            }

            let mut items = batch.into_iter();
            while let Some(item) = items.next() {
                match self.process_item(&item).await? {
                    ItemOutcome::Completed => report.completed += 1,
                    ItemOutcome::Retried => report.retried += 1,
                    ItemOutcome::Abandoned => report.abandoned += 1,
                    ItemOutcome::Unreachable => {
                        self.release_rest(items).await?;
                        return Ok(DrainEnd::Unreachable);
                    }
                    ItemOutcome::AuthLost => {
                        self.release_rest(items).await?;
                        return Err(SyncError::AuthExpired);
                    }
                }
            }
        }
    }

    /// Return untouched in-flight items to pending (no attempt consumed).
    async fn release_rest(
        &self,
        items: impl Iterator<Item = QueueItem>,
    ) -> Result<(), StoreError> {
        for item in items {
            self.queue.release(item.item_id).await?;
        }
        Ok(())
    }

    async fn process_item(&self, item: &QueueItem) -> Result<ItemOutcome, SyncError> {
        match self.send_op(item).await {
            Err(RemoteError::Auth(msg)) => {
                debug!(item_id = item.item_id, error = %msg, "Auth rejected, attempting one token refresh");
                if self.refresh_session().await.is_err() {
                    self.queue.release(item.item_id).await?;
                    return Ok(ItemOutcome::AuthLost);
                }
                let second = self.send_op(item).await;
                self.settle(item, second).await
            }
            first => self.settle(item, first).await,
        }
    }

    async fn settle(
        &self,
        item: &QueueItem,
        result: Result<Option<String>, RemoteError>,
    ) -> Result<ItemOutcome, SyncError> {
        match result {
            Ok(server_id) => {
                self.acknowledge(item, server_id).await?;
                crate::metrics::record_remote_call(item.operation.as_ref(), "completed");
                Ok(ItemOutcome::Completed)
            }
            Err(RemoteError::Unreachable(msg)) => {
                warn!(item_id = item.item_id, error = %msg, "Remote unreachable");
                crate::metrics::record_remote_call(item.operation.as_ref(), "unreachable");
                self.queue.release(item.item_id).await?;
                Ok(ItemOutcome::Unreachable)
            }
            Err(RemoteError::Transient(msg)) => {
                crate::metrics::record_remote_call(item.operation.as_ref(), "transient");
                let status = self
                    .queue
                    .mark_failed(item.item_id, &msg, FailureClass::Transient)
                    .await?;
                Ok(if status == ItemStatus::Abandoned {
                    ItemOutcome::Abandoned
                } else {
                    ItemOutcome::Retried
                })
            }
            Err(RemoteError::Permanent(msg)) => {
                crate::metrics::record_remote_call(item.operation.as_ref(), "permanent");
                self.queue
                    .mark_failed(item.item_id, &msg, FailureClass::Permanent)
                    .await?;
                Ok(ItemOutcome::Abandoned)
            }
            Err(RemoteError::Auth(msg)) => {
                // Still rejected after the one refresh attempt
                warn!(item_id = item.item_id, error = %msg, "Auth still rejected after refresh");
                crate::metrics::record_remote_call(item.operation.as_ref(), "auth");
                self.queue.release(item.item_id).await?;
                Ok(ItemOutcome::AuthLost)
            }
        }
    }

    async fn send_op(&self, item: &QueueItem) -> Result<Option<String>, RemoteError> {
        match item.operation {
            Operation::Create => self
                .remote
                .create_record(item.entity_kind, &item.payload)
                .await
                .map(Some),
            Operation::Update => self
                .remote
                .update_record(item.entity_kind, &item.entity_id, &item.payload)
                .await
                .map(|()| None),
            Operation::Delete => self
                .remote
                .delete_record(item.entity_kind, &item.entity_id)
                .await
                .map(|()| None),
        }
    }

    /// Apply the local consequences of a successful delivery. Entity state
    /// and queue item transition land in one storage transaction.
    async fn acknowledge(&self, item: &QueueItem, server_id: Option<String>) -> Result<(), SyncError> {
        match item.operation {
            Operation::Create => {
                let server_id = server_id.unwrap_or_else(|| item.entity_id.clone());
                self.complete_create(item, &server_id).await
            }
            Operation::Update => self.complete_update(item).await,
            Operation::Delete => self.complete_delete(item).await,
        }
    }

    /// Acknowledged create: atomically rewrite the temporary id to the
    /// server-assigned one across the entity row AND every later queue item
    /// that still references it. Nothing holds the temporary id afterward.
    async fn complete_create(&self, item: &QueueItem, server_id: &str) -> Result<(), SyncError> {
        let temp_id = &item.entity_id;
        let mut batch = WriteBatch::new();

        let mut remaining = self
            .queue
            .items_for_entity(item.entity_kind, temp_id)
            .await?;
        remaining.retain(|i| i.item_id != item.item_id);

        for queued in &remaining {
            let mut rewritten = queued.clone();
            rewritten.entity_id = server_id.to_string();
            self.queue.stage_put(&mut batch, &rewritten)?;
        }

        match self.cache.get_any(item.entity_kind, temp_id).await? {
            Some(mut entity) => {
                CacheManager::stage_entity_delete(&mut batch, item.entity_kind, temp_id);
                entity.id = server_id.to_string();
                entity.sync_state = Self::state_after(&remaining);
                CacheManager::stage_entity_put(&mut batch, &entity)?;
            }
            None => {
                warn!(
                    temp_id = %temp_id,
                    server_id = %server_id,
                    "Acknowledged create has no cached entity"
                );
                crate::metrics::record_orphan("missing_entity_on_create_ack");
            }
        }

        let mut done = item.clone();
        done.entity_id = server_id.to_string();
        done.status = ItemStatus::Done;
        self.queue.stage_put(&mut batch, &done)?;

        self.store.apply(batch).await?;
        crate::metrics::record_queue_op("create", "done");
        info!(temp_id = %temp_id, server_id = %server_id, "Create acknowledged, id rewritten");
        Ok(())
    }

    async fn complete_update(&self, item: &QueueItem) -> Result<(), SyncError> {
        let mut batch = WriteBatch::new();

        let mut remaining = self
            .queue
            .items_for_entity(item.entity_kind, &item.entity_id)
            .await?;
        remaining.retain(|i| i.item_id != item.item_id);

        if let Some(mut entity) = self.cache.get_any(item.entity_kind, &item.entity_id).await? {
            // Only settle to synced once no later local edits are queued
            if remaining.is_empty() && entity.sync_state == SyncState::PendingUpdate {
                entity.sync_state = SyncState::Synced;
                CacheManager::stage_entity_put(&mut batch, &entity)?;
            }
        }

        let mut done = item.clone();
        done.status = ItemStatus::Done;
        self.queue.stage_put(&mut batch, &done)?;

        self.store.apply(batch).await?;
        crate::metrics::record_queue_op("update", "done");
        Ok(())
    }

    async fn complete_delete(&self, item: &QueueItem) -> Result<(), SyncError> {
        let mut batch = WriteBatch::new();
        CacheManager::stage_entity_delete(&mut batch, item.entity_kind, &item.entity_id);

        let mut done = item.clone();
        done.status = ItemStatus::Done;
        self.queue.stage_put(&mut batch, &done)?;

        self.store.apply(batch).await?;
        crate::metrics::record_queue_op("delete", "done");
        Ok(())
    }

    fn state_after(remaining: &[QueueItem]) -> SyncState {
        if remaining.iter().any(|i| i.operation == Operation::Delete) {
            SyncState::PendingDelete
        } else if remaining.iter().any(|i| i.operation == Operation::Update) {
            SyncState::PendingUpdate
        } else {
            SyncState::Synced
        }
    }

    /// One token refresh attempt. On failure the caller surfaces
    /// `AuthExpired`; queue attempts are never charged for auth problems.
    async fn refresh_session(&self) -> Result<(), SyncError> {
        let Some(session) = self.cache.session().await? else {
            return Err(SyncError::AuthExpired);
        };

        match self.remote.refresh_token(&session.refresh_token).await {
            Ok(grant) => {
                let refreshed = AuthSession {
                    access_token: grant.access_token,
                    expires_at: grant.expires_at,
                    issued_at: now_millis(),
                    ..session
                };
                self.cache.store_session(&refreshed).await?;
                info!("Access token refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                Err(SyncError::AuthExpired)
            }
        }
    }

    /// Post-drain pull: fetch authoritative records per kind and merge them.
    /// Failures here are logged, not fatal; the next cycle tries again.
    async fn pull_remote(&self) -> usize {
        let mut merged = 0;
        for kind in EntityKind::ALL {
            match self.remote.fetch_records(kind).await {
                Ok(records) => match self.cache.refresh_from_remote(kind, &records).await {
                    Ok(outcome) => merged += outcome.applied + outcome.superseded,
                    Err(e) => warn!(kind = %kind, error = %e, "Post-drain merge failed"),
                },
                Err(RemoteError::Unreachable(msg)) => {
                    warn!(kind = %kind, error = %msg, "Remote unreachable during pull, skipping rest");
                    break;
                }
                Err(e) => warn!(kind = %kind, error = %e, "Post-drain fetch failed"),
            }
        }
        merged
    }

    async fn publish_depth(&self) {
        let pending = self.queue.pending_count().await.unwrap_or(0);
        let abandoned = self.queue.abandoned_items().await.map(|v| v.len()).unwrap_or(0);
        crate::metrics::set_queue_depth(pending, abandoned);
        self.status.set_counts(pending, abandoned);
    }
}
