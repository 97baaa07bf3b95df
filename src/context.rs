//! Per-application sync context.
//!
//! One [`SyncContext`] wires the whole engine together: local store (with
//! fallback and optional encryption), cache manager, sync queue, reconciler,
//! and connectivity monitor. Collaborators are injected at construction, so
//! multiple independent instances can coexist (and tests build throwaway
//! ones); there are no module-level singletons anywhere.
//!
//! Construction also runs startup reconciliation: stale in-flight queue
//! items are recovered, delivered items compacted, and orphans (a pending
//! entity without a queue item, or the reverse) repaired.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, StatusBoard, SyncStatus};
use crate::entity::{AuthSession, EntityKind, SyncState};
use crate::queue::{Operation, QueueItem, SyncQueue};
use crate::reconciler::{DrainReport, Reconciler, SyncError};
use crate::remote::RemoteService;
use crate::store::encrypted::EncryptedStore;
use crate::store::memory::InMemoryStore;
use crate::store::sqlite::SqliteStore;
use crate::store::traits::{LocalStore, Namespace};

/// Counts of locally cached data, for UI summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfflineSummary {
    pub has_profile: bool,
    pub reports: usize,
    pub prescriptions: usize,
    pub pending: usize,
    pub abandoned: usize,
}

pub struct SyncContext {
    cache: Arc<CacheManager>,
    queue: Arc<SyncQueue>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn LocalStore>,
    status: Arc<StatusBoard>,
    online_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    monitor: parking_lot::Mutex<Option<ConnectivityMonitor>>,
    monitor_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    degraded: bool,
}

impl SyncContext {
    /// Build a context. Opens (or falls back around) the local store, runs
    /// startup reconciliation, and wires every component. Call
    /// [`start`](Self::start) afterwards to launch the background monitor.
    pub async fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteService>,
    ) -> Result<Self, SyncError> {
        let mut degraded = false;

        let store: Arc<dyn LocalStore> = match &config.db_path {
            Some(path) => match SqliteStore::open(path).await {
                Ok(sqlite) => wrap_store(sqlite, config.encryption_passphrase.as_deref()),
                Err(e) => {
                    // Non-fatal: keep the app usable, lose durability
                    warn!(
                        path = %path,
                        error = %e,
                        "Durable store unavailable, degrading to memory-only operation"
                    );
                    crate::metrics::record_degraded_start();
                    degraded = true;
                    wrap_store(InMemoryStore::new(), config.encryption_passphrase.as_deref())
                }
            },
            None => wrap_store(InMemoryStore::new(), config.encryption_passphrase.as_deref()),
        };

        let queue = Arc::new(SyncQueue::open(store.clone(), config.clone()).await?);
        let cache = Arc::new(CacheManager::new(store.clone(), queue.clone()));

        // Startup reconciliation
        queue.recover().await?;
        queue.compact().await?;
        repair_orphans(&cache, &queue).await?;

        let status = StatusBoard::new(SyncStatus {
            degraded,
            ..SyncStatus::default()
        });

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            cache.clone(),
            queue.clone(),
            remote,
            config.clone(),
            status.clone(),
        ));

        let (online_tx, online_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = ConnectivityMonitor::new(
            cache.clone(),
            queue.clone(),
            reconciler.clone(),
            config.clone(),
            status.clone(),
            online_rx,
            shutdown_rx,
        );

        info!(degraded, "Sync context initialized");
        Ok(Self {
            cache,
            queue,
            reconciler,
            store,
            status,
            online_tx,
            shutdown_tx,
            monitor: parking_lot::Mutex::new(Some(monitor)),
            monitor_handle: parking_lot::Mutex::new(None),
            degraded,
        })
    }

    /// Launch the background connectivity monitor. Idempotent.
    pub fn start(&self) {
        let Some(monitor) = self.monitor.lock().take() else {
            return;
        };
        let handle = tokio::spawn(monitor.run());
        *self.monitor_handle.lock() = Some(handle);
    }

    /// Report a reachability transition (from whatever network observer the
    /// host application has).
    pub fn set_online(&self, online: bool) {
        self.online_tx.send_replace(online);
        self.status.set_online(online);
    }

    /// The typed cache façade, for application reads and writes.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Queue introspection (pending counts, abandoned items).
    #[must_use]
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// True when running memory-only because the durable store failed to open.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Subscribe to the status stream (`online`, `sync_in_progress`,
    /// `last_sync_at`, `last_error`, queue depths).
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Manual sync trigger. Coalesced if a drain is already running.
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        self.reconciler.sync_now().await
    }

    /// Store session material after a successful sign-in.
    pub async fn sign_in(&self, session: &AuthSession) -> Result<(), SyncError> {
        self.cache.store_session(session).await?;
        Ok(())
    }

    /// Sign out, rejecting the request while unsynced changes are queued.
    ///
    /// Use [`sign_out_flushed`](Self::sign_out_flushed) to push pending work
    /// first, or [`sign_out_discard`](Self::sign_out_discard) to drop it
    /// explicitly. Abandoned items do not block sign-out; they are already
    /// terminal and kept for inspection.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        let pending = self.queue.pending_count().await?;
        if pending > 0 {
            return Err(SyncError::PendingChanges(pending));
        }
        self.cache.clear_session().await?;
        info!("Signed out");
        Ok(())
    }

    /// Flush the queue with a final drain, then sign out. Fails with
    /// [`SyncError::PendingChanges`] if items remain undeliverable.
    pub async fn sign_out_flushed(&self) -> Result<(), SyncError> {
        self.reconciler.sync_now().await?;
        self.sign_out().await
    }

    /// Explicitly discard all pending work, then sign out.
    ///
    /// Locally created records that never reached the server are removed;
    /// records with discarded edits or deletes revert to `synced` and the
    /// next refresh restores the authoritative copy.
    pub async fn sign_out_discard(&self) -> Result<(), SyncError> {
        let discarded = self.queue.pending_count().await?;
        self.queue.clear().await?;

        for kind in EntityKind::ALL {
            for mut entity in self.cache.read_including_deleted(kind).await? {
                match entity.sync_state {
                    SyncState::Synced => {}
                    SyncState::PendingCreate => {
                        let mut batch = crate::store::traits::WriteBatch::new();
                        CacheManager::stage_entity_delete(&mut batch, kind, &entity.id);
                        self.store.apply(batch).await?;
                    }
                    SyncState::PendingUpdate | SyncState::PendingDelete => {
                        entity.sync_state = SyncState::Synced;
                        let mut batch = crate::store::traits::WriteBatch::new();
                        CacheManager::stage_entity_put(&mut batch, &entity)?;
                        self.store.apply(batch).await?;
                    }
                }
            }
        }

        self.cache.clear_session().await?;
        warn!(discarded, "Signed out, pending changes discarded");
        Ok(())
    }

    /// Explicit, manual re-enqueue of an abandoned queue item.
    pub async fn retry_abandoned(&self, item_id: u64) -> Result<bool, SyncError> {
        Ok(self.queue.retry_abandoned(item_id).await?)
    }

    /// Abandoned items, for UI display next to the retry action.
    pub async fn abandoned_items(&self) -> Result<Vec<QueueItem>, SyncError> {
        Ok(self.queue.abandoned_items().await?)
    }

    /// Counts of cached data and queue depth.
    pub async fn summary(&self) -> Result<OfflineSummary, SyncError> {
        Ok(OfflineSummary {
            has_profile: !self.cache.read(EntityKind::Profile).await?.is_empty(),
            reports: self.cache.read(EntityKind::Report).await?.len(),
            prescriptions: self.cache.read(EntityKind::Prescription).await?.len(),
            pending: self.queue.pending_count().await?,
            abandoned: self.queue.abandoned_items().await?.len(),
        })
    }

    /// Wipe every namespace: cached entities, queue, session.
    pub async fn clear_local_data(&self) -> Result<(), SyncError> {
        for ns in Namespace::ENTITY {
            self.store.clear(ns).await?;
        }
        self.queue.clear().await?;
        self.cache.clear_session().await?;
        info!("All local data cleared");
        Ok(())
    }

    /// Stop the background monitor and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.monitor_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Sync context shut down");
    }
}

fn wrap_store(store: impl LocalStore + 'static, passphrase: Option<&str>) -> Arc<dyn LocalStore> {
    match passphrase {
        Some(passphrase) => Arc::new(EncryptedStore::new(store, passphrase)),
        None => Arc::new(store),
    }
}

/// Startup orphan repair, both directions:
/// - a pending entity with no queue item is re-enqueued from its own state
/// - a queue item whose entity is gone is discarded
///
/// Both are integrity violations that the transactional write path should
/// make impossible; repairs are logged loudly.
async fn repair_orphans(
    cache: &Arc<CacheManager>,
    queue: &Arc<SyncQueue>,
) -> Result<(), SyncError> {
    for kind in EntityKind::ALL {
        for entity in cache.read_including_deleted(kind).await? {
            if !entity.sync_state.is_pending() {
                continue;
            }
            let items = queue.items_for_entity(kind, &entity.id).await?;
            if !items.is_empty() {
                continue;
            }

            warn!(
                kind = %kind,
                id = %entity.id,
                state = %entity.sync_state,
                "Orphaned pending entity found at startup, re-enqueueing"
            );
            let (operation, payload) = match entity.sync_state {
                SyncState::PendingCreate => (Operation::Create, entity.payload.clone()),
                SyncState::PendingUpdate => (Operation::Update, entity.payload.clone()),
                SyncState::PendingDelete => (Operation::Delete, Value::Null),
                SyncState::Synced => continue,
            };
            queue.enqueue(operation, kind, &entity.id, payload).await?;
            crate::metrics::record_orphan("reenqueued");
        }
    }

    for item in queue.load_all().await? {
        if item.status.is_terminal() {
            continue;
        }
        if cache.get_any(item.entity_kind, &item.entity_id).await?.is_none() {
            warn!(
                item_id = item.item_id,
                kind = %item.entity_kind,
                entity = %item.entity_id,
                "Queue item references no cached entity, discarding"
            );
            queue.discard(item.item_id).await?;
            crate::metrics::record_orphan("discarded");
        }
    }

    Ok(())
}
