//! Connectivity monitor and UI-facing status stream.
//!
//! The application feeds reachability transitions in through
//! [`crate::SyncContext::set_online`]; the monitor debounces flaps (a short
//! grace period before trusting a regained link), runs the periodic drain
//! tick, watches for token expiry, and triggers the reconciler. UI code
//! subscribes to the [`SyncStatus`] watch channel instead of polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::entity::now_millis;
use crate::queue::SyncQueue;
use crate::reconciler::{Reconciler, SyncError, SyncPhase};

/// Snapshot of sync health, published for UI consumption.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStatus {
    pub online: bool,
    pub sync_in_progress: bool,
    /// Completion time of the last drain cycle, epoch millis.
    pub last_sync_at: Option<i64>,
    /// Human-readable description of the last failure, if any.
    pub last_error: Option<String>,
    /// Queue items not yet delivered.
    pub pending: usize,
    /// Queue items terminally failed, awaiting manual retry or discard.
    pub abandoned: usize,
    /// True when the durable store could not be opened and the context is
    /// running memory-only.
    pub degraded: bool,
}

/// Shared writer side of the status stream. The reconciler and the monitor
/// both publish through it.
pub(crate) struct StatusBoard {
    tx: watch::Sender<SyncStatus>,
}

impl StatusBoard {
    pub(crate) fn new(initial: SyncStatus) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initial);
        Arc::new(Self { tx })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.tx.send_modify(|s| s.online = online);
    }

    pub(crate) fn begin_sync(&self) {
        self.tx.send_modify(|s| {
            s.sync_in_progress = true;
            s.last_error = None;
        });
    }

    pub(crate) fn finish_sync(&self, error: Option<String>, at: i64) {
        self.tx.send_modify(|s| {
            s.sync_in_progress = false;
            if error.is_none() {
                s.last_sync_at = Some(at);
            }
            s.last_error = error;
        });
    }

    pub(crate) fn set_counts(&self, pending: usize, abandoned: usize) {
        self.tx.send_modify(|s| {
            s.pending = pending;
            s.abandoned = abandoned;
        });
    }
}

/// Watches reachability and time, and decides when the reconciler runs.
pub(crate) struct ConnectivityMonitor {
    cache: Arc<CacheManager>,
    queue: Arc<SyncQueue>,
    reconciler: Arc<Reconciler>,
    config: SyncConfig,
    status: Arc<StatusBoard>,
    online_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectivityMonitor {
    pub(crate) fn new(
        cache: Arc<CacheManager>,
        queue: Arc<SyncQueue>,
        reconciler: Arc<Reconciler>,
        config: SyncConfig,
        status: Arc<StatusBoard>,
        online_rx: watch::Receiver<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cache,
            queue,
            reconciler,
            config,
            status,
            online_rx,
            shutdown_rx,
        }
    }

    /// Event loop. Runs until the shutdown flag flips.
    pub(crate) async fn run(mut self) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet
        tick.tick().await;

        debug!("Connectivity monitor running");
        loop {
            tokio::select! {
                changed = self.online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *self.online_rx.borrow_and_update();
                    self.status.set_online(online);
                    if online {
                        info!("Connectivity regained");
                        self.debounce_then_drain().await;
                    } else {
                        info!("Connectivity lost, sync paused");
                    }
                }

                _ = tick.tick() => {
                    if *self.online_rx.borrow() {
                        self.drain_if_work_pending().await;
                    }
                }

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Connectivity monitor stopped");
    }

    /// Wait out the grace period, then drain only if the link held.
    async fn debounce_then_drain(&self) {
        if self.config.debounce_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.debounce_ms)).await;
        }
        if !*self.online_rx.borrow() {
            debug!("Link flapped during debounce, drain skipped");
            return;
        }
        // A drain parked in backoff always wants to resume once online
        if self.reconciler.phase() == SyncPhase::Backoff {
            self.trigger().await;
            return;
        }
        self.drain_if_work_pending().await;
    }

    /// Trigger a drain when queue items are due, a refresh pull is wanted,
    /// or the cached token has expired.
    async fn drain_if_work_pending(&self) {
        let now = now_millis();

        let due = self.queue.has_due(now).await.unwrap_or(false);
        let token_expired = matches!(
            self.cache.session().await,
            Ok(Some(session)) if session.is_expired(now)
        );

        if due || token_expired || self.config.pull_after_drain {
            self.trigger().await;
        }
    }

    async fn trigger(&self) {
        match self.reconciler.sync_now().await {
            Ok(report) if report.coalesced => {
                debug!("Drain trigger coalesced into running cycle");
            }
            Ok(_) => {}
            Err(SyncError::AuthExpired) => {
                warn!("Drain blocked: authentication expired");
            }
            Err(e) => {
                warn!(error = %e, "Drain failed");
            }
        }
    }
}
