//! # medsync
//!
//! An offline-first, write-through record cache with a durable sync queue
//! and background reconciliation against a single authoritative server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application / UI                        │
//! │  • read()/write() via the Cache Manager                    │
//! │  • subscribes to the SyncStatus watch stream               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache Manager                         │
//! │  • serves reads from the local store, never the network    │
//! │  • writes entity + queue item in ONE transaction           │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │       Local Store        │   │         Sync Queue           │
//! │  • SQLite (WAL mode)     │   │  • FIFO per entity           │
//! │  • memory fallback       │   │  • bounded retry + backoff   │
//! │  • optional encryption   │   │  • durable item state rows   │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                                               │
//!                                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reconciler                           │
//! │  Idle → Draining → Backoff state machine                   │
//! │  • drains due items against the Remote Service             │
//! │  • temp-id → server-id rewrite on acknowledged creates     │
//! │  • merges authoritative records back (server wins)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ triggers (debounced, periodic)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Connectivity Monitor                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use medsync::{SyncConfig, SyncContext, EntityKind, Mutation, RemoteService};
//! use serde_json::json;
//!
//! # async fn example(remote: Arc<dyn RemoteService>) -> Result<(), medsync::SyncError> {
//! let config = SyncConfig {
//!     db_path: Some("./medsync.db".into()),
//!     ..Default::default()
//! };
//!
//! let ctx = SyncContext::new(config, remote).await?;
//! ctx.start();
//!
//! // Writes land locally first and queue for background delivery
//! let id = ctx.cache()
//!     .write(EntityKind::Report, Mutation::Create {
//!         payload: json!({"title": "Blood panel", "patientId": "p-17"}),
//!     })
//!     .await?;
//!
//! // Reads never block on the network
//! let reports = ctx.cache().read(EntityKind::Report).await?;
//! assert!(reports.iter().any(|r| r.id == id));
//!
//! // Tell the engine the link is up; the monitor debounces and drains
//! ctx.set_online(true);
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - **Orphan invariant**: a pending entity and its queue item are written in
//!   one storage transaction; neither can exist without the other.
//! - **Per-entity ordering**: mutations of one entity are delivered strictly
//!   in enqueue order; a create is never overtaken by its own update/delete.
//! - **Bounded retry**: transient failures back off exponentially and give up
//!   after a configured number of attempts; abandoned items are only ever
//!   retried by explicit user action.
//! - **Server wins**: on read-back after sync, authoritative records replace
//!   synced local copies unconditionally and pending edits by timestamp.
//!
//! ## Modules
//!
//! - [`context`]: [`SyncContext`], the per-application instance wiring it all
//! - [`cache`]: typed read/write façade over the local store
//! - [`queue`]: durable FIFO-per-entity sync queue
//! - [`reconciler`]: the drain state machine
//! - [`connectivity`]: debounced triggers and the UI status stream
//! - [`store`]: SQLite / memory / encrypted storage backends
//! - [`remote`]: the injected remote service interface

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod entity;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod retry;
pub mod store;

#[cfg(test)]
mod test_support;

pub use cache::{CacheError, CacheManager, Mutation, RefreshOutcome};
pub use config::SyncConfig;
pub use connectivity::SyncStatus;
pub use context::{OfflineSummary, SyncContext};
pub use entity::{AuthSession, Entity, EntityKind, SyncState, TEMP_ID_PREFIX};
pub use queue::{FailureClass, ItemStatus, Operation, QueueItem, SyncQueue};
pub use reconciler::{DrainReport, Reconciler, SyncError, SyncPhase};
pub use remote::{RemoteError, RemoteRecord, RemoteService, TokenGrant};
pub use retry::RetryConfig;
pub use store::encrypted::EncryptedStore;
pub use store::memory::InMemoryStore;
pub use store::sqlite::SqliteStore;
pub use store::traits::{BatchOp, LocalStore, Namespace, StoreError, WriteBatch};
