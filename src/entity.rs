//! Cached entity data model.
//!
//! An [`Entity`] is the unit that flows through the cache: a domain record
//! (report, prescription, profile) with an opaque JSON payload, a sync state,
//! and an update timestamp. Entities created offline carry a temporary id
//! (`temp-<uuid>`) until the reconciler swaps it for the server-assigned one.
//!
//! # Example
//!
//! ```
//! use medsync::{Entity, EntityKind, SyncState};
//! use serde_json::json;
//!
//! let entity = Entity::new_local(
//!     EntityKind::Report,
//!     json!({"title": "Blood panel", "patientId": "p-17"}),
//! );
//!
//! assert!(entity.id.starts_with("temp-"));
//! assert_eq!(entity.sync_state, SyncState::PendingCreate);
//! assert!(entity.has_temp_id());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Epoch milliseconds for "now". Single clock source for the whole crate.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Prefix for locally-generated temporary ids.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// The kinds of domain records the cache manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Profile,
    Report,
    Prescription,
}

impl EntityKind {
    /// All entity kinds, in a fixed order (used for full refresh sweeps).
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Profile,
        EntityKind::Report,
        EntityKind::Prescription,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Report => "report",
            Self::Prescription => "prescription",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entity stands relative to the authoritative server copy.
///
/// Exactly one state per entity; `pending*` states always have a matching
/// sync queue item (the orphan invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Matches the server copy (as of the last merge).
    Synced,
    /// Created locally, not yet acknowledged by the server.
    PendingCreate,
    /// Local edit not yet acknowledged by the server.
    PendingUpdate,
    /// Deleted locally, removal not yet acknowledged by the server.
    PendingDelete,
}

impl SyncState {
    /// True for any state other than `Synced`.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Synced)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::PendingCreate => write!(f, "pending_create"),
            Self::PendingUpdate => write!(f, "pending_update"),
            Self::PendingDelete => write!(f, "pending_delete"),
        }
    }
}

/// A cached domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Server-assigned id, or a `temp-` id for records created offline.
    pub id: String,
    /// Kind discriminant.
    pub kind: EntityKind,
    /// Opaque domain payload. Round-trips through the remote service unchanged.
    pub payload: Value,
    /// Sync state relative to the server copy.
    pub sync_state: SyncState,
    /// Last local modification, epoch millis. Monotonic per entity.
    pub updated_at: i64,
}

impl Entity {
    /// Create a new locally-born entity with a temporary id and
    /// `PendingCreate` state.
    #[must_use]
    pub fn new_local(kind: EntityKind, payload: Value) -> Self {
        Self {
            id: format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()),
            kind,
            payload,
            sync_state: SyncState::PendingCreate,
            updated_at: now_millis(),
        }
    }

    /// Build an entity from a server-authoritative record.
    #[must_use]
    pub fn from_remote(kind: EntityKind, record: &crate::remote::RemoteRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind,
            payload: record.payload.clone(),
            sync_state: SyncState::Synced,
            updated_at: record.updated_at,
        }
    }

    /// Whether this entity still carries a locally-generated id.
    #[must_use]
    pub fn has_temp_id(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Cached authentication material.
///
/// Lives in its own store namespace, survives restarts, and is refreshed by
/// the reconciler when expired. Deleted on sign-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: String,
    /// Opaque refresh token, only ever handed to the remote auth collaborator.
    pub refresh_token: String,
    /// Epoch millis.
    pub issued_at: i64,
    /// Epoch millis.
    pub expires_at: i64,
}

impl AuthSession {
    /// Whether the access token has expired as of `now` (epoch millis).
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
