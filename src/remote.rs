//! Remote service collaborator interface.
//!
//! The authoritative document store and auth provider, seen only through this
//! trait. The reconciler is the single component that calls it for mutation
//! traffic; implementations are constructor-injected (no hidden module-level
//! imports), which is also what makes the whole engine testable against an
//! in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entity::EntityKind;

/// Remote failures, classified by how the sync queue should react.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Retryable per-item failure (5xx, rate limit, timeout on one call).
    /// Consumes one retry attempt.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// The service cannot be reached at all (connectivity loss). Does not
    /// consume retry attempts; the reconciler parks until back online.
    #[error("remote service unreachable: {0}")]
    Unreachable(String),
    /// The access token was rejected. Triggers a single refresh attempt.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Non-retryable failure (validation error, missing record on delete).
    /// The item is abandoned without consuming the full retry budget.
    #[error("permanent remote failure: {0}")]
    Permanent(String),
}

/// A server-authoritative record, as returned by `fetch_records`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub payload: Value,
    /// Server-side last-modified, epoch millis.
    pub updated_at: i64,
}

/// Result of a token refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Epoch millis.
    pub expires_at: i64,
}

/// The remote document store plus its auth endpoint.
///
/// Entity payloads must round-trip unchanged through
/// `create_record`/`fetch_records`; no particular wire format is assumed.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Create a record; returns the server-assigned id.
    async fn create_record(&self, kind: EntityKind, payload: &Value) -> Result<String, RemoteError>;

    async fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<(), RemoteError>;

    async fn delete_record(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError>;

    async fn fetch_records(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, RemoteError>;
}
