//! Shared fake server for integration tests.
//!
//! An in-memory authoritative store with scriptable failure modes: full
//! offline, transient failures for the next N mutations, going offline after
//! N successful mutations, and auth rejection until refresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use medsync::{EntityKind, RemoteError, RemoteRecord, RemoteService, TokenGrant};

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

pub struct FakeServer {
    records: Mutex<HashMap<(EntityKind, String), RemoteRecord>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    /// Go offline after this many more successful mutations (-1 = disabled).
    offline_after: AtomicI64,
    transient_failures: AtomicUsize,
    reject_auth: AtomicBool,
    refresh_ok: AtomicBool,
    refresh_calls: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

#[allow(dead_code)] // not every test file uses every knob
impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            offline_after: AtomicI64::new(-1),
            transient_failures: AtomicUsize::new(0),
            reject_auth: AtomicBool::new(false),
            refresh_ok: AtomicBool::new(true),
            refresh_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if !offline {
            self.offline_after.store(-1, Ordering::SeqCst);
        }
    }

    /// After `n` more successful mutations, start failing as unreachable.
    pub fn go_offline_after(&self, n: i64) {
        self.offline_after.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` mutations with a transient error.
    pub fn fail_transient(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Reject mutations with an auth error until a successful refresh.
    pub fn reject_auth(&self, reject: bool, refresh_ok: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
        self.refresh_ok.store(refresh_ok, Ordering::SeqCst);
    }

    pub fn seed(&self, kind: EntityKind, id: &str, payload: Value, updated_at: i64) {
        self.records.lock().insert(
            (kind, id.to_string()),
            RemoteRecord {
                id: id.to_string(),
                payload,
                updated_at,
            },
        );
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<RemoteRecord> {
        self.records.lock().get(&(kind, id.to_string())).cloned()
    }

    pub fn record_count(&self, kind: EntityKind) -> usize {
        self.records.lock().keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Gate for reads (fetch): offline and auth only. The scripted
    /// transient/outage counters apply to mutations alone so tests can
    /// reason about exactly which delivery attempt fails.
    fn gate_read(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection refused".into()));
        }
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(RemoteError::Auth("token rejected".into()));
        }
        Ok(())
    }

    fn gate_mutation(&self) -> Result<(), RemoteError> {
        self.gate_read()?;

        let failures = self.transient_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.transient_failures.store(failures - 1, Ordering::SeqCst);
            return Err(RemoteError::Transient("503 service unavailable".into()));
        }

        let remaining = self.offline_after.load(Ordering::SeqCst);
        if remaining == 0 {
            self.offline.store(true, Ordering::SeqCst);
            self.offline_after.store(-1, Ordering::SeqCst);
            return Err(RemoteError::Unreachable("connection dropped".into()));
        }
        if remaining > 0 {
            self.offline_after.store(remaining - 1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteService for FakeServer {
    async fn create_record(&self, kind: EntityKind, payload: &Value) -> Result<String, RemoteError> {
        self.gate_mutation()?;
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().insert(
            (kind, id.clone()),
            RemoteRecord {
                id: id.clone(),
                payload: payload.clone(),
                updated_at: now_millis(),
            },
        );
        self.calls.lock().push(format!("create {} {}", kind, id));
        Ok(id)
    }

    async fn update_record(&self, kind: EntityKind, id: &str, payload: &Value) -> Result<(), RemoteError> {
        self.gate_mutation()?;
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&(kind, id.to_string())) else {
            return Err(RemoteError::Permanent(format!("no such record: {}", id)));
        };
        record.payload = payload.clone();
        record.updated_at = now_millis();
        drop(records);
        self.calls.lock().push(format!("update {} {}", kind, id));
        Ok(())
    }

    async fn delete_record(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.gate_mutation()?;
        let removed = self.records.lock().remove(&(kind, id.to_string()));
        if removed.is_none() {
            return Err(RemoteError::Permanent(format!("no such record: {}", id)));
        }
        self.calls.lock().push(format!("delete {} {}", kind, id));
        Ok(())
    }

    async fn fetch_records(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.gate_read()?;
        let mut records: Vec<RemoteRecord> = self
            .records
            .lock()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, RemoteError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection refused".into()));
        }
        if !self.refresh_ok.load(Ordering::SeqCst) {
            return Err(RemoteError::Auth("refresh token revoked".into()));
        }
        self.reject_auth.store(false, Ordering::SeqCst);
        Ok(TokenGrant {
            access_token: "refreshed-token".into(),
            expires_at: now_millis() + 3_600_000,
        })
    }
}

/// A session that stays valid for the whole test.
#[allow(dead_code)]
pub fn test_session() -> medsync::AuthSession {
    medsync::AuthSession {
        user_id: "patient-17".into(),
        access_token: "tok".into(),
        refresh_token: "ref".into(),
        issued_at: now_millis(),
        expires_at: now_millis() + 3_600_000,
    }
}
