// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic medsync usage example.
//!
//! Demonstrates:
//! 1. Building a sync context over a local SQLite store
//! 2. Creating records while offline (temporary ids, pending state)
//! 3. Coming online and draining the sync queue
//! 4. The temp-id → server-id rewrite and server-wins merge
//! 5. Clean shutdown
//!
//! The "server" here is a tiny in-process stub so the example runs with no
//! external services:
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use medsync::{
    AuthSession, EntityKind, Mutation, RemoteError, RemoteRecord, RemoteService, SyncConfig,
    SyncContext, TokenGrant,
};

/// Minimal in-process stand-in for the authoritative server.
struct DemoServer {
    records: Mutex<HashMap<(EntityKind, String), RemoteRecord>>,
    next_id: AtomicU64,
}

impl DemoServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RemoteService for DemoServer {
    async fn create_record(&self, kind: EntityKind, payload: &Value) -> Result<String, RemoteError> {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().insert(
            (kind, id.clone()),
            RemoteRecord {
                id: id.clone(),
                payload: payload.clone(),
                updated_at: 0,
            },
        );
        Ok(id)
    }

    async fn update_record(&self, kind: EntityKind, id: &str, payload: &Value) -> Result<(), RemoteError> {
        match self.records.lock().get_mut(&(kind, id.to_string())) {
            Some(record) => {
                record.payload = payload.clone();
                Ok(())
            }
            None => Err(RemoteError::Permanent(format!("no such record: {}", id))),
        }
    }

    async fn delete_record(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.records.lock().remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn fetch_records(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, RemoteError> {
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
        Ok(TokenGrant {
            access_token: "demo-token".into(),
            expires_at: i64::MAX,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              medsync: Basic Usage Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Build the context
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Building sync context...");

    let config = SyncConfig {
        db_path: Some("./medsync_demo.db".into()),
        // Short debounce so the demo moves quickly
        debounce_ms: 100,
        ..Default::default()
    };

    let server = DemoServer::new();
    let ctx = SyncContext::new(config, server.clone()).await?;
    ctx.start();

    ctx.sign_in(&AuthSession {
        user_id: "patient-17".into(),
        access_token: "demo-token".into(),
        refresh_token: "demo-refresh".into(),
        issued_at: 0,
        expires_at: i64::MAX,
    })
    .await?;
    println!("   ✅ Context ready (signed in as patient-17)");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Create records while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Creating reports while OFFLINE...");

    let first = ctx
        .cache()
        .write(
            EntityKind::Report,
            Mutation::Create {
                payload: json!({"title": "Blood panel", "patientId": "patient-17"}),
            },
        )
        .await?;
    let second = ctx
        .cache()
        .write(
            EntityKind::Report,
            Mutation::Create {
                payload: json!({"title": "X-ray", "patientId": "patient-17"}),
            },
        )
        .await?;

    println!("   └─ Created: {}", first);
    println!("   └─ Created: {}", second);

    for report in ctx.cache().read(EntityKind::Report).await? {
        println!(
            "   └─ Cached: {} [{}] {}",
            report.id, report.sync_state, report.payload["title"]
        );
    }

    let summary = ctx.summary().await?;
    println!("   ⏳ Pending sync items: {}", summary.pending);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Come online and drain
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Going online and draining the queue...");
    ctx.set_online(true);
    let report = ctx.sync_now().await?;
    println!(
        "   ✅ Drain complete: {} delivered, {} pulled back",
        report.completed, report.pulled
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Observe the id rewrite
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 After sync (temporary ids rewritten to server ids):");
    for report in ctx.cache().read(EntityKind::Report).await? {
        println!(
            "   └─ {} [{}] {}",
            report.id, report.sync_state, report.payload["title"]
        );
    }

    let status = ctx.status_receiver().borrow().clone();
    println!(
        "\n📊 Status: online={} pending={} abandoned={} last_sync_at={:?}",
        status.online, status.pending, status.abandoned, status.last_sync_at
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    ctx.shutdown().await;

    for suffix in ["", "-shm", "-wal"] {
        let _ = std::fs::remove_file(format!("./medsync_demo.db{}", suffix));
    }
    println!("   ✅ Done (demo database removed)\n");

    Ok(())
}
