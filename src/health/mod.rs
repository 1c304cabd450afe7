//! Process-wide link health, one component per account (`whatsapp:<account>`).

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Unlinked,
    Pairing,
    Linked,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: LinkStatus,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

static REGISTRY: OnceLock<HealthRegistry> = OnceLock::new();

fn registry() -> &'static HealthRegistry {
    REGISTRY.get_or_init(|| HealthRegistry {
        started_at: Instant::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn component_name(account_id: &str) -> String {
    format!("whatsapp:{account_id}")
}

fn upsert_account<F>(account_id: &str, update: F)
where
    F: FnOnce(&mut ComponentHealth),
{
    if let Ok(mut map) = registry().components.lock() {
        let now = now_rfc3339();
        let entry = map
            .entry(component_name(account_id))
            .or_insert_with(|| ComponentHealth {
                status: LinkStatus::Unlinked,
                updated_at: now.clone(),
                last_ok: None,
                last_error: None,
                restart_count: 0,
            });
        update(entry);
        entry.updated_at = now;
    }
}

/// A QR was issued and the account is waiting for the phone.
pub fn mark_pairing(account_id: &str) {
    upsert_account(account_id, |entry| {
        entry.status = LinkStatus::Pairing;
    });
}

pub fn mark_linked(account_id: &str) {
    upsert_account(account_id, |entry| {
        entry.status = LinkStatus::Linked;
        entry.last_ok = Some(now_rfc3339());
        entry.last_error = None;
    });
}

pub fn mark_failed(account_id: &str, error: impl ToString) {
    let err = error.to_string();
    upsert_account(account_id, move |entry| {
        entry.status = LinkStatus::Error;
        entry.last_error = Some(err);
    });
}

/// The credential is gone (logout, revoked on the phone, cancelled attempt).
pub fn mark_unlinked(account_id: &str) {
    upsert_account(account_id, |entry| {
        entry.status = LinkStatus::Unlinked;
    });
}

pub fn bump_restart(account_id: &str) {
    upsert_account(account_id, |entry| {
        entry.restart_count = entry.restart_count.saturating_add(1);
    });
}

pub fn account(account_id: &str) -> Option<ComponentHealth> {
    registry()
        .components
        .lock()
        .ok()
        .and_then(|map| map.get(&component_name(account_id)).cloned())
}

pub fn snapshot() -> HealthSnapshot {
    let components = registry()
        .components
        .lock()
        .map_or_else(|_| BTreeMap::new(), |map| map.clone());

    HealthSnapshot {
        pid: std::process::id(),
        updated_at: now_rfc3339(),
        uptime_seconds: registry().started_at.elapsed().as_secs(),
        components,
    }
}

pub fn snapshot_json() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or_else(|_| {
        serde_json::json!({
            "status": "error",
            "message": "failed to serialize health snapshot"
        })
    })
}
