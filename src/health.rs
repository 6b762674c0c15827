//! In-process component health registry.
//!
//! Each long-running component (gateway, dispatch worker, reminder worker,
//! inactivity scanner) reports liveness here; the gateway exposes the snapshot
//! on `/healthz` and the daemon supervisor bumps restart counters.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Default)]
struct ComponentHealth {
    status: &'static str,
    last_ok: Option<String>,
    last_error: Option<String>,
    restart_count: u64,
}

static REGISTRY: LazyLock<Mutex<HashMap<String, ComponentHealth>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub fn mark_component_ok(name: &str) {
    let mut registry = REGISTRY.lock();
    let entry = registry.entry(name.to_string()).or_default();
    entry.status = "ok";
    entry.last_ok = Some(Utc::now().to_rfc3339());
    entry.last_error = None;
}

pub fn mark_component_error(name: &str, error: impl Into<String>) {
    let mut registry = REGISTRY.lock();
    let entry = registry.entry(name.to_string()).or_default();
    entry.status = "error";
    entry.last_error = Some(error.into());
}

pub fn bump_component_restart(name: &str) {
    let mut registry = REGISTRY.lock();
    let entry = registry.entry(name.to_string()).or_default();
    entry.restart_count += 1;
}

pub fn snapshot_json() -> serde_json::Value {
    let registry = REGISTRY.lock();
    let components: serde_json::Map<String, serde_json::Value> = registry
        .iter()
        .map(|(name, health)| {
            (
                name.clone(),
                serde_json::json!({
                    "status": health.status,
                    "last_ok": health.last_ok,
                    "last_error": health.last_error,
                    "restart_count": health.restart_count,
                }),
            )
        })
        .collect();

    serde_json::json!({
        "status": if components.values().any(|c| c["status"] == "error") { "degraded" } else { "ok" },
        "components": components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_then_error_round_trip() {
        mark_component_ok("health-test-a");
        let snapshot = snapshot_json();
        assert_eq!(snapshot["components"]["health-test-a"]["status"], "ok");

        mark_component_error("health-test-a", "boom");
        let snapshot = snapshot_json();
        let entry = &snapshot["components"]["health-test-a"];
        assert_eq!(entry["status"], "error");
        assert_eq!(entry["last_error"], "boom");
    }

    #[test]
    fn restart_counter_accumulates() {
        bump_component_restart("health-test-b");
        bump_component_restart("health-test-b");
        let snapshot = snapshot_json();
        assert!(snapshot["components"]["health-test-b"]["restart_count"].as_u64() >= Some(2));
    }

    #[test]
    fn ok_clears_previous_error() {
        mark_component_error("health-test-c", "transient");
        mark_component_ok("health-test-c");
        let snapshot = snapshot_json();
        let entry = &snapshot["components"]["health-test-c"];
        assert_eq!(entry["status"], "ok");
        assert!(entry["last_error"].is_null());
    }
}
