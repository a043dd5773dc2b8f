//! Control API (spec §4.7) — read-only status, per-uplink enable/disable,
//! add/remove uplink, and config reload. All mutating operations are
//! serialized through the same queue the Health SM consumes.
//!
//! Grounded on `strata-agent::portal.rs`'s axum `Router` structure
//! (`State<Arc<...>>` extractor, `Json<serde_json::Value>` handlers) and
//! `strata-common::metrics.rs`'s Prometheus renderer for `/metrics`.
//! The admin dashboard, static-file serving, and service start/stop/
//! restart/log-read endpoints from the teacher are out of scope (spec §1)
//! and are not carried over.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tower_http::cors::CorsLayer;
use uplinkd_common::{status::StatusSnapshot, Uplink};

use crate::events::{AdminCommand, DaemonEvent};
use crate::flow::StickyTable;
use crate::health::SharedConfig;
use crate::host::HostAdapter;
use crate::inventory::InterfaceInventory;

/// Operation timeout for mutating Control-API calls (spec §5, default 30s).
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ControlApiState {
    pub config: SharedConfig,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub host: Arc<dyn HostAdapter>,
    pub sticky_table: Arc<StickyTable>,
    /// Pending add-uplink suggestions, filled by the Interface Inventory.
    pub pending_acks: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
}

pub fn router(state: ControlApiState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/uplinks/{name}/enable", post(enable_uplink))
        .route("/api/uplinks/{name}/disable", post(disable_uplink))
        .route("/api/uplinks", post(add_uplink))
        .route("/api/uplinks/{name}", axum::routing::delete(remove_uplink))
        .route("/api/config/reload", post(reload))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status(State(state): State<ControlApiState>) -> Json<serde_json::Value> {
    let config = state.config.lock().await;
    let snapshot = build_snapshot(&config, &state.sticky_table);
    Json(serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null))
}

fn build_snapshot(config: &uplinkd_common::Configuration, sticky_table: &StickyTable) -> StatusSnapshot {
    use uplinkd_common::status::*;
    use uplinkd_common::HealthState;

    let healthy = config
        .uplinks
        .iter()
        .filter(|u| u.health == HealthState::Healthy)
        .count() as u32;
    let total = config.uplinks.len() as u32;

    let interfaces = config
        .uplinks
        .iter()
        .map(|u| {
            (
                u.name.clone(),
                InterfaceStatus {
                    current_status: u.health.to_string(),
                    current_latency: None,
                    current_packet_loss: 0.0,
                    uptime_percentage: u.counters.uptime_ratio() * 100.0,
                    consecutive_failures: u.counters.consecutive_failures,
                    last_check: u.counters.last_transition_at,
                },
            )
        })
        .collect();

    StatusSnapshot {
        timestamp: chrono::Utc::now(),
        overall_health: if healthy > 0 {
            OverallHealth::Healthy
        } else {
            OverallHealth::Failed
        },
        service_running: true,
        components: Components {
            health_monitor: HealthMonitorStatus {
                healthy_interfaces: healthy,
                total_interfaces: total,
                interfaces,
            },
            route_manager: RouteManagerStatus {
                active_nexthops: config
                    .uplinks
                    .iter()
                    .filter(|u| u.is_forwarding())
                    .map(|u| NexthopStatus {
                        interface: u.name.clone(),
                        gateway: u.nexthop.to_string(),
                        weight: u.weight,
                    })
                    .collect(),
                default_route_present: config.uplinks.iter().any(|u| u.is_forwarding()),
            },
            connection_tracker: ConnectionTrackerStatus {
                tracked_flows: sticky_table.len() as u64,
                sticky_flows: sticky_table.sticky_len() as u64,
            },
        },
    }
}

async fn enable_uplink(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    submit(&state, AdminCommand::Enable { uplink: name }).await
}

async fn disable_uplink(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    submit(&state, AdminCommand::Disable { uplink: name }).await
}

#[derive(Debug, Deserialize)]
pub struct AddUplinkRequest {
    pub name: String,
    pub nexthop: Option<std::net::IpAddr>,
    pub weight: Option<u32>,
}

async fn add_uplink(
    State(state): State<ControlApiState>,
    Json(req): Json<AddUplinkRequest>,
) -> impl IntoResponse {
    // Fill blanks from the Interface Inventory's bootstrap suggestions
    // (spec §4.7, §8 scenario 6).
    let (suggested_gateway, suggested_weight) = if req.nexthop.is_none() || req.weight.is_none() {
        let inventory = InterfaceInventory::new(state.host.clone());
        match inventory.detect_all().await {
            Ok(detected) => {
                let found = detected.iter().find(|d| d.name == req.name);
                (
                    found.and_then(|d| d.gateway),
                    found.map(|d| InterfaceInventory::suggest_weight(d.speed_mbps)),
                )
            }
            Err(_) => (None, None),
        }
    } else {
        (None, None)
    };

    let mut config = state.config.lock().await;
    let table_id = config.next_table_id();
    let Some(mark_bits) = config.next_mark_bits() else {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "no free mark bits available"})),
        );
    };
    let uplink = Uplink {
        name: req.name.clone(),
        nexthop: req
            .nexthop
            .or(suggested_gateway)
            .unwrap_or_else(|| "0.0.0.0".parse().unwrap()),
        weight: req.weight.or(suggested_weight).unwrap_or(1),
        admin_state: uplinkd_common::AdminState::Enabled,
        health: uplinkd_common::HealthState::Unknown,
        dns_hint: InterfaceInventory::default_resolvers(),
        table_id,
        mark_bits,
        counters: uplinkd_common::Counters::default(),
        description: None,
        auto_detected: false,
    };
    drop(config);

    if state
        .event_tx
        .send(DaemonEvent::Admin(AdminCommand::AddUplink(Box::new(uplink))))
        .await
        .is_err()
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "health state machine unavailable"})),
        );
    }
    (StatusCode::ACCEPTED, Json(serde_json::json!({"name": req.name})))
}

async fn remove_uplink(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    submit(&state, AdminCommand::RemoveUplink { uplink: name }).await
}

async fn reload(State(state): State<ControlApiState>) -> impl IntoResponse {
    submit(&state, AdminCommand::Reload).await
}

async fn submit(
    state: &ControlApiState,
    cmd: AdminCommand,
) -> (StatusCode, Json<serde_json::Value>) {
    match tokio::time::timeout(OPERATION_TIMEOUT, state.event_tx.send(DaemonEvent::Admin(cmd))).await {
        Ok(Ok(())) => (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "accepted"}))),
        Ok(Err(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "health state machine unavailable"})),
        ),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({"error": "operation timed out, reconciling next probe cycle"})),
        ),
    }
}

async fn metrics(State(state): State<ControlApiState>) -> impl IntoResponse {
    let config = state.config.lock().await;
    let body = uplinkd_common::metrics::render_prometheus(&config.uplinks);
    ([("content-type", "text/plain; version=0.0.4")], body)
}
