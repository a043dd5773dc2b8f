//! `status.json` — the write-only status snapshot polled by collaborators
//! (spec §6). The daemon owns this file exclusively; nothing else writes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall_health: OverallHealth,
    pub service_running: bool,
    pub components: Components,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Components {
    pub health_monitor: HealthMonitorStatus,
    pub route_manager: RouteManagerStatus,
    pub connection_tracker: ConnectionTrackerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorStatus {
    pub healthy_interfaces: u32,
    pub total_interfaces: u32,
    pub interfaces: HashMap<String, InterfaceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub current_status: String,
    pub current_latency: Option<f64>,
    pub current_packet_loss: f64,
    /// Percentage, 0.0-100.0, matching the original field's scale.
    pub uptime_percentage: f64,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteManagerStatus {
    pub active_nexthops: Vec<NexthopStatus>,
    pub default_route_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexthopStatus {
    pub interface: String,
    pub gateway: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTrackerStatus {
    pub tracked_flows: u64,
    pub sticky_flows: u64,
}
