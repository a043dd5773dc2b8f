//! On-disk configuration formats (spec §6).
//!
//! These mirror the JSON shapes the original `interfaces.json` and
//! `health_monitor.json` files used, so existing bootstrap tooling and
//! operator habits carry over unchanged.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{Protocol, TrafficClass};

/// `interfaces.json` — the WAN/LAN inventory and management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfacesConfig {
    pub wan_interfaces: Vec<WanInterfaceEntry>,
    pub lan_interface: LanInterfaceEntry,
    pub management: ManagementConfig,
    #[serde(default)]
    pub auto_detection: AutoDetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanInterfaceEntry {
    pub name: String,
    pub gateway: String,
    pub weight: u32,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub speed: Option<u64>,
    #[serde(default)]
    pub auto_detected: bool,
    #[serde(default)]
    pub added_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanInterfaceEntry {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    #[serde(default)]
    pub dhcp_range: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    pub web_port: u16,
    pub api_port: u16,
    #[serde(default)]
    pub enable_ssh: bool,
    #[serde(default = "default_true")]
    pub enable_web: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoDetectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rescan_interval_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// `health_monitor.json` — probe/failover tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    pub ping_target: String,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub check_interval: u64,
    pub recovery_interval: u64,
    pub max_latency_ms: f64,
    pub max_packet_loss: f64,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            ping_target: "1.1.1.1".into(),
            timeout_seconds: 2,
            retry_count: 3,
            check_interval: 5,
            recovery_interval: 30,
            max_latency_ms: 2000.0,
            max_packet_loss: 0.05,
            interfaces: Vec::new(),
        }
    }
}

/// A single class's port/protocol matcher, as overridden from the built-in
/// table by the connection-rules overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRule {
    pub ports: Vec<PortRange>,
    pub protocols: Vec<Protocol>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Optional per-class overrides merged into the built-in classifier table
/// at startup (spec §6 "Connection-rules overlay").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionRulesOverlay {
    #[serde(default)]
    pub rules: HashMap<TrafficClass, ClassRule>,
}
