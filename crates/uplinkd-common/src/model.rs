//! Core data model: uplinks, probe samples, flows, traffic classes.
//!
//! Mirrors spec §3. Field names match the on-disk JSON formats in
//! `config`/`status` where the two overlap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator intent for an uplink, independent of observed health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Enabled,
    Disabled,
}

/// Observed health of an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Testing,
    Healthy,
    Degraded,
    Failed,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Testing => "testing",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Rolling health counters for a single uplink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub total_probes: u64,
    pub successful_probes: u64,
    pub consecutive_failures: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl Counters {
    /// `successful_probes / total_probes`, matching the original's
    /// `get_interface_stats` (`successful / max(total, 1)`): an uplink with
    /// no probes yet has zero observed uptime, not full uptime.
    pub fn uptime_ratio(&self) -> f64 {
        if self.total_probes == 0 {
            return 0.0;
        }
        self.successful_probes as f64 / self.total_probes as f64
    }
}

/// A logical WAN attachment managed by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uplink {
    pub name: String,
    pub nexthop: std::net::IpAddr,
    pub weight: u32,
    pub admin_state: AdminState,
    pub health: HealthState,
    pub dns_hint: Vec<std::net::IpAddr>,
    /// Unique per-uplink routing-table id, >= 100.
    pub table_id: u32,
    /// Unique per-uplink connection-mark nibble (0x0-0xf).
    pub mark_bits: u8,
    pub counters: Counters,
    /// Free-text description carried from bootstrap/operator input.
    #[serde(default)]
    pub description: Option<String>,
    /// Set when this uplink was proposed by the Interface Inventory rather
    /// than added explicitly by an operator.
    #[serde(default)]
    pub auto_detected: bool,
}

impl Uplink {
    /// True while the uplink participates in the active multipath route.
    pub fn is_forwarding(&self) -> bool {
        self.admin_state == AdminState::Enabled && self.health == HealthState::Healthy
    }
}

/// Outcome of a single reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeVerdict {
    Reachable,
    Degraded,
    Lost,
}

/// An immutable probe result. Created by the Probe Engine, consumed by
/// the Health State Machine, optionally recorded by the historical store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    pub timestamp: DateTime<Utc>,
    pub uplink: String,
    pub target: std::net::IpAddr,
    pub latency_ms: Option<f64>,
    pub loss_fraction: f64,
    pub verdict: ProbeVerdict,
}

impl ProbeSample {
    /// Sample verdict rule per spec §4.3.
    pub fn classify(
        loss_fraction: f64,
        latency_ms: Option<f64>,
        max_loss: f64,
        max_latency_ms: f64,
    ) -> ProbeVerdict {
        if loss_fraction >= 1.0 {
            return ProbeVerdict::Lost;
        }
        let latency_exceeded = latency_ms.map(|l| l > max_latency_ms).unwrap_or(false);
        if loss_fraction > max_loss || latency_exceeded {
            return ProbeVerdict::Degraded;
        }
        ProbeVerdict::Reachable
    }
}

/// Closed set of traffic classes, each with a mark nibble value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    General,
    Voip,
    Gaming,
    Streaming,
    Banking,
}

impl TrafficClass {
    /// High-nibble mark value for this class, per spec §4.6.
    pub fn mark_nibble(self) -> u8 {
        match self {
            TrafficClass::General => 0x0,
            TrafficClass::Voip => 0x1,
            TrafficClass::Gaming => 0x2,
            TrafficClass::Banking => 0x3,
            TrafficClass::Streaming => 0x4,
        }
    }

    pub fn all() -> [TrafficClass; 5] {
        [
            TrafficClass::General,
            TrafficClass::Voip,
            TrafficClass::Gaming,
            TrafficClass::Streaming,
            TrafficClass::Banking,
        ]
    }
}

impl std::fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrafficClass::General => "general",
            TrafficClass::Voip => "voip",
            TrafficClass::Gaming => "gaming",
            TrafficClass::Streaming => "streaming",
            TrafficClass::Banking => "banking",
        };
        write!(f, "{s}")
    }
}

/// L4 protocol recognized by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Canonical 5-tuple flow key. `src`/`sport` and `dst`/`dport` are ordered
/// so both directions of a bidirectional flow hash to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub addr_a: std::net::IpAddr,
    pub port_a: u16,
    pub addr_b: std::net::IpAddr,
    pub port_b: u16,
    pub proto: Protocol,
}

impl FlowKey {
    /// Canonicalize a directional (src, sport) -> (dst, dport) observation.
    /// Swaps the endpoints when `sport >= dport`, per spec §4.6, so both
    /// directions of a connection collapse onto one key.
    pub fn canonicalize(
        src: std::net::IpAddr,
        sport: u16,
        dst: std::net::IpAddr,
        dport: u16,
        proto: Protocol,
    ) -> Self {
        if sport >= dport {
            FlowKey {
                addr_a: dst,
                port_a: dport,
                addr_b: src,
                port_b: sport,
                proto,
            }
        } else {
            FlowKey {
                addr_a: src,
                port_a: sport,
                addr_b: dst,
                port_b: dport,
                proto,
            }
        }
    }
}

/// A tracked connection, keyed by its canonical 5-tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub key: FlowKey,
    pub traffic_class: TrafficClass,
    pub assigned_uplink: String,
    /// Full 32-bit connection mark (class nibble | uplink nibble).
    pub mark: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub packets: u64,
    pub bytes: u64,
    pub sticky: bool,
}

impl Flow {
    /// Default set of traffic classes pinned to a single uplink for their
    /// lifetime, per spec §3.
    pub fn default_sticky_classes() -> [TrafficClass; 2] {
        [TrafficClass::Banking, TrafficClass::Voip]
    }

    /// Build the 32-bit connection mark: high nibble = class, next nibble =
    /// uplink's `mark_bits`, remaining bits reserved (zero).
    pub fn build_mark(class: TrafficClass, uplink_mark_bits: u8) -> u32 {
        ((class.mark_nibble() as u32) << 28) | ((uplink_mark_bits as u32 & 0xf) << 24)
    }
}

/// Probe-loop tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeParams {
    pub targets: Vec<std::net::IpAddr>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub max_latency_ms: f64,
    pub max_loss: f64,
}

impl Default for ProbeParams {
    fn default() -> Self {
        Self {
            targets: vec!["1.1.1.1".parse().unwrap()],
            interval_secs: 5,
            timeout_secs: 2,
            retry_count: 3,
            max_latency_ms: 2000.0,
            max_loss: 0.05,
        }
    }
}

/// The full versioned configuration document (spec §3 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub version: u64,
    pub uplinks: Vec<Uplink>,
    pub sticky_classes: Vec<TrafficClass>,
    pub probe: ProbeParams,
    pub recovery_interval_secs: u64,
}

impl Configuration {
    pub fn find_uplink(&self, name: &str) -> Option<&Uplink> {
        self.uplinks.iter().find(|u| u.name == name)
    }

    pub fn find_uplink_mut(&mut self, name: &str) -> Option<&mut Uplink> {
        self.uplinks.iter_mut().find(|u| u.name == name)
    }

    /// Smallest table_id >= 100 not already assigned.
    pub fn next_table_id(&self) -> u32 {
        let mut candidate = 100;
        let used: std::collections::HashSet<u32> =
            self.uplinks.iter().map(|u| u.table_id).collect();
        while used.contains(&candidate) {
            candidate += 1;
        }
        candidate
    }

    /// Smallest mark nibble (0x0-0xf) not already assigned.
    pub fn next_mark_bits(&self) -> Option<u8> {
        let used: std::collections::HashSet<u8> =
            self.uplinks.iter().map(|u| u.mark_bits).collect();
        (0u8..=0xf).find(|candidate| !used.contains(candidate))
    }
}
