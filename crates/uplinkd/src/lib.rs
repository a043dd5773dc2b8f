//! uplinkd — control-plane daemon for a multi-WAN edge router.
//!
//! - Probes each configured uplink for reachability and latency
//! - Fails over / recovers uplinks with hysteresis
//! - Programs the kernel's default multipath route, per-uplink tables,
//!   and policy rules via the Host Adapter
//! - Classifies new connections by traffic class and pins sticky classes
//!   to a single uplink via connection marks
//! - Exposes a read-only status/control HTTP surface

pub mod bootstrap;
pub mod control;
pub mod error;
pub mod events;
pub mod flow;
pub mod health;
pub mod host;
pub mod inventory;
pub mod probe;
pub mod route;
