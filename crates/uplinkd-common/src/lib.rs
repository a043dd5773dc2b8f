//! Shared data model and on-disk formats for uplinkd.
//!
//! Kept dependency-free of tokio/axum so it can be used from both the
//! daemon binary and its tests without pulling in the async runtime.

pub mod config;
pub mod event_log;
pub mod metrics;
pub mod model;
pub mod status;

pub use model::{
    AdminState, Configuration, Counters, Flow, FlowKey, HealthState, ProbeParams, ProbeSample,
    ProbeVerdict, Protocol, TrafficClass, Uplink,
};
