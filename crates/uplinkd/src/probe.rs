//! Probe Engine (spec §4.3) — one worker task per enabled uplink, each
//! producing a `ProbeSample` stream into the Health State Machine's event
//! channel.
//!
//! Grounded on `strata-agent`'s task-per-worker + `tokio::select!`
//! cancellation pattern (`telemetry.rs`, `pipeline_monitor.rs`) and on
//! `original_source/watchdog/health_monitor.py::_run_ping_test` for the
//! probe parameters and verdict rule.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uplinkd_common::{ProbeParams, ProbeSample};

use crate::events::DaemonEvent;
use crate::host::HostAdapter;

/// Spawn one worker task that probes `uplink` on a fixed interval until
/// cancelled. Cooperative cancellation happens at the sleep and at the
/// probe boundary, with a hard deadline of `2 * timeout` (spec §4.3).
pub fn spawn_probe_worker(
    uplink: String,
    host: Arc<dyn HostAdapter>,
    params: ProbeParams,
    tx: mpsc::Sender<DaemonEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(params.interval_secs);
        let timeout = Duration::from_secs(params.timeout_secs);
        let target = params.targets.first().copied().unwrap_or_else(|| "1.1.1.1".parse().unwrap());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(uplink = %uplink, "probe worker cancelled during sleep");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }

            let sample = tokio::select! {
                result = probe_once(&host, &uplink, target, params.retry_count, params.timeout_secs, &params) => result,
                _ = tokio::time::sleep(timeout * 2) => {
                    warn!(uplink = %uplink, "probe exceeded hard deadline, treating as lost");
                    ProbeSample {
                        timestamp: Utc::now(),
                        uplink: uplink.clone(),
                        target,
                        latency_ms: None,
                        loss_fraction: 1.0,
                        verdict: uplinkd_common::ProbeVerdict::Lost,
                    }
                }
            };

            if tx.send(DaemonEvent::Probe(sample)).await.is_err() {
                debug!(uplink = %uplink, "health state machine channel closed, stopping probe worker");
                return;
            }
        }
    })
}

async fn probe_once(
    host: &Arc<dyn HostAdapter>,
    uplink: &str,
    target: IpAddr,
    count: u32,
    timeout_secs: u64,
    params: &ProbeParams,
) -> ProbeSample {
    let result = host.reachability_probe(uplink, target, count, timeout_secs).await;
    let (latency_ms, loss_fraction) = match result {
        Ok(v) => v,
        Err(e) => {
            warn!(uplink = %uplink, error = %e, "reachability probe failed");
            (None, 1.0)
        }
    };
    let verdict = ProbeSample::classify(loss_fraction, latency_ms, params.max_loss, params.max_latency_ms);
    ProbeSample {
        timestamp: Utc::now(),
        uplink: uplink.to_string(),
        target,
        latency_ms,
        loss_fraction,
        verdict,
    }
}
