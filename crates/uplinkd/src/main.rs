//! uplinkd — control-plane daemon for a multi-WAN edge router.
//!
//! - Probes each configured uplink for reachability and latency
//! - Fails over / recovers uplinks with hysteresis
//! - Programs the kernel's default multipath route, per-uplink tables,
//!   and policy rules via the Host Adapter
//! - Classifies new connections by traffic class and pins sticky classes
//!   to a single uplink via connection marks
//! - Observes live conntrack flows and pins sticky classes to their
//!   assigned uplink's connection mark
//! - Exposes a read-only status/control HTTP surface

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex};
use tracing_subscriber::EnvFilter;
use uplinkd::bootstrap::{self, ConfigPaths};
use uplinkd::control::ControlApiState;
use uplinkd::events::DaemonEvent;
use uplinkd::flow::{self, ClassMatcher};
use uplinkd::health::HealthStateMachine;
use uplinkd::host::{HostAdapter, RealHostAdapter};
use uplinkd::route::RouteProgrammer;

/// uplinkd — multi-WAN failover and routing control plane.
#[derive(Parser, Debug)]
#[command(name = "uplinkd", about = "Multi-WAN edge router control plane")]
struct Cli {
    /// Path to the interfaces configuration JSON file.
    #[arg(long, default_value = "/etc/uplinkd/interfaces.json")]
    interfaces_config: String,

    /// Path to the health-monitor tuning JSON file. Defaults to
    /// `health_monitor.json` alongside `interfaces_config`.
    #[arg(long)]
    health_monitor_config: Option<String>,

    /// Path to the connection-rules overlay JSON file. Defaults to
    /// `connection_rules.json` alongside `interfaces_config`.
    #[arg(long)]
    connection_rules_config: Option<String>,

    /// Path to append newline-delimited event-log entries to.
    #[arg(long, default_value = "/var/log/uplinkd/events.jsonl")]
    event_log: String,

    /// HTTP bind address for the Control API.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_addr: String,

    /// Run with a mock Host Adapter instead of touching the kernel
    /// (local development / CI).
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Graceful shutdown grace period in seconds (spec §5, default 10).
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Poll interval for the conntrack flow-observation task, in seconds.
    #[arg(long, default_value_t = 2)]
    flow_poll_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::info!(bind_addr = %cli.bind_addr, dry_run = cli.dry_run, "uplinkd starting");

    let mut config_paths = ConfigPaths::from_interfaces_path(&cli.interfaces_config);
    if let Some(p) = &cli.health_monitor_config {
        config_paths.health_monitor = PathBuf::from(p);
    }
    if let Some(p) = &cli.connection_rules_config {
        config_paths.connection_rules = PathBuf::from(p);
    }

    let (config, overlay) = bootstrap::load(&config_paths, None)
        .map_err(|e| anyhow::anyhow!("fatal configuration error: {e}"))?;
    let config = Arc::new(Mutex::new(config));

    let host: Arc<dyn HostAdapter> = Arc::new(RealHostAdapter::new());

    // Install the classifier's packet-filter program once at startup; it is
    // re-installed whenever the configuration is reloaded (spec §4.6).
    let rules: Arc<std::sync::Mutex<Vec<ClassMatcher>>> =
        Arc::new(std::sync::Mutex::new(flow::effective_class_rules(&overlay)));
    {
        let current_rules = rules.lock().unwrap().clone();
        if let Err(e) = host.install_filter_program(&flow::build_rule_set(&current_rules)).await {
            tracing::warn!(error = %e, "failed to install filter program at startup");
        }
    }
    let sticky_table = Arc::new(flow::StickyTable::new({
        let cfg = config.lock().await;
        cfg.sticky_classes.clone()
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);

    // ── Health State Machine: sole consumer of the event channel; it
    // bootstraps a fast-cadence probe worker per enabled uplink itself ──
    let health_sm = HealthStateMachine::new(config.clone(), host.clone(), event_tx.clone(), shutdown_rx.clone())
        .with_sticky_table(sticky_table.clone())
        .with_event_log_path(PathBuf::from(&cli.event_log))
        .with_config_paths(config_paths)
        .with_rule_store(rules.clone());
    let mut health_handle = tokio::spawn(async move {
        health_sm.run(event_rx).await;
    });

    // ── Control API ──────────────────────────────────────────────
    let control_state = ControlApiState {
        config: config.clone(),
        event_tx: event_tx.clone(),
        host: host.clone(),
        sticky_table: sticky_table.clone(),
        pending_acks: Arc::new(Mutex::new(Vec::new())),
    };
    let app = uplinkd::control::router(control_state);
    let bind_addr: SocketAddr = cli.bind_addr.parse()?;
    let control_handle = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "failed to bind control API listener");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "control API server exited");
        }
    });

    // Periodic sticky-table cleanup sweep (spec §4.6, default max_age 3600s).
    let sweep_table = sticky_table.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(300)) => {
                    let removed = sweep_table.sweep(flow::DEFAULT_MAX_AGE_SECS, chrono::Utc::now());
                    if removed > 0 {
                        tracing::debug!(removed, "swept stale sticky flows");
                    }
                }
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // Flow-observation task (spec §4.6 item 2): polls live conntrack flows,
    // classifies each by traffic class, and restores the kernel connection
    // mark for flows the sticky table has already pinned. Uses the stored
    // mark for already-tracked flows rather than the mark `track()` would
    // compute for the *current* preferred uplink, so a sticky flow is never
    // silently re-pinned when the preferred uplink changes underneath it.
    let flow_host = host.clone();
    let flow_config = config.clone();
    let flow_table = sticky_table.clone();
    let flow_rules = rules.clone();
    let mut flow_shutdown = shutdown_rx.clone();
    let flow_poll = std::time::Duration::from_secs(cli.flow_poll_secs);
    let flow_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(flow_poll) => {
                    run_flow_observation(&flow_host, &flow_config, &flow_table, &flow_rules).await;
                }
                _ = flow_shutdown.changed() => {
                    if *flow_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
        result = &mut health_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "health state machine task failed");
            }
        }
    }

    let grace = std::time::Duration::from_secs(cli.shutdown_grace_secs);
    if !health_handle.is_finished() {
        let _ = tokio::time::timeout(grace, health_handle).await;
    }
    control_handle.abort();
    sweep_handle.abort();
    flow_handle.abort();

    tracing::info!("uplinkd stopped");
    Ok(())
}

/// One flow-observation pass: list conntrack flows, classify each, track it
/// in the advisory sticky table, and restore the kernel mark for flows the
/// table already has pinned.
async fn run_flow_observation(
    host: &Arc<dyn HostAdapter>,
    config: &uplinkd::health::SharedConfig,
    sticky_table: &Arc<flow::StickyTable>,
    rules: &Arc<std::sync::Mutex<Vec<ClassMatcher>>>,
) {
    let flows = match host.list_conntrack_flows().await {
        Ok(flows) => flows,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list conntrack flows");
            return;
        }
    };
    if flows.is_empty() {
        return;
    }

    let preferred = {
        let cfg = config.lock().await;
        RouteProgrammer::preferred_uplink(&cfg).map(|u| (u.name.clone(), u.mark_bits))
    };
    let Some((preferred_name, preferred_mark_bits)) = preferred else {
        return;
    };

    let class_rules = rules.lock().unwrap().clone();
    for observed in flows {
        let key = uplinkd_common::FlowKey::canonicalize(
            observed.src,
            observed.sport,
            observed.dst,
            observed.dport,
            observed.proto,
        );
        let class = flow::classify(observed.dport, observed.proto, &class_rules);
        sticky_table.track(key, class, preferred_name.clone(), preferred_mark_bits);

        if let Some(tracked) = sticky_table.get(&key) {
            if tracked.sticky {
                if let Err(e) = host.set_conntrack_mark(&observed, tracked.mark).await {
                    tracing::warn!(error = %e, "failed to restore conntrack mark for sticky flow");
                }
            }
        }
    }
}
