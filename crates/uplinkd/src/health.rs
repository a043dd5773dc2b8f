//! Health State Machine (spec §4.4) — single-threaded consumer of the
//! event channel; serializes state transitions and drives the Route
//! Programmer and Flow Classifier directly, since both are only invoked
//! from this task's context (spec §5).
//!
//! Grounded on `original_source/watchdog/health_monitor.py`'s
//! `_check_interface_health` / `_should_trigger_failover` / `_check_recovery`,
//! restructured into the explicit state machine the original only implies.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};
use uplinkd_common::{
    event_log::{EventLogEntry, EventType},
    AdminState, Configuration, HealthState, ProbeParams, ProbeVerdict, Uplink,
};

use crate::bootstrap::ConfigPaths;
use crate::events::{AdminCommand, DaemonEvent, Transition};
use crate::flow::{self, ClassMatcher, StickyTable};
use crate::host::HostAdapter;
use crate::route::RouteProgrammer;

/// Shared, lock-guarded configuration. The Control API's reader path takes
/// this lock only for the duration of a snapshot copy (spec §4.7).
pub type SharedConfig = Arc<Mutex<Configuration>>;

pub struct HealthStateMachine {
    config: SharedConfig,
    route: RouteProgrammer,
    host: Arc<dyn HostAdapter>,
    sticky_table: Option<Arc<StickyTable>>,
    event_log: Vec<EventLogEntry>,
    event_log_path: Option<PathBuf>,
    last_recovery_attempt: HashMap<String, chrono::DateTime<chrono::Utc>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    shutdown: watch::Receiver<bool>,
    probe_workers: HashMap<String, tokio::task::JoinHandle<()>>,
    config_paths: Option<ConfigPaths>,
    rules: Option<Arc<std::sync::Mutex<Vec<ClassMatcher>>>>,
}

impl HealthStateMachine {
    pub fn new(
        config: SharedConfig,
        host: Arc<dyn HostAdapter>,
        event_tx: mpsc::Sender<DaemonEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            route: RouteProgrammer::new(host.clone()),
            host,
            sticky_table: None,
            event_log: Vec::new(),
            event_log_path: None,
            last_recovery_attempt: HashMap::new(),
            event_tx,
            shutdown,
            probe_workers: HashMap::new(),
            config_paths: None,
            rules: None,
        }
    }

    /// Attach the advisory sticky table so failed/removed uplinks drop
    /// their pinned flows (spec §4.5: orphaned flows rehash to a survivor).
    pub fn with_sticky_table(mut self, sticky_table: Arc<StickyTable>) -> Self {
        self.sticky_table = Some(sticky_table);
        self
    }

    /// Persist every logged event to this path as it's produced (spec §4.7
    /// event log), in addition to the in-memory ring kept for the Control
    /// API's recent-events endpoint.
    pub fn with_event_log_path(mut self, path: PathBuf) -> Self {
        self.event_log_path = Some(path);
        self
    }

    /// Paths used to re-read configuration on `AdminCommand::Reload`.
    /// Without this, `Reload` is a no-op (e.g. in unit tests).
    pub fn with_config_paths(mut self, paths: ConfigPaths) -> Self {
        self.config_paths = Some(paths);
        self
    }

    /// Shared classifier rule table, updated in place on reload so the
    /// flow-observation task sees the new effective rules immediately.
    pub fn with_rule_store(mut self, rules: Arc<std::sync::Mutex<Vec<ClassMatcher>>>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn events(&self) -> &[EventLogEntry] {
        &self.event_log
    }

    fn log_event(&mut self, event_type: EventType, message: impl Into<String>, data: serde_json::Value) {
        let entry = EventLogEntry::new(event_type, message, data);
        if let Some(path) = &self.event_log_path {
            Self::append_event_line(path, &entry);
        }
        self.event_log.push(entry);
    }

    fn append_event_line(path: &std::path::Path, entry: &EventLogEntry) {
        let line = match entry.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize event log entry");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to append event log entry");
        }
    }

    /// Start a fast-cadence probe worker for `uplink`, replacing any prior
    /// one. Called for every uplink that becomes enabled and non-failed
    /// (at bootstrap, on `Enable`, on `AddUplink`, on `Recovered`).
    fn spawn_worker(&mut self, uplink: &str, params: ProbeParams) {
        self.suspend_worker(uplink);
        let handle = crate::probe::spawn_probe_worker(
            uplink.to_string(),
            self.host.clone(),
            params,
            self.event_tx.clone(),
            self.shutdown.clone(),
        );
        self.probe_workers.insert(uplink.to_string(), handle);
    }

    /// Stop `uplink`'s fast-cadence probe worker, if any. Called on
    /// `Disable`, `RemoveUplink`, and a transition to `Failed` — once an
    /// uplink is failed, only the recovery supervisor's coarse-cadence
    /// `recovery_probe` may bring it back (spec §4.4).
    fn suspend_worker(&mut self, uplink: &str) {
        if let Some(handle) = self.probe_workers.remove(uplink) {
            handle.abort();
        }
    }

    /// Spawn workers for every uplink that should be actively probed at
    /// startup: enabled and not already failed.
    async fn bootstrap_probe_workers(&mut self) {
        let targets: Vec<(String, ProbeParams)> = {
            let config = self.config.lock().await;
            config
                .uplinks
                .iter()
                .filter(|u| u.admin_state == AdminState::Enabled && u.health != HealthState::Failed)
                .map(|u| (u.name.clone(), config.probe.clone()))
                .collect()
        };
        for (name, params) in targets {
            self.spawn_worker(&name, params);
        }
    }

    fn shutdown_all_workers(&mut self) {
        for (_, handle) in self.probe_workers.drain() {
            handle.abort();
        }
    }

    /// Consume events until `rx` closes or shutdown fires. This is the
    /// single task that ever calls into the Route Programmer, so kernel
    /// command sequences are serialized system-wide.
    pub async fn run(mut self, mut rx: mpsc::Receiver<DaemonEvent>) {
        self.bootstrap_probe_workers().await;

        // Recovery supervisor: re-arms a probe for each failed uplink every
        // `recovery_interval_secs` (spec §4.4). `recovery_probe` itself
        // debounces per-uplink, so a coarse tick here is sufficient.
        let mut recovery_tick = tokio::time::interval(std::time::Duration::from_secs(5));
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = recovery_tick.tick() => {
                    self.run_recovery_sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown_all_workers();
    }

    /// Re-probe every currently-failed, enabled uplink and apply any
    /// resulting recovery transition.
    async fn run_recovery_sweep(&mut self) {
        let (failed, recovery_interval_secs) = {
            let config = self.config.lock().await;
            let failed: Vec<String> = config
                .uplinks
                .iter()
                .filter(|u| u.admin_state == AdminState::Enabled && u.health == HealthState::Failed)
                .map(|u| u.name.clone())
                .collect();
            (failed, config.recovery_interval_secs)
        };
        for uplink_name in failed {
            if let Some(transition) = self
                .recovery_probe(&uplink_name, recovery_interval_secs as i64)
                .await
            {
                self.apply_transition(transition).await;
            }
        }
    }

    async fn handle_event(&mut self, event: DaemonEvent) {
        let transition = match event {
            DaemonEvent::Probe(sample) => self.on_probe(sample).await,
            DaemonEvent::Admin(cmd) => self.on_admin(cmd).await,
        };

        if let Some(transition) = transition {
            self.apply_transition(transition).await;
        }
    }

    /// Transition rules per spec §4.4.
    async fn on_probe(&mut self, sample: uplinkd_common::ProbeSample) -> Option<Transition> {
        let mut config = self.config.lock().await;
        let retry_count = config.probe.retry_count;

        let uplink = config.find_uplink_mut(&sample.uplink)?;
        if uplink.admin_state == AdminState::Disabled {
            // Disabled forces failed regardless of probes (admin precedence).
            return None;
        }
        if uplink.health == HealthState::Failed {
            // Once failed, only the recovery supervisor may resurrect this
            // uplink; a stray fast-cadence sample (e.g. racing the worker's
            // own cancellation) must not.
            return None;
        }

        uplink.counters.total_probes += 1;
        let was_healthy = uplink.health == HealthState::Healthy;
        let previous_health = uplink.health;

        let transition = match sample.verdict {
            ProbeVerdict::Reachable => {
                uplink.counters.successful_probes += 1;
                uplink.counters.consecutive_failures = 0;
                uplink.health = HealthState::Healthy;
                uplink.counters.last_transition_at = Some(sample.timestamp);
                match previous_health {
                    HealthState::Failed => Some(Transition::Recovered {
                        uplink: sample.uplink.clone(),
                    }),
                    HealthState::Testing | HealthState::Unknown => Some(Transition::EnabledUp {
                        uplink: sample.uplink.clone(),
                    }),
                    HealthState::Degraded => Some(Transition::Promoted {
                        uplink: sample.uplink.clone(),
                    }),
                    HealthState::Healthy => None,
                }
            }
            ProbeVerdict::Degraded => {
                uplink.counters.consecutive_failures += 1;
                let demoted = uplink.health != HealthState::Degraded;
                uplink.health = HealthState::Degraded;
                uplink.counters.last_transition_at = Some(sample.timestamp);
                if demoted {
                    Some(Transition::Demoted {
                        uplink: sample.uplink.clone(),
                    })
                } else {
                    None
                }
            }
            ProbeVerdict::Lost => {
                uplink.counters.consecutive_failures += 1;
                let should_fail =
                    uplink.counters.consecutive_failures >= retry_count || was_healthy;
                if should_fail && uplink.health != HealthState::Failed {
                    uplink.health = HealthState::Failed;
                    uplink.counters.last_transition_at = Some(sample.timestamp);
                    Some(Transition::Failed {
                        uplink: sample.uplink.clone(),
                    })
                } else {
                    None
                }
            }
        };
        drop(config);
        transition
    }

    async fn on_admin(&mut self, cmd: AdminCommand) -> Option<Transition> {
        match cmd {
            AdminCommand::Enable { uplink } => {
                let probe_params = {
                    let mut config = self.config.lock().await;
                    let u = config.find_uplink_mut(&uplink)?;
                    u.admin_state = AdminState::Enabled;
                    u.health = HealthState::Testing;
                    u.counters.consecutive_failures = 0;
                    config.probe.clone()
                };
                self.spawn_worker(&uplink, probe_params);
                self.log_event(
                    EventType::ManualEnable,
                    format!("{uplink} manually enabled"),
                    serde_json::json!({"interface": uplink}),
                );
                Some(Transition::EnabledUp { uplink })
            }
            AdminCommand::Disable { uplink } => {
                let found = {
                    let mut config = self.config.lock().await;
                    let u = config.find_uplink_mut(&uplink);
                    if let Some(u) = u {
                        u.admin_state = AdminState::Disabled;
                        u.health = HealthState::Failed;
                        true
                    } else {
                        false
                    }
                };
                if !found {
                    return None;
                }
                self.suspend_worker(&uplink);
                self.log_event(
                    EventType::ManualDisable,
                    format!("{uplink} manually disabled"),
                    serde_json::json!({"interface": uplink}),
                );
                Some(Transition::Failed { uplink })
            }
            AdminCommand::AddUplink(uplink) => {
                let name = uplink.name.clone();
                let should_probe = uplink.admin_state == AdminState::Enabled;
                let probe_params = {
                    let mut config = self.config.lock().await;
                    config.uplinks.push(*uplink);
                    config.probe.clone()
                };
                if should_probe {
                    self.spawn_worker(&name, probe_params);
                }
                self.log_event(
                    EventType::ManualEnable,
                    format!("{name} added"),
                    serde_json::json!({"interface": name}),
                );
                Some(Transition::EnabledUp { uplink: name })
            }
            AdminCommand::RemoveUplink { uplink } => {
                let found = {
                    let config = self.config.lock().await;
                    config.find_uplink(&uplink).map(|u| (u.table_id, u.mark_bits))
                };
                let (table_id, mark_bits) = found?;
                {
                    let mut config = self.config.lock().await;
                    config.uplinks.retain(|u| u.name != uplink);
                }
                self.suspend_worker(&uplink);
                Some(Transition::DisabledDown {
                    uplink,
                    table_id,
                    mark_bits,
                })
            }
            AdminCommand::Reload => {
                self.reload().await;
                None
            }
        }
    }

    /// Re-read `interfaces.json` plus the health-monitor/connection-rules
    /// overlays and, only if the new configuration parses and validates
    /// cleanly, replace the live `Configuration` and re-install the
    /// classifier filter program (spec §4.7 "Reload").
    async fn reload(&mut self) {
        let Some(paths) = self.config_paths.clone() else {
            warn!("reload requested but no config paths were configured; ignoring");
            return;
        };

        let previous = self.config.lock().await.clone();
        match crate::bootstrap::load(&paths, Some(&previous)) {
            Ok((new_config, overlay)) => {
                let new_rules = flow::effective_class_rules(&overlay);
                if let Err(e) = self
                    .host
                    .install_filter_program(&flow::build_rule_set(&new_rules))
                    .await
                {
                    warn!(error = %e, "failed to install filter program after reload");
                }
                if let Some(rules) = &self.rules {
                    *rules.lock().unwrap() = new_rules;
                }
                *self.config.lock().await = new_config;
                info!("configuration reloaded");
                self.log_event(
                    EventType::Reload,
                    "configuration reloaded",
                    serde_json::json!({}),
                );
            }
            Err(e) => {
                warn!(error = %e, "reload failed, keeping previous configuration");
                self.log_event(
                    EventType::ReloadFailed,
                    format!("reload failed: {e}"),
                    serde_json::json!({"error": e.to_string()}),
                );
            }
        }
    }

    async fn apply_transition(&mut self, transition: Transition) {
        let uplink_name = transition.uplink().to_string();
        let mut departed: Vec<(String, u32, u8)> = Vec::new();

        match &transition {
            Transition::Failed { .. } => {
                let ids = {
                    let config = self.config.lock().await;
                    config.find_uplink(&uplink_name).map(|u| (u.table_id, u.mark_bits))
                };
                if let Some((table_id, mark_bits)) = ids {
                    self.route.on_failed(&uplink_name, table_id, mark_bits).await;
                }
                self.suspend_worker(&uplink_name);
                if let Some(sticky_table) = &self.sticky_table {
                    sticky_table.drop_uplink(&uplink_name);
                }
                warn!(uplink = %uplink_name, "uplink failed");
                self.log_event(
                    EventType::Failover,
                    format!("{uplink_name} failed"),
                    serde_json::json!({"interface": uplink_name}),
                );
            }
            Transition::Recovered { .. } => {
                let probe_params = {
                    let config = self.config.lock().await;
                    config.probe.clone()
                };
                self.spawn_worker(&uplink_name, probe_params);
                info!(uplink = %uplink_name, "uplink recovered");
                self.log_event(
                    EventType::Recovery,
                    format!("{uplink_name} recovered"),
                    serde_json::json!({"interface": uplink_name}),
                );
            }
            Transition::EnabledUp { .. } | Transition::Promoted { .. } | Transition::Demoted { .. } => {
                info!(uplink = %uplink_name, transition = ?transition, "health transition");
            }
            Transition::DisabledDown { table_id, mark_bits, .. } => {
                if let Some(sticky_table) = &self.sticky_table {
                    sticky_table.drop_uplink(&uplink_name);
                }
                departed.push((uplink_name.clone(), *table_id, *mark_bits));
                info!(uplink = %uplink_name, "uplink removed");
            }
        }

        let config = self.config.lock().await.clone();
        self.route.reprogram(&config, &departed).await;
    }

    /// One-shot recovery probe for a failed uplink: the admin state stays
    /// disabled-equivalent (the uplink receives no traffic) until the
    /// verdict is reachable (spec §9 open question b; fixes the original's
    /// brief re-enable-then-reprobe).
    pub async fn recovery_probe(&mut self, uplink_name: &str, recovery_interval_secs: i64) -> Option<Transition> {
        let now = chrono::Utc::now();
        if let Some(last) = self.last_recovery_attempt.get(uplink_name) {
            if (now - *last).num_seconds() < recovery_interval_secs {
                return None;
            }
        }
        self.last_recovery_attempt.insert(uplink_name.to_string(), now);

        let (target, timeout_secs, retry_count) = {
            let config = self.config.lock().await;
            (
                config.probe.targets.first().copied()?,
                config.probe.timeout_secs,
                config.probe.retry_count,
            )
        };
        let (latency_ms, loss_fraction) = self
            .host
            .reachability_probe(uplink_name, target, retry_count, timeout_secs)
            .await
            .ok()?;

        let config = self.config.lock().await;
        let params = config.probe.clone();
        drop(config);
        let verdict =
            uplinkd_common::ProbeSample::classify(loss_fraction, latency_ms, params.max_loss, params.max_latency_ms);

        if verdict == ProbeVerdict::Reachable {
            let mut config = self.config.lock().await;
            if let Some(u) = config.find_uplink_mut(uplink_name) {
                u.health = HealthState::Healthy;
                u.counters.consecutive_failures = 0;
            }
            drop(config);
            Some(Transition::Recovered {
                uplink: uplink_name.to_string(),
            })
        } else {
            None
        }
    }
}
