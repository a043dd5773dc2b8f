//! `AddUplink` wiring a live probe worker, and sticky-flow classification
//! pinning a connection's mark to a single uplink (spec §8 scenarios 3, 6).

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use uplinkd::events::{AdminCommand, DaemonEvent};
use uplinkd::flow::{self, StickyTable};
use uplinkd::health::HealthStateMachine;
use uplinkd::host::HostAdapter;
use uplinkd_common::config::ConnectionRulesOverlay;
use uplinkd_common::{
    AdminState, Configuration, Counters, Flow, FlowKey, HealthState, ProbeParams, Protocol, TrafficClass, Uplink,
};

use support::MockHost;

fn mk_config() -> Configuration {
    Configuration {
        version: 1,
        uplinks: vec![],
        sticky_classes: Flow::default_sticky_classes().to_vec(),
        probe: ProbeParams {
            retry_count: 3,
            interval_secs: 1,
            timeout_secs: 1,
            ..ProbeParams::default()
        },
        recovery_interval_secs: 30,
    }
}

#[tokio::test]
async fn add_uplink_spawns_a_live_probe_worker() {
    let mock = Arc::new(MockHost::new());
    mock.script("eth2", vec![(Some(8.0), 0.0); 10]);
    let host: Arc<dyn HostAdapter> = mock;

    let config = Arc::new(Mutex::new(mk_config()));
    let (event_tx, event_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sm = HealthStateMachine::new(config.clone(), host, event_tx.clone(), shutdown_rx);
    let sm_handle = tokio::spawn(sm.run(event_rx));

    let new_uplink = Uplink {
        name: "eth2".into(),
        nexthop: "10.0.2.1".parse().unwrap(),
        weight: 1,
        admin_state: AdminState::Enabled,
        health: HealthState::Unknown,
        dns_hint: vec![],
        table_id: 102,
        mark_bits: 0x2,
        counters: Counters::default(),
        description: None,
        auto_detected: false,
    };
    event_tx
        .send(DaemonEvent::Admin(AdminCommand::AddUplink(Box::new(new_uplink))))
        .await
        .unwrap();

    // One real interval tick of the freshly spawned worker.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    {
        let cfg = config.lock().await;
        let uplink = cfg.find_uplink("eth2").expect("eth2 present");
        assert!(uplink.counters.total_probes >= 1, "AddUplink must spawn a live probe worker");
        assert_eq!(uplink.health, HealthState::Healthy);
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), sm_handle).await;
}

#[tokio::test]
async fn sticky_class_pins_to_first_observed_uplink_and_resists_repin() {
    let table = Arc::new(StickyTable::new(Flow::default_sticky_classes().to_vec()));
    let rules = flow::effective_class_rules(&ConnectionRulesOverlay::default());

    let key = FlowKey::canonicalize(
        "192.168.1.50".parse().unwrap(),
        51000,
        "93.184.216.34".parse().unwrap(),
        443,
        Protocol::Tcp,
    );
    let class = flow::classify(443, Protocol::Tcp, &rules);
    assert_eq!(class, TrafficClass::Banking);

    // First observation pins the flow to eth0.
    let mark_eth0 = table.track(key, class, "eth0".into(), 0x0);
    let pinned = table.get(&key).unwrap();
    assert_eq!(pinned.mark, mark_eth0);
    assert_eq!(pinned.assigned_uplink, "eth0");

    // Preferred uplink flips to eth1, but the pinned flow must not move:
    // the flow-observation loop always calls `track()` with the *current*
    // preferred uplink regardless of whether the flow is already pinned.
    table.track(key, class, "eth1".into(), 0x1);
    let still_pinned = table.get(&key).unwrap();
    assert_eq!(still_pinned.assigned_uplink, "eth0");
    assert_eq!(still_pinned.mark, mark_eth0);
}
