//! Configuration bootstrap and reload (spec §4.7, §6).
//!
//! Reads `interfaces.json` (required) plus the optional `health_monitor.json`
//! and connection-rules overlay, and merges them into a `Configuration`.
//! Grounded on `original_source/config/config_loader.py`'s layered
//! defaults-then-file-then-validate loading.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use uplinkd_common::config::{ConnectionRulesOverlay, HealthMonitorConfig, InterfacesConfig};
use uplinkd_common::{AdminState, Configuration, Counters, HealthState, ProbeParams, Uplink};

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub interfaces: PathBuf,
    pub health_monitor: PathBuf,
    pub connection_rules: PathBuf,
}

impl ConfigPaths {
    /// Derive the optional overlay paths from the required interfaces-file
    /// path's directory, matching the original's convention of keeping all
    /// three config files alongside each other.
    pub fn from_interfaces_path(interfaces: impl Into<PathBuf>) -> Self {
        let interfaces = interfaces.into();
        let dir = interfaces.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            health_monitor: dir.join("health_monitor.json"),
            connection_rules: dir.join("connection_rules.json"),
            interfaces,
        }
    }
}

/// Load (or reload) the full configuration set. `previous` carries forward
/// `table_id`/`mark_bits`/`admin_state`/`health`/`counters` for uplinks that
/// survive the reload so in-flight probes and routes aren't disturbed
/// (spec §7: a reload must not reset live state); new uplinks get freshly
/// allocated ids that avoid every id still in use by a surviving one.
pub fn load(
    paths: &ConfigPaths,
    previous: Option<&Configuration>,
) -> anyhow::Result<(Configuration, ConnectionRulesOverlay)> {
    let raw = std::fs::read_to_string(&paths.interfaces)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", paths.interfaces.display()))?;
    let parsed: InterfacesConfig = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing {}: {e}", paths.interfaces.display()))?;

    let health_monitor = load_optional::<HealthMonitorConfig>(&paths.health_monitor)?.unwrap_or_default();
    let overlay = load_optional::<ConnectionRulesOverlay>(&paths.connection_rules)?.unwrap_or_default();

    let probe = ProbeParams {
        targets: health_monitor
            .ping_target
            .parse()
            .map(|ip| vec![ip])
            .unwrap_or_else(|_| ProbeParams::default().targets),
        interval_secs: health_monitor.check_interval,
        timeout_secs: health_monitor.timeout_seconds,
        retry_count: health_monitor.retry_count,
        max_latency_ms: health_monitor.max_latency_ms,
        max_loss: health_monitor.max_packet_loss,
    };

    let mut used_table_ids: HashSet<u32> = HashSet::new();
    let mut used_mark_bits: HashSet<u8> = HashSet::new();
    if let Some(prev) = previous {
        for u in &prev.uplinks {
            if parsed.wan_interfaces.iter().any(|e| e.name == u.name) {
                used_table_ids.insert(u.table_id);
                used_mark_bits.insert(u.mark_bits);
            }
        }
    }

    let mut uplinks = Vec::with_capacity(parsed.wan_interfaces.len());
    for entry in &parsed.wan_interfaces {
        let carried = previous.and_then(|p| p.find_uplink(&entry.name));
        let nexthop = entry
            .gateway
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid gateway for {}: {e}", entry.name))?;
        let dns_hint = entry.dns.iter().filter_map(|s| s.parse().ok()).collect::<Vec<_>>();

        let (table_id, mark_bits, admin_state, health, counters) = match carried {
            Some(prev_uplink) => (
                prev_uplink.table_id,
                prev_uplink.mark_bits,
                prev_uplink.admin_state,
                prev_uplink.health,
                prev_uplink.counters.clone(),
            ),
            None => {
                let table_id = next_free_table_id(&mut used_table_ids);
                let mark_bits = (0u8..=0xf)
                    .find(|c| !used_mark_bits.contains(c))
                    .ok_or_else(|| anyhow::anyhow!("exhausted 16 available mark bits"))?;
                used_mark_bits.insert(mark_bits);
                (table_id, mark_bits, AdminState::Enabled, HealthState::Unknown, Counters::default())
            }
        };

        uplinks.push(Uplink {
            name: entry.name.clone(),
            nexthop,
            weight: entry.weight,
            admin_state,
            health,
            dns_hint,
            table_id,
            mark_bits,
            counters,
            description: entry.description.clone(),
            auto_detected: entry.auto_detected,
        });
    }

    let config = Configuration {
        version: previous.map(|p| p.version + 1).unwrap_or(1),
        uplinks,
        sticky_classes: uplinkd_common::Flow::default_sticky_classes().to_vec(),
        probe,
        recovery_interval_secs: health_monitor.recovery_interval,
    };
    Ok((config, overlay))
}

fn next_free_table_id(used: &mut HashSet<u32>) -> u32 {
    let mut candidate = 100;
    while used.contains(&candidate) {
        candidate += 1;
    }
    used.insert(candidate);
    candidate
}

fn load_optional<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let parsed = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
            Ok(Some(parsed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!("reading {}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const INTERFACES_JSON: &str = r#"{
        "wan_interfaces": [{"name": "eth0", "gateway": "10.0.0.1", "weight": 2}],
        "lan_interface": {"name": "eth2", "ip": "192.168.1.1", "netmask": "255.255.255.0"},
        "management": {"web_port": 8080, "api_port": 8081}
    }"#;

    fn write_tmp(tag: &str, name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("uplinkd-bootstrap-test-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_interfaces_with_defaults_when_overlays_absent() {
        let interfaces = write_tmp("defaults", "interfaces.json", INTERFACES_JSON);
        let paths = ConfigPaths {
            health_monitor: interfaces.parent().unwrap().join("missing_health_monitor.json"),
            connection_rules: interfaces.parent().unwrap().join("missing_connection_rules.json"),
            interfaces,
        };
        let (config, overlay) = load(&paths, None).unwrap();
        assert_eq!(config.uplinks.len(), 1);
        assert_eq!(config.uplinks[0].table_id, 100);
        assert_eq!(config.recovery_interval_secs, HealthMonitorConfig::default().recovery_interval);
        assert!(overlay.rules.is_empty());
    }

    #[test]
    fn reload_preserves_table_id_and_health_for_surviving_uplink() {
        let interfaces = write_tmp("reload", "interfaces.json", INTERFACES_JSON);
        let paths = ConfigPaths {
            health_monitor: interfaces.parent().unwrap().join("missing_health_monitor.json"),
            connection_rules: interfaces.parent().unwrap().join("missing_connection_rules.json"),
            interfaces,
        };
        let (first, _) = load(&paths, None).unwrap();
        let mut prev = first.clone();
        prev.uplinks[0].health = HealthState::Healthy;
        prev.uplinks[0].counters.total_probes = 42;

        let (second, _) = load(&paths, Some(&prev)).unwrap();
        assert_eq!(second.uplinks[0].table_id, prev.uplinks[0].table_id);
        assert_eq!(second.uplinks[0].health, HealthState::Healthy);
        assert_eq!(second.uplinks[0].counters.total_probes, 42);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn reload_allocates_fresh_ids_for_new_uplinks_avoiding_survivors() {
        let two_uplinks = r#"{
            "wan_interfaces": [
                {"name": "eth0", "gateway": "10.0.0.1", "weight": 2},
                {"name": "eth1", "gateway": "10.0.1.1", "weight": 1}
            ],
            "lan_interface": {"name": "eth2", "ip": "192.168.1.1", "netmask": "255.255.255.0"},
            "management": {"web_port": 8080, "api_port": 8081}
        }"#;
        let interfaces = write_tmp("grow", "interfaces.json", two_uplinks);
        let paths = ConfigPaths {
            health_monitor: interfaces.parent().unwrap().join("missing_health_monitor.json"),
            connection_rules: interfaces.parent().unwrap().join("missing_connection_rules.json"),
            interfaces,
        };
        let (first, _) = load(&paths, None).unwrap();
        assert_eq!(first.uplinks[0].table_id, 100);
        assert_eq!(first.uplinks[1].table_id, 101);

        // Remove eth0 from the on-disk config, then reload with a previous
        // configuration that only carries eth1: the freed table_id 100 must
        // not collide with anything still alive.
        let mut prev = first.clone();
        prev.uplinks.retain(|u| u.name == "eth1");
        let three_uplinks = r#"{
            "wan_interfaces": [
                {"name": "eth1", "gateway": "10.0.1.1", "weight": 1},
                {"name": "eth3", "gateway": "10.0.3.1", "weight": 1}
            ],
            "lan_interface": {"name": "eth2", "ip": "192.168.1.1", "netmask": "255.255.255.0"},
            "management": {"web_port": 8080, "api_port": 8081}
        }"#;
        std::fs::write(&paths.interfaces, three_uplinks).unwrap();

        let (second, _) = load(&paths, Some(&prev)).unwrap();
        let eth1 = second.find_uplink("eth1").unwrap();
        let eth3 = second.find_uplink("eth3").unwrap();
        assert_eq!(eth1.table_id, 101);
        assert_ne!(eth3.table_id, eth1.table_id);
    }
}
