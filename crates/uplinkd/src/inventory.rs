//! Interface Inventory (spec §4.2) — enumerates link-layer interfaces,
//! classifies each as WAN/LAN/other, and proposes a bootstrap config.
//!
//! Grounded on `original_source/routing/interface_detector.py`
//! (`detect_all_interfaces`, `_detect_interface_type`,
//! `_suggest_weight_based_on_speed`) and `hardware.rs`'s `/sys/class/net`
//! enumeration style, adapted to go through the Host Adapter instead of
//! reading `/sys` directly so it stays mockable.

use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::host::HostAdapter;

const VIRTUAL_PREFIXES: &[&str] = &["lo", "docker", "br-", "veth", "tun", "tap", "virbr"];
const BOOTSTRAP_ETHERNET_NAMES: &[&str] = &["eth0", "enp0s3", "ens3"];
const WELL_KNOWN_PROBE_TARGET: &str = "8.8.8.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceClass {
    Wan,
    Lan,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DetectedInterface {
    pub name: String,
    pub class: InterfaceClass,
    pub gateway: Option<IpAddr>,
    pub address: Option<IpAddr>,
    pub speed_mbps: Option<u64>,
    pub mac: Option<String>,
}

pub struct InterfaceInventory {
    host: Arc<dyn HostAdapter>,
}

impl InterfaceInventory {
    pub fn new(host: Arc<dyn HostAdapter>) -> Self {
        Self { host }
    }

    fn is_virtual(name: &str) -> bool {
        name == "lo" || VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    fn is_private(addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                o[0] == 10
                    || (o[0] == 172 && (16..=31).contains(&o[1]))
                    || (o[0] == 192 && o[1] == 168)
            }
            IpAddr::V6(_) => false,
        }
    }

    /// Enumerate all non-virtual links and classify each per spec §4.2.
    pub async fn detect_all(&self) -> Result<Vec<DetectedInterface>> {
        let links = self.host.list_links().await?;
        let mut wan_already_found = false;
        let mut out = Vec::new();

        for link in links {
            if Self::is_virtual(&link.name) {
                continue;
            }
            let gateway = self.host.gateway_of(&link.name).await?;
            let addrs = self.host.list_addrs(&link.name).await?;
            let address = addrs.first().map(|a| a.addr);

            let has_default_route = gateway.is_some();
            let bootstrap_name_and_first = BOOTSTRAP_ETHERNET_NAMES.contains(&link.name.as_str())
                && !wan_already_found;

            // Condition (b): a direct reachability probe through the link,
            // tried only when the cheaper checks above didn't already
            // decide WAN (spec §4.2).
            let probes_reachable = if has_default_route || bootstrap_name_and_first {
                false
            } else {
                let target: IpAddr = WELL_KNOWN_PROBE_TARGET.parse().unwrap();
                matches!(
                    self.host.reachability_probe(&link.name, target, 1, 2).await,
                    Ok((_, loss)) if loss < 1.0
                )
            };

            let class = if has_default_route || bootstrap_name_and_first || probes_reachable {
                wan_already_found = true;
                InterfaceClass::Wan
            } else if address.map(Self::is_private).unwrap_or(false) {
                InterfaceClass::Lan
            } else {
                InterfaceClass::Unknown
            };

            out.push(DetectedInterface {
                name: link.name,
                class,
                gateway,
                address,
                speed_mbps: link.speed_mbps,
                mac: link.mac,
            });
        }
        Ok(out)
    }

    /// `_suggest_weight_based_on_speed` carried over unchanged (spec §4.2).
    pub fn suggest_weight(speed_mbps: Option<u64>) -> u32 {
        match speed_mbps {
            Some(s) if s >= 1000 => 3,
            Some(s) if s >= 100 => 2,
            _ => 1,
        }
    }

    /// Default resolvers when none are discoverable (spec §4.2).
    pub fn default_resolvers() -> Vec<IpAddr> {
        vec!["8.8.8.8".parse().unwrap(), "1.1.1.1".parse().unwrap()]
    }
}
