//! Flow Classifier & Sticky Table (spec §4.6).
//!
//! The in-daemon table is advisory for visibility/debugging; the filter
//! program installed in the kernel via the Host Adapter is authoritative
//! (spec §9, "Sticky-session representation"). Grounded on
//! `original_source/routing/connection_tracker.py`'s `classify_traffic`
//! and `interface_marks`, with the sticky-mark rule replaced per spec
//! §9(c): explicit class+uplink nibble layout instead of a mask-OR of
//! the existing mark.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uplinkd_common::config::ConnectionRulesOverlay;
use uplinkd_common::{Flow, FlowKey, Protocol, TrafficClass};

use crate::host::{ClassMarkRule, RuleSet};

/// A class's port/protocol matcher, either built-in or overridden by the
/// connection-rules overlay.
#[derive(Debug, Clone)]
pub struct ClassMatcher {
    pub class: TrafficClass,
    pub ports: Vec<(u16, u16)>,
    pub protocols: Vec<Protocol>,
}

/// Built-in (port-set, protocol-set) matchers per class, carried over from
/// `connection_tracker.py::traffic_rules`.
pub fn builtin_class_rules() -> Vec<ClassMatcher> {
    vec![
        ClassMatcher {
            class: TrafficClass::Voip,
            ports: vec![(5060, 5062), (16384, 16386)],
            protocols: vec![Protocol::Udp, Protocol::Tcp],
        },
        ClassMatcher {
            class: TrafficClass::Gaming,
            ports: vec![(27015, 27020), (80, 80), (443, 443), (8080, 8080)],
            protocols: vec![Protocol::Udp, Protocol::Tcp],
        },
        ClassMatcher {
            class: TrafficClass::Streaming,
            ports: vec![(1935, 1936), (8080, 8083), (554, 554), (8554, 8555)],
            protocols: vec![Protocol::Tcp, Protocol::Udp],
        },
        ClassMatcher {
            class: TrafficClass::Banking,
            ports: vec![(443, 443), (8443, 8443), (9443, 9443)],
            protocols: vec![Protocol::Tcp],
        },
    ]
}

/// Merge the connection-rules overlay over the built-in table: an overlay
/// entry for a class replaces that class's port/protocol matcher wholesale
/// (spec §6 "Connection-rules overlay"). Classes the overlay doesn't
/// mention keep their built-in matcher.
pub fn effective_class_rules(overlay: &ConnectionRulesOverlay) -> Vec<ClassMatcher> {
    let mut rules = builtin_class_rules();
    for rule in rules.iter_mut() {
        if let Some(over) = overlay.rules.get(&rule.class) {
            rule.ports = over.ports.iter().map(|p| (p.start, p.end)).collect();
            rule.protocols = over.protocols.clone();
        }
    }
    for (class, over) in &overlay.rules {
        if !rules.iter().any(|r| r.class == *class) {
            rules.push(ClassMatcher {
                class: *class,
                ports: over.ports.iter().map(|p| (p.start, p.end)).collect(),
                protocols: over.protocols.clone(),
            });
        }
    }
    rules
}

pub fn classify(dport: u16, proto: Protocol, rules: &[ClassMatcher]) -> TrafficClass {
    for rule in rules {
        if !rule.protocols.contains(&proto) {
            continue;
        }
        if rule.ports.iter().any(|(lo, hi)| (*lo..=*hi).contains(&dport)) {
            return rule.class;
        }
    }
    TrafficClass::General
}

pub const DEFAULT_MAX_AGE_SECS: i64 = 3600;

/// Advisory sticky table: authoritative mapping lives in kernel conntrack
/// marks, installed by the Route Programmer/Host Adapter.
pub struct StickyTable {
    flows: RwLock<HashMap<FlowKey, Flow>>,
    sticky_classes: Vec<TrafficClass>,
}

impl StickyTable {
    pub fn new(sticky_classes: Vec<TrafficClass>) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            sticky_classes,
        }
    }

    fn is_sticky(&self, class: TrafficClass) -> bool {
        self.sticky_classes.contains(&class)
    }

    /// Record a newly classified flow and return its connection mark.
    /// `assigned_uplink`/`uplink_mark_bits` is the current primary among
    /// healthy uplinks (spec §4.6 item 2); an already-tracked flow keeps
    /// its original assignment regardless of what is passed here, only its
    /// liveness is refreshed.
    pub fn track(
        &self,
        key: FlowKey,
        class: TrafficClass,
        assigned_uplink: String,
        uplink_mark_bits: u8,
    ) -> u32 {
        let sticky = self.is_sticky(class);
        let mark = Flow::build_mark(class, uplink_mark_bits);
        let now = Utc::now();
        let mut flows = self.flows.write().unwrap();
        flows
            .entry(key)
            .and_modify(|f| {
                f.last_seen_at = now;
                f.packets += 1;
            })
            .or_insert(Flow {
                key,
                traffic_class: class,
                assigned_uplink,
                mark,
                created_at: now,
                last_seen_at: now,
                packets: 1,
                bytes: 0,
                sticky,
            });
        mark
    }

    pub fn get(&self, key: &FlowKey) -> Option<Flow> {
        self.flows.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sticky_len(&self) -> usize {
        self.flows.read().unwrap().values().filter(|f| f.sticky).count()
    }

    /// Drop entries idle longer than `max_age` (default 3600s, spec §4.6).
    pub fn sweep(&self, max_age_secs: i64, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::seconds(max_age_secs);
        let mut flows = self.flows.write().unwrap();
        let before = flows.len();
        flows.retain(|_, f| f.last_seen_at > cutoff);
        before - flows.len()
    }

    /// When an uplink is removed or fails, its pinned sticky flows no
    /// longer have an authoritative assignment; drop them so the next
    /// classification re-pins to a surviving uplink.
    pub fn drop_uplink(&self, uplink: &str) {
        let mut flows = self.flows.write().unwrap();
        flows.retain(|_, f| f.assigned_uplink != uplink);
    }
}

/// Build the filter-program ruleset for the Host Adapter, mirroring the
/// effective class table (spec §4.6 item 1).
pub fn build_rule_set(rules: &[ClassMatcher]) -> RuleSet {
    let class_rules = rules
        .iter()
        .map(|r| ClassMarkRule {
            class_nibble: r.class.mark_nibble(),
            ports: r.ports.clone(),
            protocols: r
                .protocols
                .iter()
                .map(|p| match p {
                    Protocol::Tcp => "tcp",
                    Protocol::Udp => "udp",
                })
                .collect(),
        })
        .collect();
    RuleSet { class_rules }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplinkd_common::config::{ClassRule, PortRange};

    #[test]
    fn classifies_banking_port() {
        let rules = builtin_class_rules();
        assert_eq!(classify(443, Protocol::Tcp, &rules), TrafficClass::Banking);
    }

    #[test]
    fn classifies_voip_rtp_range() {
        let rules = builtin_class_rules();
        assert_eq!(classify(16385, Protocol::Udp, &rules), TrafficClass::Voip);
    }

    #[test]
    fn unmatched_port_is_general() {
        let rules = builtin_class_rules();
        assert_eq!(classify(51234, Protocol::Tcp, &rules), TrafficClass::General);
    }

    #[test]
    fn overlay_replaces_builtin_class_matcher() {
        let mut overlay = ConnectionRulesOverlay::default();
        overlay.rules.insert(
            TrafficClass::Gaming,
            ClassRule {
                ports: vec![PortRange::single(9999)],
                protocols: vec![Protocol::Udp],
            },
        );
        let rules = effective_class_rules(&overlay);
        assert_eq!(classify(9999, Protocol::Udp, &rules), TrafficClass::Gaming);
        // The built-in gaming port 27015 no longer matches once overridden.
        assert_eq!(classify(27015, Protocol::Tcp, &rules), TrafficClass::General);
    }

    #[test]
    fn sticky_classes_default_to_banking_and_voip() {
        let table = StickyTable::new(Flow::default_sticky_classes().to_vec());
        assert!(table.is_sticky(TrafficClass::Banking));
        assert!(table.is_sticky(TrafficClass::Voip));
        assert!(!table.is_sticky(TrafficClass::Gaming));
    }

    #[test]
    fn track_pins_flow_to_uplink() {
        let table = StickyTable::new(vec![TrafficClass::Banking]);
        let key = FlowKey::canonicalize(
            "192.168.1.100".parse().unwrap(),
            52344,
            "93.184.216.34".parse().unwrap(),
            443,
            Protocol::Tcp,
        );
        table.track(key, TrafficClass::Banking, "eth1".into(), 0x2);
        let flow = table.get(&key).unwrap();
        assert!(flow.sticky);
        assert_eq!(flow.assigned_uplink, "eth1");
        assert_eq!((flow.mark >> 28) & 0xf, TrafficClass::Banking.mark_nibble() as u32);
    }

    #[test]
    fn track_keeps_original_assignment_on_repeat_observation() {
        let table = StickyTable::new(vec![TrafficClass::Banking]);
        let key = FlowKey::canonicalize(
            "192.168.1.100".parse().unwrap(),
            52344,
            "93.184.216.34".parse().unwrap(),
            443,
            Protocol::Tcp,
        );
        table.track(key, TrafficClass::Banking, "eth1".into(), 0x2);
        // Preferred uplink changes, but the already-pinned flow must not move.
        table.track(key, TrafficClass::Banking, "eth0".into(), 0x1);
        let flow = table.get(&key).unwrap();
        assert_eq!(flow.assigned_uplink, "eth1");
        assert_eq!((flow.mark >> 24) & 0xf, 0x2);
    }

    #[test]
    fn drop_uplink_removes_its_pinned_flows() {
        let table = StickyTable::new(vec![TrafficClass::Banking]);
        let key = FlowKey::canonicalize(
            "192.168.1.100".parse().unwrap(),
            52344,
            "93.184.216.34".parse().unwrap(),
            443,
            Protocol::Tcp,
        );
        table.track(key, TrafficClass::Banking, "eth1".into(), 0x2);
        table.drop_uplink("eth1");
        assert!(table.get(&key).is_none());
    }
}
