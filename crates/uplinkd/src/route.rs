//! Route Programmer (spec §4.5) — owns the kernel default route, per-uplink
//! tables, and policy rules. Invoked only from the Health State Machine's
//! task context, so kernel-facing command sequences are serialized
//! system-wide (spec §5).
//!
//! Grounded on `original_source/routing/route_manager.py`'s
//! `_configure_multipath_routing` / `_update_interface_routing` /
//! `_remove_interface_routing`, reordered per spec §4.5's ordering rule
//! (the original does not guarantee add-before-teardown).

use std::sync::Arc;

use tracing::{error, info};
use uplinkd_common::{AdminState, Configuration, HealthState};

use crate::host::{HostAdapter, Nexthop, RuleSelector};

pub struct RouteProgrammer {
    host: Arc<dyn HostAdapter>,
}

impl RouteProgrammer {
    pub fn new(host: Arc<dyn HostAdapter>) -> Self {
        Self { host }
    }

    /// Apply a full reprogramming batch for the current configuration.
    /// `departed` lists uplinks present before this batch but no longer in
    /// `config` (removed via Control API) — their tables/rules are torn
    /// down last, per the ordering rule.
    pub async fn reprogram(&self, config: &Configuration, departed: &[(String, u32, u8)]) {
        // 1. Add new tables/rules for any uplink that needs one.
        for uplink in &config.uplinks {
            if let Err(e) = self
                .host
                .install_uplink_table(&uplink.name, uplink.table_id, uplink.nexthop)
                .await
            {
                error!(uplink = %uplink.name, error = %e, "failed to install uplink table");
            }
            let iif_selector = RuleSelector {
                iif: Some(uplink.name.clone()),
                fwmark: None,
                fwmark_mask: None,
            };
            if let Err(e) = self.host.add_policy_rule(&iif_selector, uplink.table_id).await {
                error!(uplink = %uplink.name, error = %e, "failed to add policy rule");
            }

            // Packets carrying this uplink's mark nibble (restored from
            // their connection's sticky mark) route to its table regardless
            // of ingress interface (spec §4.6 item 2).
            let mark_selector = Self::mark_selector(uplink.mark_bits);
            if let Err(e) = self.host.add_policy_rule(&mark_selector, uplink.table_id).await {
                error!(uplink = %uplink.name, error = %e, "failed to add fwmark policy rule");
            }
        }

        // 2. Replace the default multipath route: delete-then-add, full
        // replace only — kernel semantics for in-place nexthop edits vary.
        let nexthops: Vec<Nexthop> = config
            .uplinks
            .iter()
            .filter(|u| u.admin_state == AdminState::Enabled && u.health == HealthState::Healthy)
            .map(|u| Nexthop {
                gateway: u.nexthop,
                dev: u.name.clone(),
                weight: u.weight,
            })
            .collect();

        if nexthops.is_empty() {
            error!("no healthy+enabled uplinks; default route is absent, system is effectively offline");
        }
        if let Err(e) = self.host.set_default_multipath(&nexthops).await {
            error!(error = %e, "failed to program default multipath route");
        } else {
            info!(count = nexthops.len(), "default multipath route reprogrammed");
        }

        // 3. Tear down departed tables/rules, flushing conntrack so
        // orphaned flows rehash to a surviving uplink.
        for (name, table_id, mark_bits) in departed {
            let iif_selector = RuleSelector {
                iif: Some(name.clone()),
                fwmark: None,
                fwmark_mask: None,
            };
            let _ = self.host.del_policy_rule(&iif_selector, *table_id).await;
            let _ = self.host.del_policy_rule(&Self::mark_selector(*mark_bits), *table_id).await;
            let _ = self.host.flush_uplink_table(*table_id).await;
            let _ = self.host.flush_ct_by_iface(name).await;
        }
    }

    /// Handle a single uplink transitioning to failed: flush its table and
    /// remove its policy rules, then clear conntrack on that link so
    /// orphaned flows rehash rather than stall (spec §4.5).
    pub async fn on_failed(&self, uplink_name: &str, table_id: u32, mark_bits: u8) {
        let iif_selector = RuleSelector {
            iif: Some(uplink_name.to_string()),
            fwmark: None,
            fwmark_mask: None,
        };
        let _ = self.host.del_policy_rule(&iif_selector, table_id).await;
        let _ = self.host.del_policy_rule(&Self::mark_selector(mark_bits), table_id).await;
        let _ = self.host.flush_uplink_table(table_id).await;
        if let Err(e) = self.host.flush_ct_by_iface(uplink_name).await {
            error!(uplink = %uplink_name, error = %e, "failed to flush conntrack for failed uplink");
        }
    }

    /// Selector matching the uplink-nibble byte of the connection mark
    /// (bits 24-27), independent of the traffic-class nibble above it.
    fn mark_selector(mark_bits: u8) -> RuleSelector {
        RuleSelector {
            iif: None,
            fwmark: Some((mark_bits as u32) << 24),
            fwmark_mask: Some(0x0f00_0000),
        }
    }

    /// Tie-break on weight equality: lexicographic by uplink name,
    /// deterministic across restarts (spec §4.5).
    pub fn preferred_uplink(config: &Configuration) -> Option<&uplinkd_common::Uplink> {
        let mut best: Option<&uplinkd_common::Uplink> = None;
        for candidate in config
            .uplinks
            .iter()
            .filter(|u| u.admin_state == AdminState::Enabled && u.health == HealthState::Healthy)
        {
            best = match best {
                None => Some(candidate),
                Some(current) if candidate.weight > current.weight => Some(candidate),
                Some(current) if candidate.weight == current.weight && candidate.name < current.name => {
                    Some(candidate)
                }
                Some(current) => Some(current),
            };
        }
        best
    }
}
