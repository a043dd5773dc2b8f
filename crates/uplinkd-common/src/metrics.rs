//! Prometheus metrics rendering for uplink health.
//!
//! Renders `Uplink`s in Prometheus text exposition format, suitable for
//! scraping by Prometheus or compatible collectors.

use crate::model::{HealthState, Uplink};
use std::fmt::Write;

/// Render a slice of `Uplink`s as Prometheus text exposition format.
pub fn render_prometheus(uplinks: &[Uplink]) -> String {
    let mut out = String::with_capacity(2048);

    writeln!(out, "# HELP uplinkd_uplink_health Uplink health (1=healthy, 0=not).").unwrap();
    writeln!(out, "# TYPE uplinkd_uplink_health gauge").unwrap();
    for u in uplinks {
        let v = if u.health == HealthState::Healthy { 1 } else { 0 };
        writeln!(
            out,
            "uplinkd_uplink_health{{interface=\"{}\",health=\"{}\"}} {v}",
            u.name, u.health
        )
        .unwrap();
    }

    writeln!(out, "# HELP uplinkd_uplink_weight Configured ECMP weight.").unwrap();
    writeln!(out, "# TYPE uplinkd_uplink_weight gauge").unwrap();
    for u in uplinks {
        writeln!(
            out,
            "uplinkd_uplink_weight{{interface=\"{}\"}} {}",
            u.name, u.weight
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP uplinkd_uplink_consecutive_failures Consecutive failed probes."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_uplink_consecutive_failures gauge").unwrap();
    for u in uplinks {
        writeln!(
            out,
            "uplinkd_uplink_consecutive_failures{{interface=\"{}\"}} {}",
            u.name, u.counters.consecutive_failures
        )
        .unwrap();
    }

    writeln!(out, "# HELP uplinkd_uplink_uptime_ratio Fraction of successful probes.").unwrap();
    writeln!(out, "# TYPE uplinkd_uplink_uptime_ratio gauge").unwrap();
    for u in uplinks {
        writeln!(
            out,
            "uplinkd_uplink_uptime_ratio{{interface=\"{}\"}} {:.6}",
            u.name,
            u.counters.uptime_ratio()
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP uplinkd_uplink_probes_total Total probes issued for this uplink."
    )
    .unwrap();
    writeln!(out, "# TYPE uplinkd_uplink_probes_total counter").unwrap();
    for u in uplinks {
        writeln!(
            out,
            "uplinkd_uplink_probes_total{{interface=\"{}\"}} {}",
            u.name, u.counters.total_probes
        )
        .unwrap();
    }

    let healthy_count = uplinks
        .iter()
        .filter(|u| u.health == HealthState::Healthy)
        .count();

    writeln!(out, "# HELP uplinkd_uplinks_total Total number of configured uplinks.").unwrap();
    writeln!(out, "# TYPE uplinkd_uplinks_total gauge").unwrap();
    writeln!(out, "uplinkd_uplinks_total {}", uplinks.len()).unwrap();

    writeln!(out, "# HELP uplinkd_uplinks_healthy Number of uplinks currently healthy.").unwrap();
    writeln!(out, "# TYPE uplinkd_uplinks_healthy gauge").unwrap();
    writeln!(out, "uplinkd_uplinks_healthy {healthy_count}").unwrap();

    out
}
