//! Host Adapter (spec §4.1) — the only module that shells out to routing,
//! filter, and probe utilities. Everything else consumes this trait.
//!
//! Grounded on `hardware.rs`'s `Command::new("ip")` usage for link state
//! and on the original's `route_manager.py` for the exact `ip route` /
//! `ip rule` / `conntrack` command shapes.

use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::process::Command;
use uplinkd_common::Protocol;

use crate::error::{Result, UplinkdError};

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub name: String,
    pub mac: Option<String>,
    pub operstate: String,
    pub carrier: bool,
    pub speed_mbps: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub family: AddrFamily,
    pub addr: IpAddr,
    pub prefix: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Inet,
    Inet6,
}

/// One nexthop in a multipath default route.
#[derive(Debug, Clone)]
pub struct Nexthop {
    pub gateway: IpAddr,
    pub dev: String,
    pub weight: u32,
}

/// A policy-rule selector: match by ingress interface, by fwmark, or both.
#[derive(Debug, Clone)]
pub struct RuleSelector {
    pub iif: Option<String>,
    pub fwmark: Option<u32>,
    pub fwmark_mask: Option<u32>,
}

/// Class+uplink nibble marking rules to install as the packet-filter
/// program (spec §4.6). Kept abstract here; the real adapter renders
/// these into nftables syntax.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub class_rules: Vec<ClassMarkRule>,
}

#[derive(Debug, Clone)]
pub struct ClassMarkRule {
    pub class_nibble: u8,
    pub ports: Vec<(u16, u16)>,
    pub protocols: Vec<&'static str>,
}

/// A live connection observed in the kernel conntrack table, the input to
/// the Flow Classifier's production observation path (spec §4.6).
#[derive(Debug, Clone, Copy)]
pub struct ConntrackFlow {
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    pub proto: Protocol,
}

/// Single abstraction over the OS (spec §4.1). All operations are
/// idempotent where possible: "already exists" on add and "not present"
/// on delete are treated as success, never as an error.
#[async_trait]
pub trait HostAdapter: Send + Sync {
    async fn list_links(&self) -> Result<Vec<LinkInfo>>;
    async fn list_addrs(&self, name: &str) -> Result<Vec<AddrInfo>>;
    async fn gateway_of(&self, name: &str) -> Result<Option<IpAddr>>;
    async fn reachability_probe(
        &self,
        name: &str,
        target: IpAddr,
        count: u32,
        timeout_secs: u64,
    ) -> Result<(Option<f64>, f64)>;
    async fn set_default_multipath(&self, nexthops: &[Nexthop]) -> Result<()>;
    async fn install_uplink_table(&self, uplink: &str, table_id: u32, gateway: IpAddr) -> Result<()>;
    async fn flush_uplink_table(&self, table_id: u32) -> Result<()>;
    async fn add_policy_rule(&self, selector: &RuleSelector, table_id: u32) -> Result<()>;
    async fn del_policy_rule(&self, selector: &RuleSelector, table_id: u32) -> Result<()>;
    async fn install_filter_program(&self, rules: &RuleSet) -> Result<()>;
    async fn flush_ct_by_iface(&self, name: &str) -> Result<()>;
    /// List currently tracked connections, for the Flow Classifier's
    /// periodic sticky-pinning sweep (spec §4.6).
    async fn list_conntrack_flows(&self) -> Result<Vec<ConntrackFlow>>;
    /// Pin a single tracked connection's mark, authoritatively assigning it
    /// to an uplink for the remainder of its lifetime (spec §4.6 item 2).
    async fn set_conntrack_mark(&self, flow: &ConntrackFlow, mark: u32) -> Result<()>;
}

/// Real adapter: shells out to `ip`, `ping`, `conntrack`, `nft`, `ethtool`.
pub struct RealHostAdapter;

impl RealHostAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<std::process::Output> {
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| UplinkdError::host(format!("spawn {program}: {e}")))?;
        Ok(out)
    }

    /// Treats common "already in the desired state" failures as success,
    /// matching the original's `check=False` tolerance for idempotent ops.
    fn tolerate_idempotent(stderr: &str) -> bool {
        stderr.contains("File exists")
            || stderr.contains("No such process")
            || stderr.contains("RTNETLINK answers: File exists")
    }

    /// Spawn `nft` with the given args and feed `script` on stdin.
    async fn run_nft_with_stdin(args: &[&str], script: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("nft")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| UplinkdError::host(format!("spawn nft: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| UplinkdError::host(format!("write nft script: {e}")))?;
        }
        let out = child
            .wait_with_output()
            .await
            .map_err(|e| UplinkdError::host(format!("wait nft: {e}")))?;
        if !out.status.success() {
            return Err(UplinkdError::host(format!(
                "nft {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        Ok(())
    }

    /// Read link speed in Mbps via `/sys/class/net/<if>/speed`, falling
    /// back to `ethtool` when sysfs reports nothing useful (common on
    /// virtual interfaces), matching
    /// `original_source/routing/interface_detector.py::_get_interface_speed`.
    async fn read_speed_mbps(name: &str) -> Option<u64> {
        let sysfs_path = format!("/sys/class/net/{name}/speed");
        if let Ok(raw) = tokio::fs::read_to_string(&sysfs_path).await {
            if let Ok(speed) = raw.trim().parse::<i64>() {
                if speed > 0 {
                    return Some(speed as u64);
                }
            }
        }
        let out = Command::new("ethtool").arg(name).output().await.ok()?;
        parse_ethtool_speed(&String::from_utf8_lossy(&out.stdout))
    }
}

impl Default for RealHostAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostAdapter for RealHostAdapter {
    async fn list_links(&self) -> Result<Vec<LinkInfo>> {
        let out = self.run("ip", &["-j", "link", "show"]).await?;
        if !out.status.success() {
            return Err(UplinkdError::host(format!(
                "ip link show: {}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&out.stdout)
            .map_err(|e| UplinkdError::host(format!("parse ip -j link show: {e}")))?;

        let mut links = Vec::with_capacity(parsed.len());
        for v in parsed {
            let Some(name) = v.get("ifname").and_then(|s| s.as_str()).map(str::to_string) else {
                continue;
            };
            let operstate = v
                .get("operstate")
                .and_then(|s| s.as_str())
                .unwrap_or("UNKNOWN")
                .to_string();
            let mac = v.get("address").and_then(|s| s.as_str()).map(str::to_string);
            let speed_mbps = Self::read_speed_mbps(&name).await;
            links.push(LinkInfo {
                carrier: operstate == "UP",
                name,
                mac,
                operstate,
                speed_mbps,
            });
        }
        Ok(links)
    }

    async fn list_addrs(&self, name: &str) -> Result<Vec<AddrInfo>> {
        let out = self.run("ip", &["-j", "addr", "show", name]).await?;
        if !out.status.success() {
            return Err(UplinkdError::host(format!(
                "ip addr show {name}: {}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&out.stdout)
            .map_err(|e| UplinkdError::host(format!("parse ip -j addr show: {e}")))?;
        let mut addrs = Vec::new();
        for link in parsed {
            let Some(info) = link.get("addr_info").and_then(|v| v.as_array()) else {
                continue;
            };
            for a in info {
                let Some(addr_str) = a.get("local").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Ok(addr) = addr_str.parse::<IpAddr>() else {
                    continue;
                };
                let family = match a.get("family").and_then(|v| v.as_str()) {
                    Some("inet6") => AddrFamily::Inet6,
                    _ => AddrFamily::Inet,
                };
                let prefix = a.get("prefixlen").and_then(|v| v.as_u64()).unwrap_or(32) as u8;
                addrs.push(AddrInfo {
                    family,
                    addr,
                    prefix,
                });
            }
        }
        Ok(addrs)
    }

    async fn gateway_of(&self, name: &str) -> Result<Option<IpAddr>> {
        let out = self
            .run("ip", &["-j", "route", "show", "default", "dev", name])
            .await?;
        if !out.status.success() {
            return Ok(None);
        }
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&out.stdout).unwrap_or_default();
        Ok(parsed
            .first()
            .and_then(|r| r.get("gateway"))
            .and_then(|g| g.as_str())
            .and_then(|s| s.parse().ok()))
    }

    async fn reachability_probe(
        &self,
        name: &str,
        target: IpAddr,
        count: u32,
        timeout_secs: u64,
    ) -> Result<(Option<f64>, f64)> {
        let count_s = count.to_string();
        let timeout_s = timeout_secs.to_string();
        let target_s = target.to_string();
        let args = [
            "-I", name, "-c", &count_s, "-W", &timeout_s, "-q", &target_s,
        ];
        let out = self.run("ping", &args).await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        let loss_fraction = parse_packet_loss(&stdout).unwrap_or(1.0);
        let avg_latency = parse_avg_rtt(&stdout);
        Ok((avg_latency, loss_fraction))
    }

    async fn set_default_multipath(&self, nexthops: &[Nexthop]) -> Result<()> {
        let _ = self.run("ip", &["route", "del", "default"]).await;
        if nexthops.is_empty() {
            return Ok(());
        }
        let mut args: Vec<String> = vec!["route".into(), "add".into(), "default".into()];
        for nh in nexthops {
            args.push("nexthop".into());
            args.push("via".into());
            args.push(nh.gateway.to_string());
            args.push("dev".into());
            args.push(nh.dev.clone());
            args.push("weight".into());
            args.push(nh.weight.to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run("ip", &arg_refs).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !Self::tolerate_idempotent(&stderr) {
                return Err(UplinkdError::host(format!("ip route add default: {stderr}")));
            }
        }
        Ok(())
    }

    async fn install_uplink_table(&self, uplink: &str, table_id: u32, gateway: IpAddr) -> Result<()> {
        let table_id_s = table_id.to_string();
        let gw_s = gateway.to_string();
        let out = self
            .run(
                "ip",
                &[
                    "route", "add", "default", "via", &gw_s, "dev", uplink, "table", &table_id_s,
                ],
            )
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !Self::tolerate_idempotent(&stderr) {
                return Err(UplinkdError::host(format!(
                    "ip route add table {table_id}: {stderr}"
                )));
            }
        }
        Ok(())
    }

    async fn flush_uplink_table(&self, table_id: u32) -> Result<()> {
        let table_id_s = table_id.to_string();
        let _ = self.run("ip", &["route", "flush", "table", &table_id_s]).await;
        Ok(())
    }

    async fn add_policy_rule(&self, selector: &RuleSelector, table_id: u32) -> Result<()> {
        let table_id_s = table_id.to_string();
        let mut args: Vec<String> = vec!["rule".into(), "add".into()];
        if let Some(iif) = &selector.iif {
            args.push("iif".into());
            args.push(iif.clone());
        }
        if let Some(mark) = selector.fwmark {
            args.push("fwmark".into());
            match selector.fwmark_mask {
                Some(mask) => args.push(format!("{mark:#x}/{mask:#x}")),
                None => args.push(format!("{mark:#x}")),
            }
        }
        args.push("table".into());
        args.push(table_id_s);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run("ip", &arg_refs).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !Self::tolerate_idempotent(&stderr) {
                return Err(UplinkdError::host(format!("ip rule add: {stderr}")));
            }
        }
        Ok(())
    }

    async fn del_policy_rule(&self, selector: &RuleSelector, table_id: u32) -> Result<()> {
        let table_id_s = table_id.to_string();
        let mut args: Vec<String> = vec!["rule".into(), "del".into()];
        if let Some(iif) = &selector.iif {
            args.push("iif".into());
            args.push(iif.clone());
        }
        if let Some(mark) = selector.fwmark {
            args.push("fwmark".into());
            match selector.fwmark_mask {
                Some(mask) => args.push(format!("{mark:#x}/{mask:#x}")),
                None => args.push(format!("{mark:#x}")),
            }
        }
        args.push("table".into());
        args.push(table_id_s);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let _ = self.run("ip", &arg_refs).await;
        Ok(())
    }

    async fn install_filter_program(&self, rules: &RuleSet) -> Result<()> {
        // Dry-run first (`nft -c`), matching the original's validate-then-apply
        // two-step; a syntax error never reaches the live ruleset.
        let script = render_nft_script(rules);
        Self::run_nft_with_stdin(&["-c", "-f", "-"], &script).await?;
        Self::run_nft_with_stdin(&["-f", "-"], &script).await
    }

    async fn flush_ct_by_iface(&self, name: &str) -> Result<()> {
        let _ = self.run("conntrack", &["-D", "-i", name]).await;
        Ok(())
    }

    async fn list_conntrack_flows(&self) -> Result<Vec<ConntrackFlow>> {
        let out = self.run("conntrack", &["-L", "-o", "extended"]).await?;
        if !out.status.success() {
            return Err(UplinkdError::host(format!(
                "conntrack -L: {}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(stdout.lines().filter_map(parse_conntrack_line).collect())
    }

    async fn set_conntrack_mark(&self, flow: &ConntrackFlow, mark: u32) -> Result<()> {
        let proto_s = match flow.proto {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        let src_s = flow.src.to_string();
        let dst_s = flow.dst.to_string();
        let sport_s = flow.sport.to_string();
        let dport_s = flow.dport.to_string();
        let mark_s = format!("{mark:#x}");
        let out = self
            .run(
                "conntrack",
                &[
                    "-U", "-p", proto_s, "-s", &src_s, "-d", &dst_s, "--sport", &sport_s, "--dport", &dport_s,
                    "-m", &mark_s,
                ],
            )
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.contains("No such file or directory") {
                return Err(UplinkdError::host(format!("conntrack -U: {stderr}")));
            }
        }
        Ok(())
    }
}

fn render_nft_script(rules: &RuleSet) -> String {
    let mut out = String::from("table inet uplinkd {\n");
    out.push_str("  chain mark-classify {\n");
    out.push_str("    type filter hook prerouting priority -150; policy accept;\n");
    for rule in &rules.class_rules {
        for (lo, hi) in &rule.ports {
            for proto in &rule.protocols {
                out.push_str(&format!(
                    "    {proto} dport {lo}-{hi} ct mark set ct mark and 0x00ffffff or {:#x}\n",
                    (rule.class_nibble as u32) << 28
                ));
            }
        }
    }
    out.push_str("  }\n");
    // Restores the connection mark onto the packet so the policy-routing
    // fwmark rules (spec §4.6 item 2) can see it on egress.
    out.push_str("  chain mark-restore {\n");
    out.push_str("    type filter hook prerouting priority -140; policy accept;\n");
    out.push_str("    meta mark set ct mark\n");
    out.push_str("  }\n");
    out.push_str("}\n");
    out
}

fn parse_packet_loss(stdout: &str) -> Option<f64> {
    stdout.lines().find_map(|line| {
        let idx = line.find("% packet loss")?;
        let before = &line[..idx];
        let pct_str = before.rsplit(',').next()?.trim().trim_start_matches(|c: char| !c.is_ascii_digit() && c != '.');
        pct_str.parse::<f64>().ok().map(|p| p / 100.0)
    })
}

fn parse_avg_rtt(stdout: &str) -> Option<f64> {
    // e.g. "rtt min/avg/max/mdev = 10.1/12.3/15.0/1.2 ms"
    let line = stdout.lines().find(|l| l.contains("min/avg/max"))?;
    let eq_pos = line.find('=')?;
    let values = line[eq_pos + 1..].trim();
    let slash_part = values.split_whitespace().next()?;
    let avg = slash_part.split('/').nth(1)?;
    avg.parse::<f64>().ok()
}

/// e.g. "Speed: 1000Mb/s" -> 1000.
fn parse_ethtool_speed(stdout: &str) -> Option<u64> {
    let line = stdout.lines().find(|l| l.trim_start().starts_with("Speed:"))?;
    let value = line.split(':').nth(1)?.trim();
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u64>().ok()
}

/// Parse one `conntrack -L -o extended` line into its 5-tuple. Lines for
/// protocols we don't classify (icmp, etc.) are skipped.
fn parse_conntrack_line(line: &str) -> Option<ConntrackFlow> {
    let mut tokens = line.split_whitespace();
    let proto = match tokens.next()? {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return None,
    };

    let mut src = None;
    let mut dst = None;
    let mut sport = None;
    let mut dport = None;
    for tok in line.split_whitespace() {
        if let Some(v) = tok.strip_prefix("src=") {
            if src.is_none() {
                src = v.parse::<IpAddr>().ok();
            }
        } else if let Some(v) = tok.strip_prefix("dst=") {
            if dst.is_none() {
                dst = v.parse::<IpAddr>().ok();
            }
        } else if let Some(v) = tok.strip_prefix("sport=") {
            if sport.is_none() {
                sport = v.parse::<u16>().ok();
            }
        } else if let Some(v) = tok.strip_prefix("dport=") {
            if dport.is_none() {
                dport = v.parse::<u16>().ok();
            }
        }
    }

    Some(ConntrackFlow {
        src: src?,
        sport: sport?,
        dst: dst?,
        dport: dport?,
        proto,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_packet_loss() {
        let out = "3 packets transmitted, 3 received, 0% packet loss, time 2003ms";
        assert_eq!(parse_packet_loss(out), Some(0.0));
    }

    #[test]
    fn parses_full_loss() {
        let out = "3 packets transmitted, 0 received, 100% packet loss, time 2003ms";
        assert_eq!(parse_packet_loss(out), Some(1.0));
    }

    #[test]
    fn parses_avg_rtt() {
        let out = "rtt min/avg/max/mdev = 10.123/12.345/15.678/1.234 ms";
        assert_eq!(parse_avg_rtt(out), Some(12.345));
    }

    #[test]
    fn parses_ethtool_speed_line() {
        let out = "Settings for eth0:\n\tSpeed: 1000Mb/s\n\tDuplex: Full\n";
        assert_eq!(parse_ethtool_speed(out), Some(1000));
    }

    #[test]
    fn missing_ethtool_speed_line_is_none() {
        let out = "Settings for eth0:\n\tSpeed: Unknown!\n";
        assert_eq!(parse_ethtool_speed(out), None);
    }

    #[test]
    fn parses_conntrack_extended_line() {
        let line = "tcp 6 431999 ESTABLISHED src=192.168.1.100 dst=93.184.216.34 sport=52344 dport=443 src=93.184.216.34 dst=192.168.1.100 sport=443 dport=52344 [ASSURED] mark=0 use=1";
        let flow = parse_conntrack_line(line).unwrap();
        assert_eq!(flow.src.to_string(), "192.168.1.100");
        assert_eq!(flow.dst.to_string(), "93.184.216.34");
        assert_eq!(flow.sport, 52344);
        assert_eq!(flow.dport, 443);
        assert_eq!(flow.proto, Protocol::Tcp);
    }

    #[test]
    fn skips_unrecognized_protocol_lines() {
        let line = "icmp 1 29 src=192.168.1.100 dst=1.1.1.1 type=8 code=0 id=1";
        assert!(parse_conntrack_line(line).is_none());
    }
}
