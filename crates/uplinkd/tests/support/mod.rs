//! Shared `MockHost` for integration tests: a `HostAdapter` whose
//! reachability verdicts are scripted per-uplink, with a call log for
//! asserting which kernel-facing operations the daemon actually issued.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use uplinkd::error::Result;
use uplinkd::host::{AddrInfo, ClassMarkRule, ConntrackFlow, HostAdapter, LinkInfo, Nexthop, RuleSelector, RuleSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetDefaultMultipath(Vec<String>),
    InstallUplinkTable(String, u32),
    FlushUplinkTable(u32),
    AddPolicyRule(RuleSelectorSnapshot, u32),
    DelPolicyRule(RuleSelectorSnapshot, u32),
    FlushCtByIface(String),
    InstallFilterProgram(Vec<u8>),
    SetConntrackMark(u32, u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleSelectorSnapshot {
    pub iif: Option<String>,
    pub fwmark: Option<u32>,
}

impl From<&RuleSelector> for RuleSelectorSnapshot {
    fn from(s: &RuleSelector) -> Self {
        Self {
            iif: s.iif.clone(),
            fwmark: s.fwmark,
        }
    }
}

/// Scripted reachability outcomes: each call to `reachability_probe` for a
/// given uplink pops the next `(latency_ms, loss_fraction)` pair from its
/// queue; once empty, calls return a steady "reachable" result.
pub struct MockHost {
    verdicts: Mutex<HashMap<String, VecDeque<(Option<f64>, f64)>>>,
    pub calls: Mutex<Vec<Call>>,
    conntrack_flows: Mutex<Vec<ConntrackFlow>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            verdicts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            conntrack_flows: Mutex::new(Vec::new()),
        }
    }

    /// Queue reachability outcomes for `uplink`, consumed oldest-first.
    pub fn script(&self, uplink: &str, outcomes: Vec<(Option<f64>, f64)>) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(uplink.to_string(), outcomes.into());
    }

    pub fn set_conntrack_flows(&self, flows: Vec<ConntrackFlow>) {
        *self.conntrack_flows.lock().unwrap() = flows;
    }

    pub fn call_count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostAdapter for MockHost {
    async fn list_links(&self) -> Result<Vec<LinkInfo>> {
        Ok(vec![])
    }

    async fn list_addrs(&self, _name: &str) -> Result<Vec<AddrInfo>> {
        Ok(vec![])
    }

    async fn gateway_of(&self, _name: &str) -> Result<Option<IpAddr>> {
        Ok(None)
    }

    async fn reachability_probe(
        &self,
        name: &str,
        _target: IpAddr,
        _count: u32,
        _timeout_secs: u64,
    ) -> Result<(Option<f64>, f64)> {
        let mut verdicts = self.verdicts.lock().unwrap();
        let queue = verdicts.entry(name.to_string()).or_default();
        Ok(queue.pop_front().unwrap_or((Some(10.0), 0.0)))
    }

    async fn set_default_multipath(&self, nexthops: &[Nexthop]) -> Result<()> {
        self.calls.lock().unwrap().push(Call::SetDefaultMultipath(
            nexthops.iter().map(|n| n.dev.clone()).collect(),
        ));
        Ok(())
    }

    async fn install_uplink_table(&self, uplink: &str, table_id: u32, _gateway: IpAddr) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::InstallUplinkTable(uplink.to_string(), table_id));
        Ok(())
    }

    async fn flush_uplink_table(&self, table_id: u32) -> Result<()> {
        self.calls.lock().unwrap().push(Call::FlushUplinkTable(table_id));
        Ok(())
    }

    async fn add_policy_rule(&self, selector: &RuleSelector, table_id: u32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::AddPolicyRule(selector.into(), table_id));
        Ok(())
    }

    async fn del_policy_rule(&self, selector: &RuleSelector, table_id: u32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::DelPolicyRule(selector.into(), table_id));
        Ok(())
    }

    async fn install_filter_program(&self, rules: &RuleSet) -> Result<()> {
        let nibbles: Vec<u8> = rules.class_rules.iter().map(|r: &ClassMarkRule| r.class_nibble).collect();
        self.calls.lock().unwrap().push(Call::InstallFilterProgram(nibbles));
        Ok(())
    }

    async fn flush_ct_by_iface(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call::FlushCtByIface(name.to_string()));
        Ok(())
    }

    async fn list_conntrack_flows(&self) -> Result<Vec<ConntrackFlow>> {
        Ok(self.conntrack_flows.lock().unwrap().clone())
    }

    async fn set_conntrack_mark(&self, flow: &ConntrackFlow, mark: u32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::SetConntrackMark(flow.sport as u32, mark));
        Ok(())
    }
}
