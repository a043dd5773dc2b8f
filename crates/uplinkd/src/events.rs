//! The typed event channel that replaces the original's dynamic-method
//! override integration (spec §9). Probe samples and Control-API admin
//! edits are both posted here; the Health State Machine is the sole
//! consumer and totally orders them (spec §5).

use uplinkd_common::ProbeSample;

/// Inbound to the Health State Machine.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Probe(ProbeSample),
    Admin(AdminCommand),
}

/// Operator-originated commands, submitted through the Control API and
/// serialized through the same queue as probe samples (spec §4.7).
#[derive(Debug, Clone)]
pub enum AdminCommand {
    Enable { uplink: String },
    Disable { uplink: String },
    AddUplink(Box<uplinkd_common::Uplink>),
    RemoveUplink { uplink: String },
    Reload,
}

/// Outbound from the Health State Machine to the Route Programmer and
/// Flow Classifier. One batch is produced per processed `DaemonEvent`,
/// possibly empty when the event caused no visible transition.
#[derive(Debug, Clone)]
pub enum Transition {
    EnabledUp { uplink: String },
    /// `table_id` is carried so the Route Programmer can tear down the
    /// departed uplink's table/rules even though it is already gone from
    /// the configuration by the time this transition is applied.
    /// `mark_bits` is carried alongside `table_id` for the same reason, so
    /// the fwmark policy rule can be torn down too.
    DisabledDown {
        uplink: String,
        table_id: u32,
        mark_bits: u8,
    },
    Promoted { uplink: String },
    Demoted { uplink: String },
    Failed { uplink: String },
    Recovered { uplink: String },
}

impl Transition {
    pub fn uplink(&self) -> &str {
        match self {
            Transition::EnabledUp { uplink }
            | Transition::DisabledDown { uplink, .. }
            | Transition::Promoted { uplink }
            | Transition::Demoted { uplink }
            | Transition::Failed { uplink }
            | Transition::Recovered { uplink } => uplink,
        }
    }
}
