//! Append-only JSON-lines event log (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    Stop,
    Failover,
    Recovery,
    ManualDisable,
    ManualEnable,
    Reload,
    ReloadFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventLogEntry {
    pub fn new(event_type: EventType, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            message: message.into(),
            data,
        }
    }

    /// Render as a single JSON line, newline-terminated, ready to append.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_event_serializes_type_as_screaming_snake() {
        let e = EventLogEntry::new(
            EventType::Failover,
            "eth0 failed",
            serde_json::json!({"interface": "eth0"}),
        );
        let line = e.to_line().unwrap();
        assert!(line.contains("\"type\":\"FAILOVER\""));
        assert!(line.ends_with('\n'));
    }
}
