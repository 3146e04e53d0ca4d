//! Heartbeat status records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SCHEMA_VERSION;

/// Persisted heartbeat liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatState {
    Idle,
    Running,
    Warning,
    Stale,
    Blocked,
}

impl HeartbeatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Warning => "WARNING",
            Self::Stale => "STALE",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Persisted heartbeat status document, owned by the heartbeat evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatStatusRecord {
    pub schema_version: String,
    pub status: HeartbeatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_escalation_at: Option<DateTime<Utc>>,
}

impl HeartbeatStatusRecord {
    /// Baseline record for a freshly initialized ledger.
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            status: HeartbeatState::Idle,
            reason_code: None,
            last_heartbeat_at: None,
            observed_at: now,
            warning_after_seconds: None,
            stale_after_seconds: None,
            last_escalation_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_record_is_idle() {
        let record = HeartbeatStatusRecord::initial(Utc::now());
        assert_eq!(record.status, HeartbeatState::Idle);
        assert!(record.reason_code.is_none());
        assert!(record.last_heartbeat_at.is_none());
    }

    #[test]
    fn state_values_match_contract() {
        assert_eq!(
            serde_json::to_string(&HeartbeatState::Stale).unwrap(),
            "\"STALE\""
        );
        let parsed: HeartbeatState = serde_json::from_str("\"BLOCKED\"").unwrap();
        assert_eq!(parsed, HeartbeatState::Blocked);
    }
}
