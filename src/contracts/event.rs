//! Append-only event journal records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed event-type vocabulary. Values are frozen for the 1.0.0 family;
/// new detail goes into the event payload, never into new variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    LifecycleTransition,
    StepStarted,
    StepCompleted,
    StepFailed,
    DispatchCompleted,
    HeartbeatWarning,
    HeartbeatStale,
    LeaseTakeover,
    LeaseAdopted,
    LeaseNotAdopted,
    SuccessionAccepted,
    ReworkEmitted,
    HumanInput,
    AcceptancePassed,
    AcceptanceFailed,
    CheckpointPersisted,
    HandoffCreated,
    HandoffApplied,
    RunDone,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LifecycleTransition => "LIFECYCLE_TRANSITION",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::DispatchCompleted => "DISPATCH_COMPLETED",
            Self::HeartbeatWarning => "HEARTBEAT_WARNING",
            Self::HeartbeatStale => "HEARTBEAT_STALE",
            Self::LeaseTakeover => "LEASE_TAKEOVER",
            Self::LeaseAdopted => "LEASE_ADOPTED",
            Self::LeaseNotAdopted => "LEASE_NOT_ADOPTED",
            Self::SuccessionAccepted => "SUCCESSION_ACCEPTED",
            Self::ReworkEmitted => "REWORK_EMITTED",
            Self::HumanInput => "HUMAN_INPUT",
            Self::AcceptancePassed => "ACCEPTANCE_PASSED",
            Self::AcceptanceFailed => "ACCEPTANCE_FAILED",
            Self::CheckpointPersisted => "CHECKPOINT_PERSISTED",
            Self::HandoffCreated => "HANDOFF_CREATED",
            Self::HandoffApplied => "HANDOFF_APPLIED",
            Self::RunDone => "RUN_DONE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// One journal entry. `event_id` is assigned by the ledger at append time,
/// strictly increasing within a ledger, and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: String,
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub task_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Whether this event belongs to the given run.
    pub fn matches_run(&self, task_id: &str, run_id: &str) -> bool {
        self.task_id == task_id && self.run_id == run_id
    }
}
