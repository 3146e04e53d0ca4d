//! Pipeline state snapshot and step contracts.
//!
//! One `PipelineState` exists per `(task_id, run_id)`. Only the lifecycle
//! runtime's transition and acceptance nodes mutate it; everything else
//! reads through the ledger facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::SCHEMA_VERSION;

/// Overall lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Planning,
    Analysis,
    Freeze,
    Execute,
    Accept,
    Done,
    Draining,
    Blocked,
    Failed,
}

impl PipelineStatus {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Analysis => "ANALYSIS",
            Self::Freeze => "FREEZE",
            Self::Execute => "EXECUTE",
            Self::Accept => "ACCEPT",
            Self::Done => "DONE",
            Self::Draining => "DRAINING",
            Self::Blocked => "BLOCKED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a persisted status value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PLANNING" => Some(Self::Planning),
            "ANALYSIS" => Some(Self::Analysis),
            "FREEZE" => Some(Self::Freeze),
            "EXECUTE" => Some(Self::Execute),
            "ACCEPT" => Some(Self::Accept),
            "DONE" => Some(Self::Done),
            "DRAINING" => Some(Self::Draining),
            "BLOCKED" => Some(Self::Blocked),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// All known status values, for diagnostics.
    pub fn known_values() -> &'static [&'static str] {
        &[
            "PLANNING", "ANALYSIS", "FREEZE", "EXECUTE", "ACCEPT", "DONE", "DRAINING", "BLOCKED",
            "FAILED",
        ]
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContract {
    pub id: String,
    pub title: String,
    pub category: String,
    pub goal: String,
    pub actions: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub dependencies: Vec<String>,
    /// Path globs the dispatch action is allowed to touch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_scope: Option<Vec<String>>,
    /// Whether verification.log must carry command evidence markers.
    #[serde(default)]
    pub require_command_evidence: bool,
    /// Free-form retrieval advisory configuration, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_policy: Option<serde_json::Value>,
}

/// Successor executor identity recorded after a takeover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessorIdentity {
    pub thread_id: String,
    pub pid: u32,
}

/// Succession sub-record. Extensible: new detail fields may be added here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Succession {
    pub enabled: bool,
    pub last_takeover_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<SuccessorIdentity>,
}

impl Default for Succession {
    fn default() -> Self {
        Self {
            enabled: true,
            last_takeover_at: None,
            successor: None,
        }
    }
}

/// The pipeline state snapshot, one per `(task_id, run_id)`.
///
/// Top-level shape is closed; free-form extension goes through
/// `role_lifecycle` subkeys (for example `step:<id> -> <state>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: String,
    pub task_id: Option<String>,
    pub run_id: Option<String>,
    pub goal: String,
    pub status: PipelineStatus,
    pub current_step: Option<String>,
    pub steps: Vec<StepContract>,
    pub role_lifecycle: BTreeMap<String, String>,
    pub succession: Succession,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Baseline state for a freshly initialized ledger.
    pub fn initial(now: DateTime<Utc>) -> Self {
        let mut role_lifecycle = BTreeMap::new();
        role_lifecycle.insert("orchestrator".to_string(), "idle".to_string());
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            task_id: None,
            run_id: None,
            goal: String::new(),
            status: PipelineStatus::Planning,
            current_step: None,
            steps: Vec::new(),
            role_lifecycle,
            succession: Succession::default(),
            updated_at: now,
        }
    }

    /// Lifecycle marker for a step, read from `role_lifecycle`.
    pub fn step_lifecycle(&self, step_id: &str) -> Option<&str> {
        self.role_lifecycle
            .get(&format!("step:{step_id}"))
            .map(String::as_str)
    }

    /// Record a lifecycle marker for a step.
    pub fn set_step_lifecycle(&mut self, step_id: &str, value: impl Into<String>) {
        self.role_lifecycle
            .insert(format!("step:{step_id}"), value.into());
    }

    /// Find a step contract by id.
    pub fn step(&self, step_id: &str) -> Option<&StepContract> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Classify a step from its lifecycle marker.
    pub fn classify_step(&self, step_id: &str) -> StepClassification {
        classify_step_lifecycle(self.step_lifecycle(step_id))
    }

    /// Step ids that remain resumable: anything not classified accepted.
    pub fn resumable_step_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|step| self.classify_step(&step.id) != StepClassification::Accepted)
            .map(|step| step.id.clone())
            .collect()
    }
}

/// Coarse step classification derived from lifecycle markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepClassification {
    Accepted,
    Failed,
    Pending,
}

const ACCEPTED_MARKERS: &[&str] = &["accepted", "done", "completed", "passed", "verified"];

/// Map a free-form `step:<id>` lifecycle marker onto the resume taxonomy.
///
/// Accepted markers also match prefixed forms such as `accepted_clean` or
/// `done-2024`; anything carrying `failed`, `error`, or `blocked` counts as
/// failed; everything else stays pending (and therefore resumable).
pub fn classify_step_lifecycle(marker: Option<&str>) -> StepClassification {
    let Some(raw) = marker else {
        return StepClassification::Pending;
    };
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return StepClassification::Pending;
    }
    for marker in ACCEPTED_MARKERS {
        if normalized == *marker
            || normalized.starts_with(&format!("{marker}_"))
            || normalized.starts_with(&format!("{marker}-"))
        {
            return StepClassification::Accepted;
        }
    }
    if normalized.contains("failed") || normalized == "error" || normalized == "blocked" {
        return StepClassification::Failed;
    }
    StepClassification::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_serde() {
        for raw in PipelineStatus::known_values() {
            let parsed = PipelineStatus::parse(raw).unwrap();
            let json = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, format!("\"{raw}\""));
        }
        assert!(PipelineStatus::parse("RUNNING").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(PipelineStatus::Done.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(!PipelineStatus::Execute.is_terminal());
        assert!(!PipelineStatus::Draining.is_terminal());
    }

    #[test]
    fn initial_state_has_closed_shape() {
        let state = PipelineState::initial(Utc::now());
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.status, PipelineStatus::Planning);
        assert!(state.succession.enabled);
        assert_eq!(
            state.role_lifecycle.get("orchestrator").map(String::as_str),
            Some("idle")
        );
    }

    #[test]
    fn classify_step_lifecycle_markers() {
        assert_eq!(
            classify_step_lifecycle(Some("accepted")),
            StepClassification::Accepted
        );
        assert_eq!(
            classify_step_lifecycle(Some("done_clean")),
            StepClassification::Accepted
        );
        assert_eq!(
            classify_step_lifecycle(Some("passed-2026")),
            StepClassification::Accepted
        );
        assert_eq!(
            classify_step_lifecycle(Some("failed_non_adopted_lease")),
            StepClassification::Failed
        );
        assert_eq!(
            classify_step_lifecycle(Some("blocked")),
            StepClassification::Failed
        );
        assert_eq!(
            classify_step_lifecycle(Some("owned_by_lane:controller")),
            StepClassification::Pending
        );
        assert_eq!(classify_step_lifecycle(None), StepClassification::Pending);
    }

    #[test]
    fn resumable_steps_exclude_accepted() {
        let mut state = PipelineState::initial(Utc::now());
        state.steps = vec![step("S1"), step("S2"), step("S3")];
        state.set_step_lifecycle("S1", "accepted");
        state.set_step_lifecycle("S2", "failed_rework_exhausted");
        assert_eq!(state.resumable_step_ids(), vec!["S2", "S3"]);
    }

    fn step(id: &str) -> StepContract {
        StepContract {
            id: id.to_string(),
            title: format!("Step {id}"),
            category: "implementation".to_string(),
            goal: "demo".to_string(),
            actions: vec!["act".to_string()],
            acceptance_criteria: vec!["crit".to_string()],
            expected_outputs: vec![format!("{id}/report.md")],
            dependencies: vec![],
            allowed_scope: None,
            require_command_evidence: false,
            retrieval_policy: None,
        }
    }
}
