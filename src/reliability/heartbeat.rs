//! Heartbeat evaluation: explicit beats plus artifact-mtime implicit
//! signals, with streak-deduplicated stale escalation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::contracts::{EventType, HeartbeatState, HeartbeatStatusRecord, Severity, SCHEMA_VERSION};
use crate::errors::LedgerError;
use crate::ledger::Ledger;

/// Invalid evaluator input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("{name} must be a positive integer")]
    NonPositive { name: &'static str },

    #[error("warning_after_seconds must be >= check_interval_seconds")]
    WarningBelowInterval,

    #[error("stale_after_seconds must be >= warning_after_seconds")]
    StaleBelowWarning,
}

/// Threshold configuration. Defaults: check every 300 s, warn at 900 s,
/// stale at 1200 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatThresholds {
    pub check_interval_seconds: u64,
    pub warning_after_seconds: u64,
    pub stale_after_seconds: u64,
}

impl Default for HeartbeatThresholds {
    fn default() -> Self {
        Self {
            check_interval_seconds: 300,
            warning_after_seconds: 900,
            stale_after_seconds: 1200,
        }
    }
}

impl HeartbeatThresholds {
    pub fn new(
        check_interval_seconds: u64,
        warning_after_seconds: u64,
        stale_after_seconds: u64,
    ) -> Result<Self, HeartbeatError> {
        for (value, name) in [
            (check_interval_seconds, "check_interval_seconds"),
            (warning_after_seconds, "warning_after_seconds"),
            (stale_after_seconds, "stale_after_seconds"),
        ] {
            if value == 0 {
                return Err(HeartbeatError::NonPositive { name });
            }
        }
        if warning_after_seconds < check_interval_seconds {
            return Err(HeartbeatError::WarningBelowInterval);
        }
        if stale_after_seconds < warning_after_seconds {
            return Err(HeartbeatError::StaleBelowWarning);
        }
        Ok(Self {
            check_interval_seconds,
            warning_after_seconds,
            stale_after_seconds,
        })
    }
}

/// Evaluation state. `Active` persists as `RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    Idle,
    Active,
    Warning,
    Stale,
}

impl EvaluationState {
    pub fn to_persisted(self) -> HeartbeatState {
        match self {
            Self::Idle => HeartbeatState::Idle,
            Self::Active => HeartbeatState::Running,
            Self::Warning => HeartbeatState::Warning,
            Self::Stale => HeartbeatState::Stale,
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvaluation {
    pub state: EvaluationState,
    pub reason_code: Option<String>,
    pub silence_seconds: u64,
    pub effective_signal_at: Option<DateTime<Utc>>,
}

/// Pure liveness state function.
///
/// Effective "last activity" is the max of the explicit heartbeat and the
/// implicit artifact signal. With no signal at all, silence equals the
/// stale threshold, so an active run with no output starts out stale. The
/// stale boundary is inclusive.
pub fn evaluate_heartbeat(
    now: DateTime<Utc>,
    execution_active: bool,
    thresholds: &HeartbeatThresholds,
    explicit_heartbeat_at: Option<DateTime<Utc>>,
    implicit_output_at: Option<DateTime<Utc>>,
) -> HeartbeatEvaluation {
    if !execution_active {
        return HeartbeatEvaluation {
            state: EvaluationState::Idle,
            reason_code: None,
            silence_seconds: 0,
            effective_signal_at: None,
        };
    }

    let effective_signal_at = match (explicit_heartbeat_at, implicit_output_at) {
        (Some(explicit), Some(implicit)) => Some(explicit.max(implicit)),
        (signal @ Some(_), None) | (None, signal @ Some(_)) => signal,
        (None, None) => None,
    };
    let silence_seconds = match effective_signal_at {
        None => thresholds.stale_after_seconds,
        Some(signal) => (now - signal).num_seconds().max(0) as u64,
    };

    if silence_seconds >= thresholds.stale_after_seconds {
        return HeartbeatEvaluation {
            state: EvaluationState::Stale,
            reason_code: Some(silence_reason_code(thresholds.stale_after_seconds)),
            silence_seconds,
            effective_signal_at,
        };
    }
    if silence_seconds >= thresholds.warning_after_seconds {
        return HeartbeatEvaluation {
            state: EvaluationState::Warning,
            reason_code: Some(silence_reason_code(thresholds.warning_after_seconds)),
            silence_seconds,
            effective_signal_at,
        };
    }
    HeartbeatEvaluation {
        state: EvaluationState::Active,
        reason_code: None,
        silence_seconds,
        effective_signal_at,
    }
}

/// Threshold-derived reason code: `NO_OUTPUT_20M` for 1200 s, `NO_OUTPUT_1H`
/// for 3600 s, seconds form otherwise.
pub fn silence_reason_code(threshold_seconds: u64) -> String {
    if threshold_seconds % 3600 == 0 {
        format!("NO_OUTPUT_{}H", threshold_seconds / 3600)
    } else if threshold_seconds % 60 == 0 {
        format!("NO_OUTPUT_{}M", threshold_seconds / 60)
    } else {
        format!("NO_OUTPUT_{}S", threshold_seconds)
    }
}

/// Newest file modification time under the run's artifact root.
pub fn latest_artifact_mtime(artifact_root: impl AsRef<Path>) -> Option<DateTime<Utc>> {
    let root = artifact_root.as_ref();
    if !root.exists() {
        return None;
    }
    let mut latest: Option<DateTime<Utc>> = None;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    let modified: DateTime<Utc> = modified.into();
                    if latest.map(|current| modified > current).unwrap_or(true) {
                        latest = Some(modified);
                    }
                }
            }
        }
    }
    latest
}

/// Result of one monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTickResult {
    pub state: EvaluationState,
    pub reason_code: Option<String>,
    pub silence_seconds: u64,
    pub stale_event_emitted: bool,
}

/// Periodic heartbeat checker bound to one run.
///
/// On the first tick entering STALE within a silence streak, exactly one
/// `HEARTBEAT_STALE` event is appended, deduplicated by
/// `(task_id, last_heartbeat_at, reason_code)`.
pub struct HeartbeatMonitor {
    task_id: String,
    run_id: String,
    step_id: Option<String>,
    artifact_root: PathBuf,
    thresholds: HeartbeatThresholds,
}

impl HeartbeatMonitor {
    pub fn new(
        task_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: Option<String>,
        artifact_root: impl AsRef<Path>,
        thresholds: HeartbeatThresholds,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            run_id: run_id.into(),
            step_id,
            artifact_root: artifact_root.as_ref().to_path_buf(),
            thresholds,
        }
    }

    /// Record an explicit beat, resetting the status to RUNNING.
    pub fn record_explicit_heartbeat(
        &self,
        ledger: &Ledger,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatStatusRecord, LedgerError> {
        let current = ledger.load_heartbeat()?;
        let record = HeartbeatStatusRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            status: HeartbeatState::Running,
            reason_code: None,
            last_heartbeat_at: Some(at),
            observed_at: at,
            warning_after_seconds: Some(self.thresholds.warning_after_seconds),
            stale_after_seconds: Some(self.thresholds.stale_after_seconds),
            last_escalation_at: current.last_escalation_at,
        };
        ledger.save_heartbeat(&record)?;
        Ok(record)
    }

    /// Evaluate liveness once and persist the outcome.
    pub fn tick(&self, ledger: &Ledger, now: DateTime<Utc>) -> Result<HeartbeatTickResult, LedgerError> {
        let current = ledger.load_heartbeat()?;
        let implicit = latest_artifact_mtime(&self.artifact_root);
        let evaluation = evaluate_heartbeat(
            now,
            true,
            &self.thresholds,
            current.last_heartbeat_at,
            implicit,
        );
        let persisted_state = evaluation.state.to_persisted();

        let mut stale_event_emitted = false;
        let mut last_escalation_at = current.last_escalation_at;
        if persisted_state == HeartbeatState::Stale && current.status != HeartbeatState::Stale {
            let signal = evaluation
                .effective_signal_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "none".to_string());
            let reason = evaluation
                .reason_code
                .clone()
                .unwrap_or_else(|| "UNKNOWN".to_string());
            let event = ledger.append_event(
                &self.task_id,
                &self.run_id,
                self.step_id.as_deref(),
                EventType::HeartbeatStale,
                Severity::Warn,
                serde_json::json!({
                    "reason_code": reason,
                    "silence_seconds": evaluation.silence_seconds,
                    "stale_after_seconds": self.thresholds.stale_after_seconds,
                    "effective_signal_at": evaluation.effective_signal_at.map(|at| at.to_rfc3339()),
                }),
                Some(format!("heartbeat-stale:{}:{signal}:{reason}", self.task_id)),
            )?;
            stale_event_emitted = true;
            last_escalation_at = Some(event.timestamp);
        }

        ledger.save_heartbeat(&HeartbeatStatusRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            status: persisted_state,
            reason_code: evaluation.reason_code.clone(),
            last_heartbeat_at: evaluation.effective_signal_at,
            observed_at: now,
            warning_after_seconds: Some(self.thresholds.warning_after_seconds),
            stale_after_seconds: Some(self.thresholds.stale_after_seconds),
            last_escalation_at,
        })?;

        Ok(HeartbeatTickResult {
            state: evaluation.state,
            reason_code: evaluation.reason_code,
            silence_seconds: evaluation.silence_seconds,
            stale_event_emitted,
        })
    }
}
