//! Succession: transfer of active leases to a successor executor on
//! controller replacement.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::contracts::{EventType, HeartbeatState, LeaseStatus, Severity, SuccessorIdentity};
use crate::errors::LedgerError;
use crate::ledger::Ledger;

use super::handoff::{HandoffError, HandoffStore, ResumePlan};
use super::lease::{LeaseError, LeaseRegistry, DEFAULT_CONTROLLER_LANE};

/// Succession failures.
#[derive(Debug, Error)]
pub enum SuccessionError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Outcome of a succession acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessionTakeoverResult {
    pub task_id: String,
    pub run_id: String,
    pub takeover_at: DateTime<Utc>,
    pub adopted_step_ids: Vec<String>,
    pub failed_step_ids: Vec<String>,
}

/// Decision of a self-healing evaluation tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfHealingDecision {
    pub action: SelfHealingAction,
    pub heartbeat_status: String,
    pub lease_reason_code: String,
    pub reason_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfHealingAction {
    Takeover,
    Observe,
}

impl SelfHealingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Takeover => "TAKEOVER",
            Self::Observe => "OBSERVE",
        }
    }
}

/// Outcome of one full self-healing cycle.
#[derive(Debug, Clone)]
pub struct SelfHealingCycleResult {
    pub decision: SelfHealingDecision,
    pub takeover: Option<SuccessionTakeoverResult>,
    pub handoff_applied: bool,
    pub handoff_resume_plan: Option<ResumePlan>,
}

/// Handles successor acceptance and lease adoption for one run.
pub struct SuccessionManager {
    task_id: String,
    run_id: String,
}

impl SuccessionManager {
    pub fn new(task_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Accept a successor: adopt every ACTIVE unexpired lease of the run,
    /// mark the rest failed, persist the succession record, and publish
    /// the takeover events.
    pub fn accept_successor(
        &self,
        ledger: &Ledger,
        successor_thread_id: &str,
        successor_pid: u32,
        lease_ttl_seconds: Option<u64>,
        trigger_reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SuccessionTakeoverResult, SuccessionError> {
        let registry = LeaseRegistry::new(ledger);
        let batch = registry.batch_takeover_run(
            &self.task_id,
            &self.run_id,
            successor_thread_id,
            successor_pid,
            lease_ttl_seconds,
            at,
        )?;

        let adopted_step_ids = ordered_unique(batch.adopted.iter().map(|lease| lease.step_id.clone()));
        let failed_step_ids =
            ordered_unique(batch.non_adopted.iter().map(|lease| lease.step_id.clone()));

        self.persist_succession_state(
            ledger,
            successor_thread_id,
            successor_pid,
            at,
            &failed_step_ids,
        )?;
        self.append_events(
            ledger,
            at,
            &adopted_step_ids,
            &failed_step_ids,
            trigger_reason,
        )?;

        Ok(SuccessionTakeoverResult {
            task_id: self.task_id.clone(),
            run_id: self.run_id.clone(),
            takeover_at: at,
            adopted_step_ids,
            failed_step_ids,
        })
    }

    /// One self-healing cycle: decide from the heartbeat and controller
    /// lease, and take over (plus handoff recovery) only when warranted.
    pub fn run_self_healing_cycle(
        &self,
        ledger: &Ledger,
        successor_thread_id: &str,
        successor_pid: u32,
        lease_ttl_seconds: Option<u64>,
        handoff_store: Option<&HandoffStore>,
        at: DateTime<Utc>,
    ) -> Result<SelfHealingCycleResult, SuccessionError> {
        let decision = self.decide(ledger, at)?;
        self.append_decision_event(ledger, &decision, at)?;

        if decision.action != SelfHealingAction::Takeover {
            return Ok(SelfHealingCycleResult {
                decision,
                takeover: None,
                handoff_applied: false,
                handoff_resume_plan: None,
            });
        }

        let takeover = self.accept_successor(
            ledger,
            successor_thread_id,
            successor_pid,
            lease_ttl_seconds,
            Some(&decision.reason_code),
            at,
        )?;

        let (handoff_applied, handoff_resume_plan) = match handoff_store {
            Some(store) if store.package_exists() => {
                let mut state = ledger.load_state()?;
                let before_status = state.status.as_str().to_string();
                let plan = store.apply_package(&mut state, false, at)?;
                ledger.save_state(
                    &state,
                    Some("succession_handoff_recover"),
                    Some(&before_status),
                    Some(state.status.as_str()),
                )?;
                ledger.append_event(
                    &self.task_id,
                    &self.run_id,
                    plan.resume_step_id.as_deref(),
                    EventType::HandoffApplied,
                    Severity::Info,
                    serde_json::json!({
                        "takeover_at": at.to_rfc3339(),
                        "resume_step_id": plan.resume_step_id,
                        "next_action": plan.next_action,
                        "resumable_step_ids": plan.resumable_step_ids,
                    }),
                    Some(format!(
                        "handoff-applied:{}:{}:{}",
                        self.task_id,
                        self.run_id,
                        at.to_rfc3339()
                    )),
                )?;
                (true, Some(plan))
            }
            _ => (false, None),
        };

        Ok(SelfHealingCycleResult {
            decision,
            takeover: Some(takeover),
            handoff_applied,
            handoff_resume_plan,
        })
    }

    fn decide(&self, ledger: &Ledger, at: DateTime<Utc>) -> Result<SelfHealingDecision, SuccessionError> {
        let heartbeat = ledger.load_heartbeat()?;
        let heartbeat_status = heartbeat.status;
        let (lease_reason_code, lease_valid) = self.evaluate_controller_lease(ledger, at)?;

        let decision = if heartbeat_status == HeartbeatState::Stale {
            SelfHealingDecision {
                action: SelfHealingAction::Takeover,
                heartbeat_status: heartbeat_status.as_str().to_string(),
                lease_reason_code,
                reason_code: "HEARTBEAT_STALE".to_string(),
            }
        } else if !lease_valid {
            SelfHealingDecision {
                action: SelfHealingAction::Takeover,
                heartbeat_status: heartbeat_status.as_str().to_string(),
                reason_code: format!("INVALID_LEASE_{lease_reason_code}"),
                lease_reason_code,
            }
        } else if heartbeat_status == HeartbeatState::Warning {
            SelfHealingDecision {
                action: SelfHealingAction::Observe,
                heartbeat_status: heartbeat_status.as_str().to_string(),
                lease_reason_code,
                reason_code: "HEARTBEAT_WARNING_OBSERVE_ONLY".to_string(),
            }
        } else {
            SelfHealingDecision {
                action: SelfHealingAction::Observe,
                reason_code: format!("HEARTBEAT_{}_NO_ACTION", heartbeat_status.as_str()),
                heartbeat_status: heartbeat_status.as_str().to_string(),
                lease_reason_code,
            }
        };
        Ok(decision)
    }

    fn evaluate_controller_lease(
        &self,
        ledger: &Ledger,
        at: DateTime<Utc>,
    ) -> Result<(String, bool), SuccessionError> {
        let state = ledger.load_state()?;
        let controller_lane = state
            .role_lifecycle
            .get("controller_lane")
            .map(String::as_str)
            .filter(|lane| !lane.trim().is_empty())
            .unwrap_or(DEFAULT_CONTROLLER_LANE)
            .to_string();
        let controller_step = state
            .role_lifecycle
            .get("controller_ownership")
            .and_then(|ownership| ownership.split_once(':'))
            .filter(|(lane, step)| *lane == controller_lane && !step.is_empty() && *step != "unassigned")
            .map(|(_, step)| step.to_string())
            .or_else(|| state.current_step.clone());

        let registry = LeaseRegistry::new(ledger);
        let leases = registry.list(Some(&self.task_id), Some(&self.run_id))?;
        let matching: Vec<_> = leases
            .iter()
            .filter(|lease| lease.lane == controller_lane)
            .filter(|lease| {
                controller_step
                    .as_deref()
                    .map(|step| lease.step_id == step)
                    .unwrap_or(true)
            })
            .collect();
        if matching.is_empty() {
            return Ok(("MISSING_CONTROLLER_LEASE".to_string(), false));
        }
        let mut active: Vec<_> = matching
            .into_iter()
            .filter(|lease| lease.status == LeaseStatus::Active)
            .collect();
        active.sort_by(|left, right| {
            (left.updated_at, left.created_at, &left.lease_token).cmp(&(
                right.updated_at,
                right.created_at,
                &right.lease_token,
            ))
        });
        match active.last() {
            None => Ok(("NON_ACTIVE_CONTROLLER_LEASE".to_string(), false)),
            Some(newest) if newest.is_expired(at) => {
                Ok(("EXPIRED_CONTROLLER_LEASE".to_string(), false))
            }
            Some(_) => Ok(("VALID_ACTIVE_LEASE".to_string(), true)),
        }
    }

    fn persist_succession_state(
        &self,
        ledger: &Ledger,
        successor_thread_id: &str,
        successor_pid: u32,
        at: DateTime<Utc>,
        failed_step_ids: &[String],
    ) -> Result<(), SuccessionError> {
        let mut state = ledger.load_state()?;
        let prior_status = state.status.as_str().to_string();
        let mut changed = false;

        if state.task_id.as_deref() != Some(self.task_id.as_str()) {
            state.task_id = Some(self.task_id.clone());
            changed = true;
        }
        if state.run_id.as_deref() != Some(self.run_id.as_str()) {
            state.run_id = Some(self.run_id.clone());
            changed = true;
        }
        if state.succession.last_takeover_at != Some(at) {
            state.succession.last_takeover_at = Some(at);
            changed = true;
        }
        let successor = SuccessorIdentity {
            thread_id: successor_thread_id.trim().to_string(),
            pid: successor_pid,
        };
        if state.succession.successor.as_ref() != Some(&successor) {
            state.succession.successor = Some(successor);
            changed = true;
        }
        for step_id in failed_step_ids {
            let key = format!("step:{step_id}");
            if state.role_lifecycle.get(&key).map(String::as_str) != Some("failed_non_adopted_lease")
            {
                state
                    .role_lifecycle
                    .insert(key, "failed_non_adopted_lease".to_string());
                changed = true;
            }
        }

        if changed {
            ledger.save_state(
                &state,
                Some("succession_takeover"),
                Some(&prior_status),
                Some(state.status.as_str()),
            )?;
        }
        Ok(())
    }

    fn append_events(
        &self,
        ledger: &Ledger,
        at: DateTime<Utc>,
        adopted_step_ids: &[String],
        failed_step_ids: &[String],
        trigger_reason: Option<&str>,
    ) -> Result<(), SuccessionError> {
        let takeover_key = at.to_rfc3339();
        ledger.append_event(
            &self.task_id,
            &self.run_id,
            None,
            EventType::LeaseTakeover,
            Severity::Info,
            serde_json::json!({
                "takeover_at": takeover_key,
                "adopted_step_ids": adopted_step_ids,
                "failed_step_ids": failed_step_ids,
                "reason_code": trigger_reason.unwrap_or("MANUAL_TAKEOVER"),
            }),
            Some(format!(
                "succession:{}:{}:{takeover_key}",
                self.task_id, self.run_id
            )),
        )?;
        ledger.append_event(
            &self.task_id,
            &self.run_id,
            None,
            EventType::SuccessionAccepted,
            Severity::Info,
            serde_json::json!({
                "takeover_at": takeover_key,
                "adopted_step_ids": adopted_step_ids,
                "failed_step_ids": failed_step_ids,
            }),
            Some(format!(
                "succession-accepted:{}:{}:{takeover_key}",
                self.task_id, self.run_id
            )),
        )?;

        for step_id in adopted_step_ids {
            ledger.append_event(
                &self.task_id,
                &self.run_id,
                Some(step_id),
                EventType::LeaseAdopted,
                Severity::Info,
                serde_json::json!({
                    "reason_code": "VALID_UNEXPIRED_LEASE",
                    "takeover_at": takeover_key,
                }),
                Some(format!(
                    "lease-adopted:{}:{}:{step_id}:{takeover_key}",
                    self.task_id, self.run_id
                )),
            )?;
        }
        for step_id in failed_step_ids {
            ledger.append_event(
                &self.task_id,
                &self.run_id,
                Some(step_id),
                EventType::StepFailed,
                Severity::Error,
                serde_json::json!({
                    "reason_code": "LEASE_NOT_ADOPTED",
                    "takeover_at": takeover_key,
                }),
                Some(format!(
                    "step-failed:{}:{}:{step_id}:{takeover_key}",
                    self.task_id, self.run_id
                )),
            )?;
        }
        Ok(())
    }

    fn append_decision_event(
        &self,
        ledger: &Ledger,
        decision: &SelfHealingDecision,
        at: DateTime<Utc>,
    ) -> Result<(), SuccessionError> {
        let (event_type, severity) = if decision.heartbeat_status == "STALE" {
            (EventType::HeartbeatStale, Severity::Warn)
        } else if decision.action == SelfHealingAction::Observe
            && decision.heartbeat_status == "WARNING"
        {
            (EventType::HeartbeatWarning, Severity::Warn)
        } else if decision.action == SelfHealingAction::Takeover {
            (EventType::LifecycleTransition, Severity::Warn)
        } else {
            (EventType::LifecycleTransition, Severity::Info)
        };
        let current_step = ledger.load_state()?.current_step;
        ledger.append_event(
            &self.task_id,
            &self.run_id,
            current_step.as_deref(),
            event_type,
            severity,
            serde_json::json!({
                "stage": "decide",
                "decision_action": decision.action.as_str(),
                "decision_reason_code": decision.reason_code,
                "heartbeat_status": decision.heartbeat_status,
                "lease_reason_code": decision.lease_reason_code,
                "takeover_required": decision.action == SelfHealingAction::Takeover,
                "decided_at": at.to_rfc3339(),
            }),
            Some(format!(
                "self-heal:{}:{}:{}:{}:{}",
                self.task_id,
                self.run_id,
                decision.action.as_str(),
                decision.heartbeat_status,
                decision.lease_reason_code
            )),
        )?;
        Ok(())
    }
}

fn ordered_unique(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut ordered = Vec::new();
    for value in values {
        if seen.insert(value.clone()) {
            ordered.push(value);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::EventType;
    use crate::reliability::lease::RegisterLease;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn open_ledger(root: &std::path::Path) -> Ledger {
        Ledger::open_with_selection(root, Some("filesystem"), &BTreeMap::new()).unwrap()
    }

    fn seed_run(ledger: &Ledger) {
        let mut state = ledger.load_state().unwrap();
        state.task_id = Some("T1".to_string());
        state.run_id = Some("R1".to_string());
        ledger.save_state(&state, None, None, None).unwrap();
    }

    fn register(ledger: &Ledger, step_id: &str, ttl: u64, at: DateTime<Utc>) {
        LeaseRegistry::new(ledger)
            .register(
                &RegisterLease {
                    lane: "default".to_string(),
                    step_id: step_id.to_string(),
                    task_id: "T1".to_string(),
                    run_id: "R1".to_string(),
                    thread_id: "thread-original".to_string(),
                    pid: 100,
                    ttl_seconds: ttl,
                },
                at,
            )
            .unwrap();
    }

    #[test]
    fn accept_successor_adopts_active_and_fails_expired() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed_run(&ledger);
        let start = Utc::now();
        register(&ledger, "S1", 1200, start);
        register(&ledger, "S2", 10, start);

        let manager = SuccessionManager::new("T1", "R1");
        let result = manager
            .accept_successor(
                &ledger,
                "thread-recover",
                4242,
                None,
                None,
                start + Duration::seconds(60),
            )
            .unwrap();
        assert_eq!(result.adopted_step_ids, vec!["S1"]);
        assert_eq!(result.failed_step_ids, vec!["S2"]);

        let state = ledger.load_state().unwrap();
        assert_eq!(
            state.succession.last_takeover_at,
            Some(start + Duration::seconds(60))
        );
        assert_eq!(
            state.succession.successor.as_ref().unwrap().thread_id,
            "thread-recover"
        );
        assert_eq!(
            state.role_lifecycle.get("step:S2").map(String::as_str),
            Some("failed_non_adopted_lease")
        );

        let events = ledger.list_events().unwrap();
        let types: Vec<EventType> = events.iter().map(|event| event.event_type).collect();
        assert!(types.contains(&EventType::LeaseTakeover));
        assert!(types.contains(&EventType::SuccessionAccepted));
        assert!(types.contains(&EventType::LeaseAdopted));
        assert!(types.contains(&EventType::StepFailed));

        let takeover = events
            .iter()
            .find(|event| event.event_type == EventType::LeaseTakeover)
            .unwrap();
        assert_eq!(takeover.payload["adopted_step_ids"][0], "S1");
        assert_eq!(takeover.payload["reason_code"], "MANUAL_TAKEOVER");
    }

    #[test]
    fn adopted_set_is_subset_of_active_unexpired() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed_run(&ledger);
        let start = Utc::now();
        register(&ledger, "S1", 1200, start);
        let registry = LeaseRegistry::new(&ledger);
        let leases = registry.list(Some("T1"), Some("R1")).unwrap();
        registry
            .release(&leases[0].lease_token, "T1", "R1", "S1", start)
            .unwrap();

        let manager = SuccessionManager::new("T1", "R1");
        let result = manager
            .accept_successor(&ledger, "thread-x", 7, None, None, start + Duration::seconds(1))
            .unwrap();
        assert!(result.adopted_step_ids.is_empty());
        assert!(result.failed_step_ids.is_empty());
    }

    #[test]
    fn self_healing_observes_on_running_heartbeat() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed_run(&ledger);
        let now = Utc::now();
        register(&ledger, "S1", 1200, now);

        let mut heartbeat = ledger.load_heartbeat().unwrap();
        heartbeat.status = HeartbeatState::Running;
        heartbeat.last_heartbeat_at = Some(now);
        ledger.save_heartbeat(&heartbeat).unwrap();

        let manager = SuccessionManager::new("T1", "R1");
        let cycle = manager
            .run_self_healing_cycle(&ledger, "thread-x", 7, None, None, now)
            .unwrap();
        assert_eq!(cycle.decision.action, SelfHealingAction::Observe);
        assert!(cycle.takeover.is_none());
        assert_eq!(cycle.decision.lease_reason_code, "VALID_ACTIVE_LEASE");
    }

    #[test]
    fn self_healing_takes_over_on_stale_heartbeat() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed_run(&ledger);
        let now = Utc::now();
        register(&ledger, "S1", 1200, now);

        let mut heartbeat = ledger.load_heartbeat().unwrap();
        heartbeat.status = HeartbeatState::Stale;
        heartbeat.reason_code = Some("NO_OUTPUT_20M".to_string());
        ledger.save_heartbeat(&heartbeat).unwrap();

        let manager = SuccessionManager::new("T1", "R1");
        let cycle = manager
            .run_self_healing_cycle(&ledger, "thread-recover", 9, None, None, now)
            .unwrap();
        assert_eq!(cycle.decision.action, SelfHealingAction::Takeover);
        assert_eq!(cycle.decision.reason_code, "HEARTBEAT_STALE");
        let takeover = cycle.takeover.unwrap();
        assert_eq!(takeover.adopted_step_ids, vec!["S1"]);
    }

    #[test]
    fn self_healing_takes_over_when_controller_lease_missing() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed_run(&ledger);
        let now = Utc::now();

        let mut heartbeat = ledger.load_heartbeat().unwrap();
        heartbeat.status = HeartbeatState::Running;
        ledger.save_heartbeat(&heartbeat).unwrap();

        let manager = SuccessionManager::new("T1", "R1");
        let cycle = manager
            .run_self_healing_cycle(&ledger, "thread-x", 7, None, None, now)
            .unwrap();
        assert_eq!(cycle.decision.action, SelfHealingAction::Takeover);
        assert_eq!(
            cycle.decision.reason_code,
            "INVALID_LEASE_MISSING_CONTROLLER_LEASE"
        );
    }
}
