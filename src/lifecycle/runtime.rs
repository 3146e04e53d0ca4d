//! The lifecycle runtime: a deterministic node graph over the ledger.
//!
//! Each node re-reads the ledger, runs under a transition guard, persists
//! the post-node snapshot (with checkpoint), and announces the transition
//! through the event journal. Given the same ledger snapshot and inputs the
//! same node visits occur; free-text content may vary but the sequence and
//! artifact shapes do not.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::acceptance::{
    AcceptanceConfig, AcceptanceEngine, AcceptanceStatus, ReworkPayload, REASON_REWORK_EXHAUSTED,
};
use crate::contracts::{
    EventType, PipelineState, PipelineStatus, Severity, StepClassification, StepContract,
};
use crate::dispatch::{DispatchAdapter, DispatchCallResult, DispatchRequest};
use crate::errors::LifecycleError;
use crate::ledger::canonical::canonical_hash;
use crate::ledger::Ledger;
use crate::planner::{compile_plan, PlanInput, StepInput};
use crate::reliability::handoff::HandoffStore;
use crate::reliability::lease::LeaseRegistry;

use super::state_machine::{
    guard_transition, node_transition, resolve_conditional_route, RouteDecision,
};

const MARKER_ACCEPTANCE: &str = "acceptance";
const MARKER_PENDING_DISPATCH: &str = "pending_dispatch";
const MARKER_PENDING_REWORK: &str = "pending_rework";

/// Runtime construction options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Default step id for the bootstrap contract when no plan is given.
    pub step_id: String,
    /// Evidence root the acceptance engine evaluates against.
    pub evidence_root: PathBuf,
}

impl RunOptions {
    pub fn at_root(root: impl AsRef<Path>) -> Self {
        Self {
            step_id: "S1".to_string(),
            evidence_root: root.as_ref().join("artifacts").join("evidence"),
        }
    }
}

/// Aggregate view returned by `status()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusView {
    pub pipeline_state: PipelineState,
    pub heartbeat_status: crate::contracts::HeartbeatStatusRecord,
    pub leases: Vec<crate::contracts::ProcessLease>,
    pub handoff_package_path: Option<String>,
}

/// Deterministic lifecycle graph bound to one `(task_id, run_id)`.
///
/// Single-writer: one runtime advances the lifecycle for a given run;
/// parallelism across runs comes from independent runtimes over disjoint
/// ledger roots.
pub struct LifecycleRuntime {
    task_id: String,
    run_id: String,
    goal: String,
    options: RunOptions,
    ledger: Ledger,
    dispatch: Option<Box<dyn DispatchAdapter>>,
    acceptance_engine: AcceptanceEngine,
    acceptance_config: AcceptanceConfig,
}

impl LifecycleRuntime {
    pub fn new(
        task_id: impl Into<String>,
        run_id: impl Into<String>,
        goal: impl Into<String>,
        ledger: Ledger,
        dispatch: Option<Box<dyn DispatchAdapter>>,
        acceptance_config: AcceptanceConfig,
        options: RunOptions,
    ) -> Result<Self, LifecycleError> {
        let runtime = Self {
            task_id: task_id.into(),
            run_id: run_id.into(),
            goal: goal.into(),
            options,
            ledger,
            dispatch,
            acceptance_engine: AcceptanceEngine::new(),
            acceptance_config,
        };
        runtime.bootstrap()?;
        Ok(runtime)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Seed the ledger exactly once: run identity, goal, default step
    /// contract, controller lane markers, succession record.
    fn bootstrap(&self) -> Result<(), LifecycleError> {
        let mut state = self.ledger.load_state()?;
        let mut changed = false;

        if state.task_id.as_deref() != Some(self.task_id.as_str()) {
            state.task_id = Some(self.task_id.clone());
            changed = true;
        }
        if state.run_id.as_deref() != Some(self.run_id.as_str()) {
            state.run_id = Some(self.run_id.clone());
            changed = true;
        }
        if state.goal.is_empty() {
            state.goal = self.goal.clone();
            changed = true;
        }
        let lane_missing = state
            .role_lifecycle
            .get("controller_lane")
            .map(|lane| lane.trim().is_empty())
            .unwrap_or(true);
        if lane_missing {
            state
                .role_lifecycle
                .insert("controller_lane".to_string(), "controller".to_string());
            changed = true;
        }
        let ownership_missing = state
            .role_lifecycle
            .get("controller_ownership")
            .map(|ownership| ownership.trim().is_empty())
            .unwrap_or(true);
        if ownership_missing {
            let lane = state
                .role_lifecycle
                .get("controller_lane")
                .cloned()
                .unwrap_or_else(|| "controller".to_string());
            state
                .role_lifecycle
                .insert("controller_ownership".to_string(), format!("{lane}:unassigned"));
            changed = true;
        }
        if state.steps.is_empty() {
            state.steps = vec![self.default_step_contract()];
            changed = true;
        }

        if changed {
            self.ledger
                .save_state(&state, Some("bootstrap"), None, Some(state.status.as_str()))?;
        }
        Ok(())
    }

    fn default_step_contract(&self) -> StepContract {
        StepContract {
            id: self.options.step_id.clone(),
            title: "Execute the run goal".to_string(),
            category: "implementation".to_string(),
            goal: self.goal.clone(),
            actions: vec![
                "Carry out the goal end to end".to_string(),
                "Persist evidence artifacts at the declared output paths".to_string(),
            ],
            acceptance_criteria: vec![
                "Declared evidence artifacts exist at their output paths".to_string(),
            ],
            expected_outputs: vec![
                "report.md".to_string(),
                "verification.log".to_string(),
                "audit-summary.md".to_string(),
            ],
            dependencies: vec![],
            allowed_scope: None,
            require_command_evidence: false,
            retrieval_policy: None,
        }
    }

    /// Drive the graph to a terminal status.
    pub fn run(&self) -> Result<PipelineState, LifecycleError> {
        loop {
            let state = self.ledger.load_state()?;
            debug!(status = state.status.as_str(), "lifecycle tick");
            match state.status {
                PipelineStatus::Done | PipelineStatus::Failed | PipelineStatus::Blocked => {
                    return Ok(state)
                }
                PipelineStatus::Planning => {
                    self.extract()?;
                }
                PipelineStatus::Analysis => {
                    self.plan()?;
                }
                PipelineStatus::Freeze => {
                    self.dispatch()?;
                }
                PipelineStatus::Execute => {
                    self.dispatch_pending_work(&state)?;
                    self.verify()?;
                }
                PipelineStatus::Accept => {
                    self.transition()?;
                }
                PipelineStatus::Draining => {
                    self.resolve_draining()?;
                }
            }
        }
    }

    /// Recover from the latest valid checkpoint and continue. Accepted
    /// steps are never re-dispatched; only pending, failed, or running
    /// steps remain resumable.
    pub fn resume(&self) -> Result<PipelineState, LifecycleError> {
        let recovered = self.ledger.latest_valid_checkpoint()?;
        let status = recovered.status.as_str().to_string();
        info!(status = %status, "resuming from checkpoint");
        self.ledger
            .save_state(&recovered, Some("checkpoint_resume"), Some(&status), Some(&status))?;
        self.run()
    }

    /// Aggregate view: state + leases + heartbeat + handoff pointer.
    pub fn status(&self) -> Result<StatusView, LifecycleError> {
        let pipeline_state = self.ledger.load_state()?;
        let heartbeat_status = self.ledger.load_heartbeat()?;
        let leases = LeaseRegistry::new(&self.ledger)
            .list(Some(&self.task_id), Some(&self.run_id))
            .map_err(|lease_error| LifecycleError::RunFailed(lease_error.to_string()))?;
        let handoff = HandoffStore::at_root(self.ledger.root());
        Ok(StatusView {
            pipeline_state,
            heartbeat_status,
            leases,
            handoff_package_path: handoff
                .package_exists()
                .then(|| handoff.package_path().display().to_string()),
        })
    }

    /// extract: PLANNING -> ANALYSIS.
    pub fn extract(&self) -> Result<PipelineState, LifecycleError> {
        self.execute_node("extract", |_runtime, state| {
            state
                .role_lifecycle
                .insert("analysis".to_string(), "prepared".to_string());
            Ok(())
        })
    }

    /// plan: ANALYSIS -> FREEZE. Compiles the step list into validated
    /// contracts with stable identity.
    pub fn plan(&self) -> Result<PipelineState, LifecycleError> {
        self.execute_node("plan", |_runtime, state| {
            let steps: Vec<StepInput> = state
                .steps
                .iter()
                .map(|step| StepInput {
                    id: Some(step.id.clone()),
                    title: Some(step.title.clone()),
                    category: Some(step.category.clone()),
                    goal: step.goal.clone(),
                    actions: step.actions.clone(),
                    acceptance_criteria: step.acceptance_criteria.clone(),
                    expected_outputs: step.expected_outputs.clone(),
                    dependencies: step.dependencies.clone(),
                    allowed_scope: step.allowed_scope.clone(),
                    require_command_evidence: step.require_command_evidence,
                    retrieval_policy: step.retrieval_policy.clone(),
                })
                .collect();
            let plan = compile_plan(&PlanInput {
                goal: state.goal.clone(),
                task_id: state.task_id.clone(),
                run_id: state.run_id.clone(),
                external_dependencies: Vec::new(),
                steps,
            })
            .map_err(|plan_error| LifecycleError::RunFailed(format!("plan node failed: {plan_error}")))?;
            state.steps = plan.steps;
            state
                .role_lifecycle
                .insert("plan".to_string(), format!("compiled_{}_steps", state.steps.len()));
            Ok(())
        })
    }

    /// dispatch: FREEZE -> EXECUTE. Picks the current step, claims lane
    /// ownership, and performs the first adapter call.
    pub fn dispatch(&self) -> Result<PipelineState, LifecycleError> {
        self.execute_node("dispatch", |runtime, state| {
            let step_id = runtime.select_current_step(state)?;
            runtime.claim_lane(state, &step_id);
            runtime.perform_dispatch(state, &step_id, DispatchMode::Create)?;
            Ok(())
        })
    }

    /// verify: EXECUTE -> ACCEPT. Runs acceptance over the persisted
    /// artifacts and records the outcome marker the transition node routes
    /// on.
    pub fn verify(&self) -> Result<PipelineState, LifecycleError> {
        self.execute_node("verify", |runtime, state| {
            let step_id = state
                .current_step
                .clone()
                .ok_or_else(|| LifecycleError::RunFailed("verify node requires a current step".into()))?;
            runtime.evaluate_acceptance(state, &step_id)?;
            Ok(())
        })
    }

    /// transition: ACCEPT -> DONE | EXECUTE, routed on the acceptance
    /// marker with bounded rework.
    pub fn transition(&self) -> Result<PipelineState, LifecycleError> {
        let state = self.ledger.load_state()?;
        let decision = resolve_conditional_route("transition", state.status, &state)?;
        match decision.reason {
            "acceptance_failed_rework" => self.transition_rework(state, decision),
            "step_completed_next_step" => self.transition_next_step(state, decision),
            _ => self.transition_done(state, decision),
        }
    }

    /// Reliability edge: EXECUTE -> DRAINING on a stale heartbeat or a
    /// succession request.
    pub fn enter_draining(&self, trigger_reason: &str) -> Result<PipelineState, LifecycleError> {
        let mut state = self.ledger.load_state()?;
        guard_transition(state.status, PipelineStatus::Draining, "stale_or_succession", None)?;
        let from = state.status.as_str().to_string();
        state.status = PipelineStatus::Draining;
        state
            .role_lifecycle
            .insert("draining_reason".to_string(), trigger_reason.to_string());
        let saved = self
            .ledger
            .save_state(&state, Some("enter_draining"), Some(&from), Some("DRAINING"))?;
        self.announce(&saved, "enter_draining", &from, "DRAINING")?;
        Ok(saved)
    }

    /// DRAINING -> EXECUTE when the successor holds an adopted lease,
    /// DRAINING -> BLOCKED when no valid lease exists.
    pub fn resolve_draining(&self) -> Result<PipelineState, LifecycleError> {
        let mut state = self.ledger.load_state()?;
        if state.status != PipelineStatus::Draining {
            return Err(LifecycleError::IllegalTransition {
                message: format!(
                    "Drain resolution requires status DRAINING, but ledger is at {}.",
                    state.status.as_str()
                ),
                diagnostics: serde_json::json!({
                    "diagnostic_type": "node_source_mismatch",
                    "trigger": "drain_resolution",
                    "from_status": state.status.as_str(),
                    "expected_source": "DRAINING",
                }),
            });
        }
        let registry = LeaseRegistry::new(&self.ledger);
        let now = Utc::now();
        let adopted = registry
            .list(Some(&self.task_id), Some(&self.run_id))
            .map_err(|lease_error| LifecycleError::RunFailed(lease_error.to_string()))?
            .into_iter()
            .any(|lease| {
                lease.status == crate::contracts::LeaseStatus::Active && !lease.is_expired(now)
            });
        let successor_accepted = state.succession.last_takeover_at.is_some();

        let from = state.status.as_str().to_string();
        let (target, node) = if adopted && successor_accepted {
            state
                .role_lifecycle
                .insert(MARKER_PENDING_DISPATCH.to_string(), "resume".to_string());
            (PipelineStatus::Execute, "drain_resume")
        } else {
            (PipelineStatus::Blocked, "drain_blocked")
        };
        guard_transition(state.status, target, node, None)?;
        state.status = target;
        let saved =
            self.ledger
                .save_state(&state, Some(node), Some(&from), Some(target.as_str()))?;
        self.announce(&saved, node, &from, target.as_str())?;
        Ok(saved)
    }

    /// BLOCKED -> EXECUTE through explicit manual recovery.
    pub fn manual_recover(&self) -> Result<PipelineState, LifecycleError> {
        let mut state = self.ledger.load_state()?;
        guard_transition(state.status, PipelineStatus::Execute, "manual_recovery", None)?;
        let from = state.status.as_str().to_string();
        state.status = PipelineStatus::Execute;
        state
            .role_lifecycle
            .insert(MARKER_PENDING_DISPATCH.to_string(), "resume".to_string());
        let saved =
            self.ledger
                .save_state(&state, Some("manual_recovery"), Some(&from), Some("EXECUTE"))?;
        self.announce(&saved, "manual_recovery", &from, "EXECUTE")?;
        Ok(saved)
    }

    // ---- node internals ----

    fn execute_node(
        &self,
        node: &str,
        mutate: impl FnOnce(&Self, &mut PipelineState) -> Result<(), LifecycleError>,
    ) -> Result<PipelineState, LifecycleError> {
        let (expected_source, target) = node_transition(node).ok_or_else(|| {
            LifecycleError::RunFailed(format!("no deterministic transition for node '{node}'"))
        })?;
        let state = self.ledger.load_state()?;
        let current = state.status;
        guard_transition(current, target, node, None)?;
        if current != expected_source {
            return Err(LifecycleError::IllegalTransition {
                message: format!(
                    "Node '{node}' expects source status {}, but ledger is at {}.",
                    expected_source.as_str(),
                    current.as_str()
                ),
                diagnostics: serde_json::json!({
                    "diagnostic_type": "node_source_mismatch",
                    "trigger": node,
                    "from_status": current.as_str(),
                    "expected_source": expected_source.as_str(),
                }),
            });
        }

        let mut working = state.clone();
        mutate(self, &mut working)?;
        working.status = target;
        working
            .role_lifecycle
            .insert("orchestrator".to_string(), format!("{node}_complete"));

        let saved = self.ledger.save_state(
            &working,
            Some(node),
            Some(current.as_str()),
            Some(target.as_str()),
        )?;
        self.announce(&saved, node, current.as_str(), target.as_str())?;
        Ok(saved)
    }

    /// Append the transition event and its checkpoint announcement; a
    /// reader never observes the snapshot without these or vice versa.
    fn announce(
        &self,
        saved: &PipelineState,
        node: &str,
        from_status: &str,
        to_status: &str,
    ) -> Result<(), LifecycleError> {
        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            saved.current_step.as_deref(),
            EventType::LifecycleTransition,
            Severity::Info,
            serde_json::json!({
                "node": node,
                "from_status": from_status,
                "to_status": to_status,
            }),
            None,
        )?;
        let state_value = serde_json::to_value(saved)
            .map_err(|serialize_error| LifecycleError::RunFailed(serialize_error.to_string()))?;
        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            saved.current_step.as_deref(),
            EventType::CheckpointPersisted,
            Severity::Info,
            serde_json::json!({
                "node": node,
                "state_hash": canonical_hash(&state_value),
            }),
            None,
        )?;
        Ok(())
    }

    fn select_current_step(&self, state: &PipelineState) -> Result<String, LifecycleError> {
        if let Some(current) = &state.current_step {
            if state.classify_step(current) != StepClassification::Accepted {
                return Ok(current.clone());
            }
        }
        state
            .resumable_step_ids()
            .into_iter()
            .next()
            .ok_or_else(|| LifecycleError::RunFailed("no resumable steps remain to dispatch".into()))
    }

    fn claim_lane(&self, state: &mut PipelineState, step_id: &str) {
        state.current_step = Some(step_id.to_string());
        let lane = state
            .role_lifecycle
            .get("controller_lane")
            .cloned()
            .unwrap_or_else(|| "controller".to_string());
        state
            .role_lifecycle
            .insert("controller_ownership".to_string(), format!("{lane}:{step_id}"));
        state
            .role_lifecycle
            .insert(format!("lane:{lane}"), format!("active_step:{step_id}"));
        state
            .role_lifecycle
            .insert(format!("step:{step_id}"), format!("owned_by_lane:{lane}"));
    }

    /// Rework or next-step dispatch performed while the run sits at
    /// EXECUTE. This is the verify -> dispatch back-edge of the graph: the
    /// status does not change, but the dispatch node runs and is journaled.
    fn dispatch_pending_work(&self, state: &PipelineState) -> Result<(), LifecycleError> {
        let pending_rework = state.role_lifecycle.contains_key(MARKER_PENDING_REWORK);
        let pending_dispatch = state.role_lifecycle.contains_key(MARKER_PENDING_DISPATCH);
        let step_id = self.select_current_step(state)?;
        let already_dispatched = state
            .role_lifecycle
            .contains_key(&format!("dispatch:{step_id}"));
        if !pending_rework && !pending_dispatch && already_dispatched {
            return Ok(());
        }
        let mut working = state.clone();
        self.claim_lane(&mut working, &step_id);
        let attempts: u32 = working
            .role_lifecycle
            .get(&format!("dispatch_attempts:{step_id}"))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let mode = if pending_rework {
            DispatchMode::Rework
        } else if attempts > 0 {
            // A step resumed after interruption or context rotation
            // re-enters its existing thread-space.
            DispatchMode::Resume
        } else {
            DispatchMode::Create
        };
        working.role_lifecycle.remove(MARKER_PENDING_REWORK);
        working.role_lifecycle.remove(MARKER_PENDING_DISPATCH);
        self.perform_dispatch(&mut working, &step_id, mode)?;
        let saved = self.ledger.save_state(
            &working,
            Some("dispatch"),
            Some(working.status.as_str()),
            Some(working.status.as_str()),
        )?;
        self.announce(&saved, "dispatch", saved.status.as_str(), saved.status.as_str())?;
        Ok(())
    }

    fn perform_dispatch(
        &self,
        state: &mut PipelineState,
        step_id: &str,
        mode: DispatchMode,
    ) -> Result<(), LifecycleError> {
        let attempts_key = format!("dispatch_attempts:{step_id}");
        let attempt: u32 = state
            .role_lifecycle
            .get(&attempts_key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        if attempt == 0 {
            self.ledger.append_event(
                &self.task_id,
                &self.run_id,
                Some(step_id),
                EventType::StepStarted,
                Severity::Info,
                serde_json::json!({"attempt": attempt}),
                None,
            )?;
        }

        let (status, payload) = match &self.dispatch {
            None => (
                "success".to_string(),
                serde_json::json!({
                    "execution_mode": "ledger_only",
                    "attempt": attempt,
                }),
            ),
            Some(adapter) => {
                let result = self.invoke_adapter(adapter.as_ref(), state, step_id, attempt, mode)?;
                if let Some(changed) = result.changed_files() {
                    state.role_lifecycle.insert(
                        format!("changed_files:{step_id}"),
                        serde_json::to_string(&changed).unwrap_or_else(|_| "[]".to_string()),
                    );
                }
                let call_status = result.status.clone();
                let payload = serde_json::json!({
                    "attempt": attempt,
                    "action": result.action.as_str(),
                    "status": result.status,
                    "thread_id": result.thread_id,
                    "error": result.error,
                    "artifacts": {
                        "request": result.artifacts.request_path.display().to_string(),
                        "output": result.artifacts.output_path.display().to_string(),
                        "error": result.artifacts.error_path.display().to_string(),
                    },
                });
                (call_status, payload)
            }
        };

        state
            .role_lifecycle
            .insert(format!("dispatch:{step_id}"), status.clone());
        state
            .role_lifecycle
            .insert(attempts_key, (attempt + 1).to_string());

        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            Some(step_id),
            EventType::DispatchCompleted,
            Severity::Info,
            payload,
            None,
        )?;
        Ok(())
    }

    fn invoke_adapter(
        &self,
        adapter: &dyn DispatchAdapter,
        state: &PipelineState,
        step_id: &str,
        attempt: u32,
        mode: DispatchMode,
    ) -> Result<DispatchCallResult, LifecycleError> {
        let step = state.step(step_id).cloned().ok_or_else(|| {
            LifecycleError::RunFailed(format!("dispatch references unknown step '{step_id}'"))
        })?;
        let mut request = DispatchRequest::new(&self.task_id, &self.run_id, step_id);
        request.retry_index = attempt;
        request.request = serde_json::json!({
            "task_id": self.task_id,
            "run_id": self.run_id,
            "step_id": step_id,
            "step_title": step.title,
            "goal": step.goal,
            "acceptance_criteria": step.acceptance_criteria,
        });

        let result = match mode {
            DispatchMode::Create => adapter.create(&request),
            DispatchMode::Resume => adapter.resume(&request),
            DispatchMode::Rework => {
                let context = state
                    .role_lifecycle
                    .get(&format!("rework_payload:{step_id}"))
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| serde_json::json!({}));
                adapter.rework(&request, &context)
            }
        };
        result.map_err(|dispatch_error| {
            LifecycleError::RunFailed(format!("dispatch adapter rejected the call: {dispatch_error}"))
        })
    }

    fn evaluate_acceptance(
        &self,
        state: &mut PipelineState,
        step_id: &str,
    ) -> Result<(), LifecycleError> {
        let dispatch_failed = state
            .role_lifecycle
            .get(&format!("dispatch:{step_id}"))
            .map(|status| status != "success")
            .unwrap_or(false);

        if dispatch_failed {
            let rework = ReworkPayload {
                next_action: "rework".to_string(),
                step_id: step_id.to_string(),
                failed_criteria: Vec::new(),
                directives: vec!["resolve the dispatch failure and rerun the step".to_string()],
            };
            let dispatch_status = state
                .role_lifecycle
                .get(&format!("dispatch:{step_id}"))
                .cloned();
            let payload = serde_json::json!({
                "reason_code": "DISPATCH_FAILED",
                "dispatch_status": dispatch_status,
            });
            return self.record_acceptance_failure(state, step_id, payload, rework);
        }

        if !self.acceptance_config.enforce_evidence {
            state
                .role_lifecycle
                .insert(MARKER_ACCEPTANCE.to_string(), "passed".to_string());
            self.ledger.append_event(
                &self.task_id,
                &self.run_id,
                Some(step_id),
                EventType::AcceptancePassed,
                Severity::Info,
                serde_json::json!({"mode": "trivial"}),
                None,
            )?;
            return Ok(());
        }

        let step = state.step(step_id).cloned().ok_or_else(|| {
            LifecycleError::RunFailed(format!("verify references unknown step '{step_id}'"))
        })?;
        let changed_files: Option<Vec<String>> = state
            .role_lifecycle
            .get(&format!("changed_files:{step_id}"))
            .and_then(|raw| serde_json::from_str(raw).ok());
        let decision = self
            .acceptance_engine
            .evaluate_contract(
                &self.task_id,
                &self.run_id,
                &step,
                &self.options.evidence_root,
                changed_files.as_deref(),
            )
            .map_err(|acceptance_error| {
                LifecycleError::RunFailed(format!("acceptance input invalid: {acceptance_error}"))
            })?;

        if decision.status == AcceptanceStatus::Passed {
            state
                .role_lifecycle
                .insert(MARKER_ACCEPTANCE.to_string(), "passed".to_string());
            state.role_lifecycle.insert(
                format!("proof:{step_id}"),
                decision.proof.proof_id.clone(),
            );
            self.ledger.append_event(
                &self.task_id,
                &self.run_id,
                Some(step_id),
                EventType::AcceptancePassed,
                Severity::Info,
                serde_json::json!({
                    "proof_id": decision.proof.proof_id,
                    "criteria": decision.proof.criteria,
                }),
                None,
            )?;
            return Ok(());
        }

        let rework = decision.rework.clone().unwrap_or(ReworkPayload {
            next_action: "rework".to_string(),
            step_id: step_id.to_string(),
            failed_criteria: Vec::new(),
            directives: Vec::new(),
        });
        self.record_acceptance_failure(
            state,
            step_id,
            serde_json::json!({
                "failure_reasons": decision.failure_reasons,
                "proof_id": decision.proof.proof_id,
            }),
            rework,
        )
    }

    fn record_acceptance_failure(
        &self,
        state: &mut PipelineState,
        step_id: &str,
        failure_payload: serde_json::Value,
        rework: ReworkPayload,
    ) -> Result<(), LifecycleError> {
        state
            .role_lifecycle
            .insert(MARKER_ACCEPTANCE.to_string(), "failed".to_string());
        state.role_lifecycle.insert(
            format!("rework_payload:{step_id}"),
            serde_json::to_string(&rework).unwrap_or_else(|_| "{}".to_string()),
        );
        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            Some(step_id),
            EventType::AcceptanceFailed,
            Severity::Warn,
            failure_payload,
            None,
        )?;
        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            Some(step_id),
            EventType::ReworkEmitted,
            Severity::Info,
            serde_json::to_value(&rework)
                .map_err(|serialize_error| LifecycleError::RunFailed(serialize_error.to_string()))?,
            None,
        )?;
        Ok(())
    }

    fn transition_rework(
        &self,
        mut state: PipelineState,
        decision: RouteDecision,
    ) -> Result<PipelineState, LifecycleError> {
        let step_id = state
            .current_step
            .clone()
            .ok_or_else(|| LifecycleError::RunFailed("rework requires a current step".into()))?;
        let rework_key = format!("rework_count:{step_id}");
        let rework_count: u32 = state
            .role_lifecycle
            .get(&rework_key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
            + 1;

        if rework_count > self.acceptance_config.rework_bound {
            state.set_step_lifecycle(&step_id, "failed_rework_exhausted");
            state
                .role_lifecycle
                .insert(rework_key, rework_count.to_string());
            let from = state.status.as_str().to_string();
            self.ledger.save_state(
                &state,
                Some("rework_exhausted"),
                Some(&from),
                Some(&from),
            )?;
            self.ledger.append_event(
                &self.task_id,
                &self.run_id,
                Some(&step_id),
                EventType::StepFailed,
                Severity::Error,
                serde_json::json!({
                    "reason_code": REASON_REWORK_EXHAUSTED,
                    "rework_count": rework_count,
                    "rework_bound": self.acceptance_config.rework_bound,
                }),
                None,
            )?;
            return Err(LifecycleError::RunFailed(format!(
                "step '{step_id}' exceeded the rework bound of {} ({})",
                self.acceptance_config.rework_bound, REASON_REWORK_EXHAUSTED
            )));
        }

        let from = state.status;
        state.status = decision.target;
        state
            .role_lifecycle
            .insert(rework_key, rework_count.to_string());
        state
            .role_lifecycle
            .insert(MARKER_PENDING_REWORK.to_string(), "rework".to_string());
        state.role_lifecycle.remove(MARKER_ACCEPTANCE);
        state
            .role_lifecycle
            .insert("orchestrator".to_string(), "transition_complete".to_string());
        let saved = self.ledger.save_state(
            &state,
            Some("transition"),
            Some(from.as_str()),
            Some(decision.target.as_str()),
        )?;
        self.announce(&saved, "transition", from.as_str(), decision.target.as_str())?;
        Ok(saved)
    }

    fn transition_next_step(
        &self,
        mut state: PipelineState,
        decision: RouteDecision,
    ) -> Result<PipelineState, LifecycleError> {
        let step_id = self.complete_current_step(&mut state)?;
        let next_step = state
            .resumable_step_ids()
            .into_iter()
            .find(|id| id != &step_id)
            .ok_or_else(|| LifecycleError::RunFailed("next-step route without remaining steps".into()))?;

        let from = state.status;
        state.status = decision.target;
        state.current_step = Some(next_step);
        state.role_lifecycle.remove(MARKER_ACCEPTANCE);
        state
            .role_lifecycle
            .insert(MARKER_PENDING_DISPATCH.to_string(), "create".to_string());
        state
            .role_lifecycle
            .insert("orchestrator".to_string(), "transition_complete".to_string());
        let saved = self.ledger.save_state(
            &state,
            Some("transition"),
            Some(from.as_str()),
            Some(decision.target.as_str()),
        )?;
        self.announce(&saved, "transition", from.as_str(), decision.target.as_str())?;
        Ok(saved)
    }

    fn transition_done(
        &self,
        mut state: PipelineState,
        decision: RouteDecision,
    ) -> Result<PipelineState, LifecycleError> {
        self.complete_current_step(&mut state)?;
        let from = state.status;
        state.status = decision.target;
        state
            .role_lifecycle
            .insert("orchestrator".to_string(), "completed".to_string());
        let saved = self.ledger.save_state(
            &state,
            Some("transition"),
            Some(from.as_str()),
            Some(decision.target.as_str()),
        )?;
        self.announce(&saved, "transition", from.as_str(), decision.target.as_str())?;
        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            None,
            EventType::RunDone,
            Severity::Info,
            serde_json::json!({"status": decision.target.as_str()}),
            None,
        )?;
        Ok(saved)
    }

    /// Mark the current step accepted and announce its completion.
    fn complete_current_step(&self, state: &mut PipelineState) -> Result<String, LifecycleError> {
        let step_id = state
            .current_step
            .clone()
            .ok_or_else(|| LifecycleError::RunFailed("transition requires a current step".into()))?;
        state.set_step_lifecycle(&step_id, "accepted");
        self.ledger.append_event(
            &self.task_id,
            &self.run_id,
            Some(&step_id),
            EventType::StepCompleted,
            Severity::Info,
            serde_json::json!({
                "proof_id": state
                    .role_lifecycle
                    .get(&format!("proof:{step_id}")),
            }),
            None,
        )?;
        Ok(step_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    Create,
    Resume,
    Rework,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::EventType;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn open_ledger(root: &Path) -> Ledger {
        Ledger::open_with_selection(root, Some("filesystem"), &BTreeMap::new()).unwrap()
    }

    fn runtime(root: &Path) -> LifecycleRuntime {
        LifecycleRuntime::new(
            "T1",
            "R1",
            "demo",
            open_ledger(root),
            None,
            AcceptanceConfig::default(),
            RunOptions::at_root(root),
        )
        .unwrap()
    }

    fn event_types(ledger: &Ledger) -> Vec<EventType> {
        ledger
            .list_events()
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }

    #[test]
    fn happy_path_reaches_done_with_expected_event_sequence() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        let final_state = runtime.run().unwrap();
        assert_eq!(final_state.status, PipelineStatus::Done);
        assert_eq!(
            final_state.classify_step("S1"),
            StepClassification::Accepted
        );

        let types = event_types(runtime.ledger());
        let expected = [
            EventType::StepStarted,
            EventType::DispatchCompleted,
            EventType::AcceptancePassed,
            EventType::StepCompleted,
            EventType::RunDone,
        ];
        // The journal contains the canonical sequence, in order, possibly
        // interleaved with transition and checkpoint announcements.
        let mut cursor = 0;
        for event_type in &types {
            if cursor < expected.len() && *event_type == expected[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(cursor, expected.len(), "events: {types:?}");
    }

    #[test]
    fn one_snapshot_per_node_boundary() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        runtime.run().unwrap();
        let snapshots = runtime.ledger().list_snapshots().unwrap();
        let nodes: Vec<Option<String>> =
            snapshots.iter().map(|snapshot| snapshot.node.clone()).collect();
        for node in ["extract", "plan", "dispatch", "verify", "transition"] {
            assert!(
                nodes.iter().any(|entry| entry.as_deref() == Some(node)),
                "missing snapshot for {node}"
            );
        }
    }

    #[test]
    fn node_out_of_order_fails_with_guard_diagnostics() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        // Ledger is at PLANNING; verify expects EXECUTE.
        let err = runtime.verify().unwrap_err();
        let diagnostics = err.diagnostics();
        assert_eq!(diagnostics["trigger"], "verify");
        assert_eq!(diagnostics["from_status"], "PLANNING");
    }

    #[test]
    fn run_is_deterministic_across_equal_ledgers() {
        let left = tempdir().unwrap();
        let right = tempdir().unwrap();
        runtime(left.path()).run().unwrap();
        runtime(right.path()).run().unwrap();
        let left_types = event_types(&open_ledger(left.path()));
        let right_types = event_types(&open_ledger(right.path()));
        assert_eq!(left_types, right_types);
    }

    #[test]
    fn resume_skips_accepted_steps() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        runtime.run().unwrap();
        let dispatch_events_before = event_types(runtime.ledger())
            .iter()
            .filter(|event| **event == EventType::DispatchCompleted)
            .count();

        let resumed = runtime.resume().unwrap();
        assert_eq!(resumed.status, PipelineStatus::Done);
        let dispatch_events_after = event_types(runtime.ledger())
            .iter()
            .filter(|event| **event == EventType::DispatchCompleted)
            .count();
        assert_eq!(dispatch_events_before, dispatch_events_after);
    }

    #[test]
    fn draining_without_successor_blocks() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        // Drive to EXECUTE, then simulate a stale controller.
        runtime.extract().unwrap();
        runtime.plan().unwrap();
        runtime.dispatch().unwrap();
        runtime.enter_draining("HEARTBEAT_STALE").unwrap();

        let state = runtime.run().unwrap();
        assert_eq!(state.status, PipelineStatus::Blocked);
    }

    #[test]
    fn manual_recovery_unblocks_and_completes() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        runtime.extract().unwrap();
        runtime.plan().unwrap();
        runtime.dispatch().unwrap();
        runtime.enter_draining("HEARTBEAT_STALE").unwrap();
        let blocked = runtime.run().unwrap();
        assert_eq!(blocked.status, PipelineStatus::Blocked);

        runtime.manual_recover().unwrap();
        let done = runtime.run().unwrap();
        assert_eq!(done.status, PipelineStatus::Done);
    }

    #[test]
    fn status_view_aggregates_ledger_domains() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path());
        runtime.run().unwrap();
        let view = runtime.status().unwrap();
        assert_eq!(view.pipeline_state.status, PipelineStatus::Done);
        assert!(view.leases.is_empty());
        assert!(view.handoff_package_path.is_none());
    }

    #[test]
    fn multi_step_plan_completes_each_step_in_order() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let mut state = ledger.load_state().unwrap();
        state.steps = vec![
            StepContract {
                id: "S1".to_string(),
                title: "one".to_string(),
                category: "implementation".to_string(),
                goal: "first".to_string(),
                actions: vec!["a".to_string()],
                acceptance_criteria: vec!["c".to_string()],
                expected_outputs: vec!["s1/report.md".to_string()],
                dependencies: vec![],
                allowed_scope: None,
                require_command_evidence: false,
                retrieval_policy: None,
            },
            StepContract {
                id: "S2".to_string(),
                title: "two".to_string(),
                category: "implementation".to_string(),
                goal: "second".to_string(),
                actions: vec!["a".to_string()],
                acceptance_criteria: vec!["c".to_string()],
                expected_outputs: vec!["s2/report.md".to_string()],
                dependencies: vec!["S1".to_string()],
                allowed_scope: None,
                require_command_evidence: false,
                retrieval_policy: None,
            },
        ];
        ledger.save_state(&state, None, None, None).unwrap();

        let runtime = LifecycleRuntime::new(
            "T1",
            "R1",
            "multi",
            open_ledger(dir.path()),
            None,
            AcceptanceConfig::default(),
            RunOptions::at_root(dir.path()),
        )
        .unwrap();
        let final_state = runtime.run().unwrap();
        assert_eq!(final_state.status, PipelineStatus::Done);
        assert_eq!(final_state.classify_step("S1"), StepClassification::Accepted);
        assert_eq!(final_state.classify_step("S2"), StepClassification::Accepted);

        let completed: Vec<String> = runtime
            .ledger()
            .list_events()
            .unwrap()
            .into_iter()
            .filter(|event| event.event_type == EventType::StepCompleted)
            .filter_map(|event| event.step_id)
            .collect();
        assert_eq!(completed, vec!["S1", "S2"]);
    }
}
