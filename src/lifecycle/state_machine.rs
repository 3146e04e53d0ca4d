//! Deterministic transition table, guards, and conditional routes for the
//! lifecycle graph.
//!
//! Nodes: `extract`, `plan`, `dispatch`, `verify`, `transition`. State
//! advances only through the edges declared here; anything else fails
//! loudly with a diagnostic carrying the trigger, both statuses, and the
//! allowed targets.

use crate::contracts::{PipelineState, PipelineStatus};
use crate::errors::LifecycleError;

/// Allowed targets per source status.
pub fn allowed_targets(status: PipelineStatus) -> &'static [PipelineStatus] {
    use PipelineStatus::*;
    match status {
        Planning => &[Analysis],
        Analysis => &[Freeze],
        Freeze => &[Execute],
        Execute => &[Accept, Draining],
        Accept => &[Done, Execute],
        Draining => &[Execute, Blocked],
        Blocked => &[Execute],
        Done => &[],
        Failed => &[],
    }
}

/// The canonical node transitions for the forward path.
pub fn node_transition(node: &str) -> Option<(PipelineStatus, PipelineStatus)> {
    use PipelineStatus::*;
    match node {
        "extract" => Some((Planning, Analysis)),
        "plan" => Some((Analysis, Freeze)),
        "dispatch" => Some((Freeze, Execute)),
        "verify" => Some((Execute, Accept)),
        "transition" => Some((Accept, Done)),
        _ => None,
    }
}

/// Parse a persisted status, failing with a status-unknown diagnostic.
pub fn parse_status(value: &str) -> Result<PipelineStatus, LifecycleError> {
    PipelineStatus::parse(value).ok_or_else(|| LifecycleError::IllegalTransition {
        message: format!(
            "Unknown pipeline status '{value}'. Known statuses: {}",
            PipelineStatus::known_values().join(", ")
        ),
        diagnostics: serde_json::json!({
            "diagnostic_type": "status_unknown",
            "invalid_status": value,
            "known_statuses": PipelineStatus::known_values(),
        }),
    })
}

/// Reject any edge not in the declared set.
pub fn guard_transition(
    current: PipelineStatus,
    target: PipelineStatus,
    trigger: &str,
    route: Option<&ConditionalRoute>,
) -> Result<(), LifecycleError> {
    let allowed = allowed_targets(current);
    if allowed.contains(&target) {
        return Ok(());
    }
    let allowed_names: Vec<&str> = allowed.iter().map(|status| status.as_str()).collect();
    let rendered_allowed = if allowed_names.is_empty() {
        "<none>".to_string()
    } else {
        allowed_names.join(", ")
    };
    let mut diagnostics = serde_json::json!({
        "diagnostic_type": "route_guard_failure",
        "trigger": trigger,
        "from_status": current.as_str(),
        "to_status": target.as_str(),
        "allowed_targets": allowed_names,
    });
    let mut route_suffix = String::new();
    if let Some(route) = route {
        diagnostics["route_id"] = serde_json::json!(route.route_id);
        diagnostics["route_reason"] = serde_json::json!(route.reason);
        route_suffix = format!(
            " Route diagnostics: route_id={}, route_reason={}.",
            route.route_id, route.reason
        );
    }
    Err(LifecycleError::IllegalTransition {
        message: format!(
            "Illegal transition via '{trigger}': {} -> {}. Allowed targets from {}: \
             {rendered_allowed}.{route_suffix} Action: restore ledger status to an allowed \
             source or execute the correct predecessor node.",
            current.as_str(),
            target.as_str(),
            current.as_str(),
        ),
        diagnostics,
    })
}

/// Route predicate over the pipeline state.
pub type RoutePredicate = fn(&PipelineState) -> bool;

/// One declared conditional route with a stable reason code.
#[derive(Debug, Clone)]
pub struct ConditionalRoute {
    pub route_id: &'static str,
    pub target: PipelineStatus,
    pub reason: &'static str,
    pub predicate_name: &'static str,
    pub predicate: RoutePredicate,
}

fn always(_state: &PipelineState) -> bool {
    true
}

/// The verify node records its outcome under `role_lifecycle["acceptance"]`.
pub fn acceptance_failed(state: &PipelineState) -> bool {
    state
        .role_lifecycle
        .get("acceptance")
        .map(|outcome| {
            matches!(
                outcome.trim().to_ascii_lowercase().as_str(),
                "failed" | "fail" | "rejected" | "rework_required"
            )
        })
        .unwrap_or(false)
}

fn acceptance_failed_route(state: &PipelineState) -> bool {
    acceptance_failed(state)
}

fn acceptance_passed_more_steps(state: &PipelineState) -> bool {
    if acceptance_failed(state) {
        return false;
    }
    // The current step is about to be accepted; anything else resumable
    // routes back to dispatch.
    state
        .resumable_step_ids()
        .iter()
        .any(|id| Some(id.as_str()) != state.current_step.as_deref())
}

fn acceptance_passed_final(state: &PipelineState) -> bool {
    !acceptance_failed(state) && !acceptance_passed_more_steps(state)
}

/// Declared routes per node. Unknown nodes and unmatched or ambiguous
/// predicates abort with a route-guard diagnostic; nothing falls through
/// to a default.
pub fn conditional_routes(node: &str) -> Result<Vec<ConditionalRoute>, LifecycleError> {
    use PipelineStatus::*;
    let routes = match node {
        "extract" => vec![ConditionalRoute {
            route_id: "extract.default.analysis",
            target: Analysis,
            reason: "extract_completed",
            predicate_name: "always",
            predicate: always,
        }],
        "plan" => vec![ConditionalRoute {
            route_id: "plan.default.freeze",
            target: Freeze,
            reason: "plan_completed",
            predicate_name: "always",
            predicate: always,
        }],
        "dispatch" => vec![ConditionalRoute {
            route_id: "dispatch.default.execute",
            target: Execute,
            reason: "dispatch_completed",
            predicate_name: "always",
            predicate: always,
        }],
        "verify" => vec![ConditionalRoute {
            route_id: "verify.default.accept",
            target: Accept,
            reason: "verify_completed",
            predicate_name: "always",
            predicate: always,
        }],
        "transition" => vec![
            ConditionalRoute {
                route_id: "transition.acceptance_failed.rework",
                target: Execute,
                reason: "acceptance_failed_rework",
                predicate_name: "acceptance_failed",
                predicate: acceptance_failed_route,
            },
            ConditionalRoute {
                route_id: "transition.acceptance_passed.next_step",
                target: Execute,
                reason: "step_completed_next_step",
                predicate_name: "acceptance_passed_more_steps",
                predicate: acceptance_passed_more_steps,
            },
            ConditionalRoute {
                route_id: "transition.acceptance_passed.done",
                target: Done,
                reason: "acceptance_not_failed_finalize",
                predicate_name: "acceptance_passed_final",
                predicate: acceptance_passed_final,
            },
        ],
        other => {
            return Err(LifecycleError::IllegalTransition {
                message: format!(
                    "Undefined conditional route policy for node '{other}'. Known route nodes: \
                     dispatch, extract, plan, transition, verify. Action: add explicit route \
                     predicates and reason codes for the node."
                ),
                diagnostics: serde_json::json!({
                    "diagnostic_type": "route_policy_missing",
                    "node": other,
                }),
            })
        }
    };
    Ok(routes)
}

/// The selected route for a node at the current state.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub node: String,
    pub current: PipelineStatus,
    pub target: PipelineStatus,
    pub route_id: &'static str,
    pub reason: &'static str,
}

/// Resolve exactly one matching route and guard its edge.
pub fn resolve_conditional_route(
    node: &str,
    current: PipelineStatus,
    state: &PipelineState,
) -> Result<RouteDecision, LifecycleError> {
    let routes = conditional_routes(node)?;
    let matches: Vec<&ConditionalRoute> = routes
        .iter()
        .filter(|route| (route.predicate)(state))
        .collect();

    if matches.is_empty() {
        let predicate_names: Vec<&str> = routes.iter().map(|route| route.predicate_name).collect();
        return Err(LifecycleError::IllegalTransition {
            message: format!(
                "No conditional route matched for node '{node}' at status {}. Evaluated \
                 predicates: {}. Action: inspect route inputs (for example role_lifecycle \
                 markers) and retry with a valid state.",
                current.as_str(),
                predicate_names.join(", ")
            ),
            diagnostics: serde_json::json!({
                "diagnostic_type": "route_policy_no_match",
                "node": node,
                "from_status": current.as_str(),
                "evaluated_predicates": predicate_names,
            }),
        });
    }
    if matches.len() > 1 {
        let matched: Vec<&str> = matches.iter().map(|route| route.route_id).collect();
        return Err(LifecycleError::IllegalTransition {
            message: format!(
                "Ambiguous conditional routes for node '{node}' at status {}: {}. Action: make \
                 route predicates mutually exclusive so exactly one route matches.",
                current.as_str(),
                matched.join(", ")
            ),
            diagnostics: serde_json::json!({
                "diagnostic_type": "route_policy_ambiguous",
                "node": node,
                "from_status": current.as_str(),
                "matched_routes": matched,
            }),
        });
    }

    let selected = matches[0];
    guard_transition(current, selected.target, node, Some(selected))?;
    Ok(RouteDecision {
        node: node.to_string(),
        current,
        target: selected.target,
        route_id: selected.route_id,
        reason: selected.reason,
    })
}
