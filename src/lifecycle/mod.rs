//! Lifecycle runtime: the deterministic node graph, its transition guards,
//! and checkpoint/resume semantics.

pub mod runtime;
pub mod state_machine;

pub use runtime::{LifecycleRuntime, RunOptions, StatusView};
pub use state_machine::{
    acceptance_failed, allowed_targets, conditional_routes, guard_transition, node_transition,
    parse_status, resolve_conditional_route, ConditionalRoute, RouteDecision,
};
