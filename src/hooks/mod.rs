//! Lifecycle hook runtime with idempotency and transactional ledger
//! protection.
//!
//! Hooks run in registration order against a working copy of the pipeline
//! state. Error or timeout rolls the ledger back to the pre-run copy; only
//! a fully successful run commits. Results of idempotent hooks are cached
//! by `(hook_point, hook_name, idempotency_key)` so replaying the same key
//! yields the same ledger delta.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::contracts::PipelineState;
use crate::reliability::handoff::{HandoffError, HandoffStore};

/// Hook registration or execution input failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("unknown hook point '{0}'. expected one of: pre-dispatch, post-accept, pre-compact, session-start")]
    UnknownHookPoint(String),

    #[error("{name} must be a non-empty string")]
    EmptyField { name: &'static str },

    #[error("hook '{name}' is already registered at point '{point}'")]
    DuplicateHook { name: String, point: String },

    #[error("{name} must be > 0")]
    NonPositiveTimeout { name: &'static str },
}

/// The four lifecycle points hooks can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPoint {
    PreDispatch,
    PostAccept,
    PreCompact,
    SessionStart,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreDispatch => "pre-dispatch",
            Self::PostAccept => "post-accept",
            Self::PreCompact => "pre-compact",
            Self::SessionStart => "session-start",
        }
    }

    pub fn parse(value: &str) -> Result<Self, HookError> {
        match value.trim().replace('_', "-").to_ascii_lowercase().as_str() {
            "pre-dispatch" => Ok(Self::PreDispatch),
            "post-accept" => Ok(Self::PostAccept),
            "pre-compact" => Ok(Self::PreCompact),
            "session-start" => Ok(Self::SessionStart),
            other => Err(HookError::UnknownHookPoint(other.to_string())),
        }
    }
}

/// Free-form context handed to each hook alongside the ledger state.
pub type HookContext = serde_json::Map<String, serde_json::Value>;

/// A hook mutates the working ledger state and context, or fails with a
/// message.
pub type HookCallback = Box<dyn Fn(&mut PipelineState, &mut HookContext) -> Result<(), String>>;

/// Per-hook execution record.
#[derive(Debug, Clone, PartialEq)]
pub struct HookExecutionEntry {
    pub hook_name: String,
    pub hook_point: String,
    pub status: HookEntryStatus,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEntryStatus {
    Success,
    Skipped,
    Error,
    Timeout,
    BudgetExceeded,
}

/// Overall status of one hook-point run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRunStatus {
    Success,
    Error,
    Timeout,
}

/// Outcome of running a hook point: the (possibly rolled back) ledger
/// state plus per-hook entries.
#[derive(Debug)]
pub struct HookRunResult {
    pub hook_point: String,
    pub idempotency_key: Option<String>,
    pub status: HookRunStatus,
    pub ledger_state: PipelineState,
    pub entries: Vec<HookExecutionEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct RegisteredHook {
    hook_name: String,
    callback: HookCallback,
    timeout_seconds: Option<f64>,
    idempotent: bool,
}

/// Lifecycle hook engine.
pub struct HookRuntime {
    default_timeout_seconds: Option<f64>,
    hooks: BTreeMap<HookPoint, Vec<RegisteredHook>>,
    idempotency_cache: BTreeMap<(String, String, String), PipelineState>,
}

impl Default for HookRuntime {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HookRuntime {
    pub fn new(default_timeout_seconds: Option<f64>) -> Self {
        Self {
            default_timeout_seconds,
            hooks: BTreeMap::new(),
            idempotency_cache: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        hook_point: &str,
        hook_name: &str,
        callback: HookCallback,
        timeout_seconds: Option<f64>,
        idempotent: bool,
    ) -> Result<(), HookError> {
        let point = HookPoint::parse(hook_point)?;
        let name = hook_name.trim();
        if name.is_empty() {
            return Err(HookError::EmptyField { name: "hook_name" });
        }
        if let Some(timeout) = timeout_seconds {
            if timeout <= 0.0 {
                return Err(HookError::NonPositiveTimeout {
                    name: "timeout_seconds",
                });
            }
        }
        let registered = self.hooks.entry(point).or_default();
        if registered.iter().any(|hook| hook.hook_name == name) {
            return Err(HookError::DuplicateHook {
                name: name.to_string(),
                point: point.as_str().to_string(),
            });
        }
        registered.push(RegisteredHook {
            hook_name: name.to_string(),
            callback,
            timeout_seconds,
            idempotent,
        });
        Ok(())
    }

    pub fn list_registered(&self, hook_point: Option<&str>) -> Result<Vec<String>, HookError> {
        match hook_point {
            None => Ok(self
                .hooks
                .values()
                .flatten()
                .map(|hook| hook.hook_name.clone())
                .collect()),
            Some(point) => {
                let point = HookPoint::parse(point)?;
                Ok(self
                    .hooks
                    .get(&point)
                    .map(|hooks| hooks.iter().map(|hook| hook.hook_name.clone()).collect())
                    .unwrap_or_default())
            }
        }
    }

    /// Run every hook registered at a point.
    ///
    /// Timeouts are enforced post-hoc (a hook cannot be preempted): a hook
    /// whose measured duration exceeds its effective timeout, or a hook
    /// reached after the budget is spent, aborts the run and rolls back.
    pub fn run(
        &mut self,
        hook_point: &str,
        ledger_state: &PipelineState,
        context: &mut HookContext,
        idempotency_key: Option<&str>,
        timeout_budget_seconds: Option<f64>,
    ) -> Result<HookRunResult, HookError> {
        let point = HookPoint::parse(hook_point)?;
        let idempotency_key = match idempotency_key {
            None => None,
            Some(key) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(HookError::EmptyField {
                        name: "idempotency_key",
                    });
                }
                Some(key.to_string())
            }
        };

        let original = ledger_state.clone();
        let mut working = ledger_state.clone();
        let mut entries = Vec::new();
        let mut pending_cache: Vec<((String, String, String), PipelineState)> = Vec::new();
        let started_at = Utc::now();
        let run_started = Instant::now();
        let mut run_status = HookRunStatus::Success;

        for hook in self.hooks.get(&point).map(Vec::as_slice).unwrap_or(&[]) {
            let elapsed_before = run_started.elapsed().as_secs_f64();
            if let Some(budget) = timeout_budget_seconds {
                if elapsed_before >= budget {
                    entries.push(HookExecutionEntry {
                        hook_name: hook.hook_name.clone(),
                        hook_point: point.as_str().to_string(),
                        status: HookEntryStatus::BudgetExceeded,
                        duration_seconds: 0.0,
                        error: Some(format!(
                            "timeout budget exceeded before executing hook '{}'",
                            hook.hook_name
                        )),
                    });
                    run_status = HookRunStatus::Timeout;
                    break;
                }
            }

            let cache_key = match (&idempotency_key, hook.idempotent) {
                (Some(key), true) => Some((
                    point.as_str().to_string(),
                    hook.hook_name.clone(),
                    key.clone(),
                )),
                _ => None,
            };
            if let Some(key) = &cache_key {
                if let Some(cached) = self.idempotency_cache.get(key) {
                    working = cached.clone();
                    entries.push(HookExecutionEntry {
                        hook_name: hook.hook_name.clone(),
                        hook_point: point.as_str().to_string(),
                        status: HookEntryStatus::Skipped,
                        duration_seconds: 0.0,
                        error: None,
                    });
                    continue;
                }
            }

            let remaining_budget =
                timeout_budget_seconds.map(|budget| (budget - elapsed_before).max(0.0));
            let effective_timeout = match (
                hook.timeout_seconds.or(self.default_timeout_seconds),
                remaining_budget,
            ) {
                (Some(timeout), Some(budget)) => Some(timeout.min(budget)),
                (Some(timeout), None) => Some(timeout),
                (None, budget) => budget,
            };

            let hook_started = Instant::now();
            let outcome = (hook.callback)(&mut working, context);
            let duration = hook_started.elapsed().as_secs_f64();

            if let Err(message) = outcome {
                entries.push(HookExecutionEntry {
                    hook_name: hook.hook_name.clone(),
                    hook_point: point.as_str().to_string(),
                    status: HookEntryStatus::Error,
                    duration_seconds: duration,
                    error: Some(message),
                });
                run_status = HookRunStatus::Error;
                break;
            }
            if let Some(timeout) = effective_timeout {
                if duration > timeout {
                    entries.push(HookExecutionEntry {
                        hook_name: hook.hook_name.clone(),
                        hook_point: point.as_str().to_string(),
                        status: HookEntryStatus::Timeout,
                        duration_seconds: duration,
                        error: Some(format!(
                            "hook '{}' exceeded timeout of {timeout:.6}s",
                            hook.hook_name
                        )),
                    });
                    run_status = HookRunStatus::Timeout;
                    break;
                }
            }

            entries.push(HookExecutionEntry {
                hook_name: hook.hook_name.clone(),
                hook_point: point.as_str().to_string(),
                status: HookEntryStatus::Success,
                duration_seconds: duration,
                error: None,
            });
            if let Some(key) = cache_key {
                pending_cache.push((key, working.clone()));
            }
        }

        let ledger_state = if run_status == HookRunStatus::Success {
            for (key, cached) in pending_cache {
                self.idempotency_cache.insert(key, cached);
            }
            working
        } else {
            original
        };

        Ok(HookRunResult {
            hook_point: point.as_str().to_string(),
            idempotency_key,
            status: run_status,
            ledger_state,
            entries,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Register the deterministic core-rotation hooks: pre-compact writes the
/// handoff package, session-start applies it.
pub fn register_core_rotation_hooks(
    runtime: &mut HookRuntime,
    package_path: std::path::PathBuf,
    include_accepted_steps: bool,
) -> Result<(), HookError> {
    let write_path = package_path.clone();
    runtime.register(
        HookPoint::PreCompact.as_str(),
        "core-rotation-handoff#pre-compact",
        Box::new(move |state, context| {
            let store = HandoffStore::new(&write_path);
            let evidence_paths: Option<Vec<String>> = context
                .get("evidence_paths")
                .and_then(|value| value.as_array())
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| entry.as_str().map(str::to_string))
                        .collect()
                });
            let package = store
                .write_package(
                    state,
                    evidence_paths.as_deref(),
                    resolve_include_accepted(context, include_accepted_steps),
                    Utc::now(),
                )
                .map_err(|handoff_error| handoff_error.to_string())?;
            state.role_lifecycle.insert(
                "handoff_package_path".to_string(),
                store.package_path().display().to_string(),
            );
            state
                .role_lifecycle
                .insert("handoff_package_hash".to_string(), package.package_hash.clone());
            context.insert(
                "handoff_package".to_string(),
                serde_json::to_value(&package).unwrap_or_default(),
            );
            Ok(())
        }),
        None,
        true,
    )?;

    runtime.register(
        HookPoint::SessionStart.as_str(),
        "core-rotation-handoff#session-start",
        Box::new(move |state, context| {
            let store = HandoffStore::new(&package_path);
            if !store.package_exists() {
                return Ok(());
            }
            let plan = store
                .apply_package(
                    state,
                    resolve_include_accepted(context, include_accepted_steps),
                    Utc::now(),
                )
                .map_err(|handoff_error: HandoffError| handoff_error.to_string())?;
            context.insert(
                "handoff_resume".to_string(),
                serde_json::to_value(&plan).unwrap_or_default(),
            );
            Ok(())
        }),
        None,
        true,
    )?;
    Ok(())
}

fn resolve_include_accepted(context: &HookContext, default: bool) -> bool {
    context
        .get("include_accepted_steps")
        .and_then(|value| value.as_bool())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::StepContract;
    use tempfile::tempdir;

    fn state() -> PipelineState {
        let mut state = PipelineState::initial(Utc::now());
        state.task_id = Some("T1".to_string());
        state.run_id = Some("R1".to_string());
        state.steps = vec![StepContract {
            id: "S1".to_string(),
            title: "Step S1".to_string(),
            category: "implementation".to_string(),
            goal: "demo".to_string(),
            actions: vec!["act".to_string()],
            acceptance_criteria: vec!["crit".to_string()],
            expected_outputs: vec!["report.md".to_string()],
            dependencies: vec![],
            allowed_scope: None,
            require_command_evidence: false,
            retrieval_policy: None,
        }];
        state
    }

    fn marker_hook(key: &'static str, value: &'static str) -> HookCallback {
        Box::new(move |state, _context| {
            state
                .role_lifecycle
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    #[test]
    fn successful_run_commits_ledger_changes() {
        let mut runtime = HookRuntime::default();
        runtime
            .register("pre-dispatch", "mark", marker_hook("hook_mark", "set"), None, true)
            .unwrap();
        let mut context = HookContext::new();
        let result = runtime
            .run("pre-dispatch", &state(), &mut context, None, None)
            .unwrap();
        assert_eq!(result.status, HookRunStatus::Success);
        assert_eq!(
            result.ledger_state.role_lifecycle.get("hook_mark").map(String::as_str),
            Some("set")
        );
    }

    #[test]
    fn failing_hook_rolls_back_the_ledger() {
        let mut runtime = HookRuntime::default();
        runtime
            .register("pre-dispatch", "mark", marker_hook("hook_mark", "set"), None, true)
            .unwrap();
        runtime
            .register(
                "pre-dispatch",
                "boom",
                Box::new(|_state, _context| Err("exploded".to_string())),
                None,
                true,
            )
            .unwrap();
        let mut context = HookContext::new();
        let result = runtime
            .run("pre-dispatch", &state(), &mut context, None, None)
            .unwrap();
        assert_eq!(result.status, HookRunStatus::Error);
        // The first hook's tentative change is rolled back too.
        assert!(!result.ledger_state.role_lifecycle.contains_key("hook_mark"));
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[1].status, HookEntryStatus::Error);
    }

    #[test]
    fn timeout_rolls_back_and_stops() {
        let mut runtime = HookRuntime::default();
        runtime
            .register(
                "pre-compact",
                "slow",
                Box::new(|state, _context| {
                    std::thread::sleep(std::time::Duration::from_millis(30));
                    state
                        .role_lifecycle
                        .insert("slow_ran".to_string(), "yes".to_string());
                    Ok(())
                }),
                Some(0.001),
                true,
            )
            .unwrap();
        let mut context = HookContext::new();
        let result = runtime
            .run("pre-compact", &state(), &mut context, None, None)
            .unwrap();
        assert_eq!(result.status, HookRunStatus::Timeout);
        assert!(!result.ledger_state.role_lifecycle.contains_key("slow_ran"));
    }

    #[test]
    fn idempotency_replays_the_same_ledger_delta() {
        let mut runtime = HookRuntime::default();
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hook_counter = counter.clone();
        runtime
            .register(
                "post-accept",
                "count",
                Box::new(move |state, _context| {
                    let value =
                        hook_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    state
                        .role_lifecycle
                        .insert("invocations".to_string(), value.to_string());
                    Ok(())
                }),
                None,
                true,
            )
            .unwrap();

        let base = state();
        let mut context = HookContext::new();
        let first = runtime
            .run("post-accept", &base, &mut context, Some("key-1"), None)
            .unwrap();
        let second = runtime
            .run("post-accept", &base, &mut context, Some("key-1"), None)
            .unwrap();
        // Same key: the cached delta replays, the callback does not rerun.
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            first.ledger_state.role_lifecycle.get("invocations"),
            second.ledger_state.role_lifecycle.get("invocations")
        );
        assert_eq!(second.entries[0].status, HookEntryStatus::Skipped);

        // A new key executes again.
        runtime
            .run("post-accept", &base, &mut context, Some("key-2"), None)
            .unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut runtime = HookRuntime::default();
        runtime
            .register("session-start", "a", marker_hook("x", "1"), None, true)
            .unwrap();
        let err = runtime
            .register("session-start", "a", marker_hook("x", "2"), None, true)
            .unwrap_err();
        assert!(matches!(err, HookError::DuplicateHook { .. }));

        let err = runtime
            .register("no-such-point", "b", marker_hook("x", "3"), None, true)
            .unwrap_err();
        assert!(matches!(err, HookError::UnknownHookPoint(_)));
    }

    #[test]
    fn core_rotation_hooks_round_trip_through_package() {
        let dir = tempdir().unwrap();
        let package_path = dir.path().join("handoff/handoff_package.json");
        let mut runtime = HookRuntime::default();
        register_core_rotation_hooks(&mut runtime, package_path.clone(), false).unwrap();

        let mut context = HookContext::new();
        let pre_compact = runtime
            .run("pre-compact", &state(), &mut context, Some("rotate-1"), None)
            .unwrap();
        assert_eq!(pre_compact.status, HookRunStatus::Success);
        assert!(package_path.is_file());
        assert!(context.contains_key("handoff_package"));
        assert!(pre_compact
            .ledger_state
            .role_lifecycle
            .contains_key("handoff_package_hash"));

        let mut fresh_context = HookContext::new();
        let session_start = runtime
            .run(
                "session-start",
                &pre_compact.ledger_state,
                &mut fresh_context,
                Some("rotate-1"),
                None,
            )
            .unwrap();
        assert_eq!(session_start.status, HookRunStatus::Success);
        assert_eq!(
            session_start
                .ledger_state
                .role_lifecycle
                .get("handoff_resume_step")
                .map(String::as_str),
            Some("S1")
        );
    }
}
