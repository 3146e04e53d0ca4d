//! `daokit handoff` — create or apply a handoff package.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::contracts::{EventType, Severity};
use crate::ledger::Ledger;
use crate::reliability::handoff::HandoffStore;

use super::CliError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMode {
    Create,
    Apply,
}

pub struct HandoffArgs<'a> {
    pub root: &'a Path,
    pub mode: HandoffMode,
    pub package_path: &'a str,
    pub include_accepted_steps: bool,
    pub evidence_paths: Vec<String>,
}

pub fn cmd_handoff(args: &HandoffArgs<'_>) -> Result<i32, CliError> {
    let package_path = resolve_path(args.root, args.package_path);
    let ledger = Ledger::open(args.root)
        .map_err(|ledger_error| CliError::new("E_HANDOFF_FAILED", ledger_error.to_string()))?;
    let mut state = ledger
        .load_state()
        .map_err(|ledger_error| CliError::new("E_HANDOFF_FAILED", ledger_error.to_string()))?;
    let store = HandoffStore::new(&package_path);
    let now = Utc::now();

    match args.mode {
        HandoffMode::Apply => {
            let before_status = state.status.as_str().to_string();
            let plan = store
                .apply_package(&mut state, args.include_accepted_steps, now)
                .map_err(|handoff_error| {
                    CliError::new("E_HANDOFF_FAILED", handoff_error.to_string())
                })?;
            ledger
                .save_state(
                    &state,
                    Some("cli_handoff_apply"),
                    Some(&before_status),
                    Some(state.status.as_str()),
                )
                .map_err(|ledger_error| CliError::new("E_HANDOFF_FAILED", ledger_error.to_string()))?;
            ledger
                .append_event(
                    &plan.task_id,
                    &plan.run_id,
                    plan.resume_step_id.as_deref(),
                    EventType::HandoffApplied,
                    Severity::Info,
                    serde_json::json!({
                        "resume_step_id": plan.resume_step_id,
                        "next_action": plan.next_action,
                        "resumable_step_ids": plan.resumable_step_ids,
                        "package_path": plan.package_path,
                    }),
                    Some(format!(
                        "handoff-applied:{}:{}:{}",
                        plan.task_id,
                        plan.run_id,
                        now.to_rfc3339()
                    )),
                )
                .map_err(|ledger_error| CliError::new("E_HANDOFF_FAILED", ledger_error.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&plan).unwrap_or_default());
        }
        HandoffMode::Create => {
            let evidence_override = if args.evidence_paths.is_empty() {
                None
            } else {
                Some(args.evidence_paths.as_slice())
            };
            let package = store
                .write_package(&state, evidence_override, args.include_accepted_steps, now)
                .map_err(|handoff_error| {
                    CliError::new("E_HANDOFF_FAILED", handoff_error.to_string())
                })?;
            ledger
                .append_event(
                    &package.task_id,
                    &package.run_id,
                    package.current_step.as_deref(),
                    EventType::HandoffCreated,
                    Severity::Info,
                    serde_json::json!({
                        "package_hash": package.package_hash,
                        "package_path": store.package_path().display().to_string(),
                        "resumable_step_ids": package.resumable_step_ids,
                    }),
                    Some(format!(
                        "handoff-created:{}:{}:{}",
                        package.task_id, package.run_id, package.package_hash
                    )),
                )
                .map_err(|ledger_error| CliError::new("E_HANDOFF_FAILED", ledger_error.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&package).unwrap_or_default());
        }
    }
    Ok(0)
}

fn resolve_path(root: &Path, raw: &str) -> PathBuf {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        candidate
    } else {
        root.join(candidate)
    }
}
