//! `daokit status` — aggregated view of ledger, heartbeat, leases, and
//! handoff pointer.

use std::path::Path;

use crate::ledger::Ledger;
use crate::reliability::handoff::HandoffStore;
use crate::reliability::lease::LeaseRegistry;

use super::CliError;

pub struct StatusArgs<'a> {
    pub root: &'a Path,
    pub task_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub json: bool,
}

pub fn cmd_status(args: &StatusArgs<'_>) -> Result<i32, CliError> {
    let ledger = Ledger::open(args.root)
        .map_err(|ledger_error| CliError::new("E_STATUS_FAILED", ledger_error.to_string()))?;
    let pipeline_state = ledger
        .load_state()
        .map_err(|ledger_error| CliError::new("E_STATUS_FAILED", ledger_error.to_string()))?;
    let heartbeat_status = ledger
        .load_heartbeat()
        .map_err(|ledger_error| CliError::new("E_STATUS_FAILED", ledger_error.to_string()))?;

    let task_filter = args
        .task_id
        .map(str::to_string)
        .or_else(|| pipeline_state.task_id.clone());
    let run_filter = args
        .run_id
        .map(str::to_string)
        .or_else(|| pipeline_state.run_id.clone());
    let leases = LeaseRegistry::new(&ledger)
        .list(task_filter.as_deref(), run_filter.as_deref())
        .map_err(|lease_error| CliError::new("E_STATUS_FAILED", lease_error.to_string()))?;

    let handoff_store = HandoffStore::at_root(args.root);
    let handoff_package = handoff_store
        .load_package()
        .map_err(|handoff_error| CliError::new("E_STATUS_FAILED", handoff_error.to_string()))?;

    if args.json {
        let payload = serde_json::json!({
            "pipeline_state": pipeline_state,
            "heartbeat_status": heartbeat_status,
            "leases": leases,
            "handoff_package": handoff_package,
        });
        println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
    } else {
        println!(
            "task_id={} run_id={} status={} current_step={} heartbeat={} leases={} handoff={}",
            pipeline_state.task_id.as_deref().unwrap_or("-"),
            pipeline_state.run_id.as_deref().unwrap_or("-"),
            pipeline_state.status.as_str(),
            pipeline_state.current_step.as_deref().unwrap_or("-"),
            heartbeat_status.status.as_str(),
            leases.len(),
            if handoff_package.is_some() { "yes" } else { "no" },
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::init::initialize_root;
    use crate::cmd::run::{cmd_run, RunArgs};
    use tempfile::tempdir;

    #[test]
    fn status_reads_after_run() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        cmd_run(&RunArgs {
            root: dir.path(),
            task_id: "T1",
            run_id: Some("R1"),
            goal: "demo",
            step_id: "S1",
            lane: "default",
            thread_id: None,
            lease_ttl: 1200,
            simulate_interruption: false,
            no_lease: true,
        })
        .unwrap();

        let exit = cmd_status(&StatusArgs {
            root: dir.path(),
            task_id: None,
            run_id: None,
            json: true,
        })
        .unwrap();
        assert_eq!(exit, 0);
    }

    #[test]
    fn status_fails_on_corrupt_state() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        std::fs::write(dir.path().join("state/pipeline_state.json"), "{oops").unwrap();
        let err = cmd_status(&StatusArgs {
            root: dir.path(),
            task_id: None,
            run_id: None,
            json: false,
        })
        .unwrap_err();
        assert_eq!(err.code, "E_STATUS_FAILED");
    }
}
