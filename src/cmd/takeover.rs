//! `daokit takeover` — accept succession for a run after interruption.

use std::path::Path;

use chrono::Utc;

use crate::ledger::Ledger;
use crate::reliability::succession::SuccessionManager;

use super::CliError;

pub struct TakeoverArgs<'a> {
    pub root: &'a Path,
    pub task_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub successor_thread_id: Option<&'a str>,
    pub successor_pid: u32,
    pub lease_ttl: Option<u64>,
}

pub fn cmd_takeover(args: &TakeoverArgs<'_>) -> Result<i32, CliError> {
    let ledger = Ledger::open(args.root)
        .map_err(|ledger_error| CliError::new("E_TAKEOVER_FAILED", ledger_error.to_string()))?;
    let state = ledger
        .load_state()
        .map_err(|ledger_error| CliError::new("E_TAKEOVER_FAILED", ledger_error.to_string()))?;

    let task_id = args
        .task_id
        .map(str::to_string)
        .or_else(|| state.task_id.clone())
        .ok_or_else(|| {
            CliError::new(
                "E_TAKEOVER_FAILED",
                "task id is required for takeover. Action: pass --task-id or run against a \
                 ledger with a recorded run.",
            )
        })?;
    let run_id = args
        .run_id
        .map(str::to_string)
        .or_else(|| state.run_id.clone())
        .ok_or_else(|| {
            CliError::new(
                "E_TAKEOVER_FAILED",
                "run id is required for takeover. Action: pass --run-id or run against a \
                 ledger with a recorded run.",
            )
        })?;
    let successor_thread_id = args
        .successor_thread_id
        .map(str::to_string)
        .unwrap_or_else(|| format!("takeover-{}", std::process::id()));

    let manager = SuccessionManager::new(&task_id, &run_id);
    let result = manager
        .accept_successor(
            &ledger,
            &successor_thread_id,
            args.successor_pid,
            args.lease_ttl,
            None,
            Utc::now(),
        )
        .map_err(|succession_error| {
            CliError::new("E_TAKEOVER_FAILED", succession_error.to_string())
        })?;

    let payload = serde_json::json!({
        "task_id": result.task_id,
        "run_id": result.run_id,
        "takeover_at": result.takeover_at.to_rfc3339(),
        "adopted_step_ids": result.adopted_step_ids,
        "failed_step_ids": result.failed_step_ids,
    });
    println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::init::initialize_root;
    use crate::cmd::run::{cmd_run, RunArgs};
    use tempfile::tempdir;

    #[test]
    fn takeover_after_simulated_interruption_adopts_lease() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let exit = cmd_run(&RunArgs {
            root: dir.path(),
            task_id: "T1",
            run_id: Some("R1"),
            goal: "demo",
            step_id: "S1",
            lane: "default",
            thread_id: None,
            lease_ttl: 1200,
            simulate_interruption: true,
            no_lease: false,
        })
        .unwrap();
        assert_eq!(exit, 130);

        let takeover_exit = cmd_takeover(&TakeoverArgs {
            root: dir.path(),
            task_id: Some("T1"),
            run_id: Some("R1"),
            successor_thread_id: Some("thread-recover"),
            successor_pid: 4242,
            lease_ttl: None,
        })
        .unwrap();
        assert_eq!(takeover_exit, 0);

        let ledger = Ledger::open(dir.path()).unwrap();
        let state = ledger.load_state().unwrap();
        assert!(state.succession.last_takeover_at.is_some());
        assert_eq!(
            state.succession.successor.as_ref().unwrap().thread_id,
            "thread-recover"
        );
        let leases = ledger.load_leases().unwrap().leases;
        assert_eq!(leases[0].thread_id, "thread-recover");
    }

    #[test]
    fn takeover_without_run_identity_fails() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let err = cmd_takeover(&TakeoverArgs {
            root: dir.path(),
            task_id: None,
            run_id: None,
            successor_thread_id: None,
            successor_pid: 1,
            lease_ttl: None,
        })
        .unwrap_err();
        assert_eq!(err.code, "E_TAKEOVER_FAILED");
    }
}
