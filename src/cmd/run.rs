//! `daokit run` — start (or simulate interrupting) a run.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;

use crate::acceptance::AcceptanceConfig;
use crate::dispatch::{dispatch_adapter_from_env, DispatchAdapter, ENV_DISPATCH_BACKEND};
use crate::ledger::{load_runtime_settings, Ledger};
use crate::lifecycle::{LifecycleRuntime, RunOptions};
use crate::reliability::lease::{LeaseRegistry, RegisterLease};

use super::CliError;

pub struct RunArgs<'a> {
    pub root: &'a Path,
    pub task_id: &'a str,
    pub run_id: Option<&'a str>,
    pub goal: &'a str,
    pub step_id: &'a str,
    pub lane: &'a str,
    pub thread_id: Option<&'a str>,
    pub lease_ttl: u64,
    pub simulate_interruption: bool,
    pub no_lease: bool,
}

pub fn cmd_run(args: &RunArgs<'_>) -> Result<i32, CliError> {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let run_id = args
        .run_id
        .map(str::to_string)
        .unwrap_or_else(|| generate_run_id(args.task_id));

    let ledger = Ledger::open(args.root)
        .map_err(|ledger_error| CliError::new("E_RUN_FAILED", ledger_error.to_string()))?;

    // The dispatch backend is internal configuration: resolved from the
    // environment and the runtime settings file, never from argv. With no
    // selector configured the runtime advances the ledger without a worker.
    let settings = load_runtime_settings(args.root)
        .map_err(|ledger_error| CliError::new("E_RUN_FAILED", ledger_error.to_string()))?;
    let adapter: Option<Box<dyn DispatchAdapter>> = if env.contains_key(ENV_DISPATCH_BACKEND)
        || settings
            .as_ref()
            .and_then(|value| value.get("dispatch"))
            .is_some()
    {
        let artifact_root = args.root.join("artifacts").join("dispatch");
        Some(
            dispatch_adapter_from_env(&env, settings.as_ref(), artifact_root)
                .map_err(|dispatch_error| CliError::new("E_RUN_FAILED", dispatch_error.to_string()))?,
        )
    } else {
        None
    };

    let mut options = RunOptions::at_root(args.root);
    options.step_id = args.step_id.to_string();
    let runtime = LifecycleRuntime::new(
        args.task_id,
        &run_id,
        args.goal,
        ledger,
        adapter,
        AcceptanceConfig::default(),
        options,
    )
    .map_err(|lifecycle_error| CliError::new("E_RUN_FAILED", lifecycle_error.to_string()))?;

    let mut lease_token: Option<String> = None;
    if !args.no_lease {
        let registry = LeaseRegistry::new(runtime.ledger());
        let lease = registry
            .register(
                &RegisterLease {
                    lane: args.lane.to_string(),
                    step_id: args.step_id.to_string(),
                    task_id: args.task_id.to_string(),
                    run_id: run_id.clone(),
                    thread_id: args
                        .thread_id
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("cli-{}", std::process::id())),
                    pid: std::process::id(),
                    ttl_seconds: args.lease_ttl,
                },
                Utc::now(),
            )
            .map_err(|lease_error| {
                CliError::new(
                    "E_RUN_FAILED",
                    format!("unable to register lease: {lease_error}"),
                )
            })?;
        lease_token = Some(lease.lease_token);
    }

    if args.simulate_interruption {
        eprintln!("E_RUN_INTERRUPTED: simulated interruption, lease left ACTIVE for takeover");
        return Ok(130);
    }

    let final_state = runtime
        .run()
        .map_err(|lifecycle_error| CliError::new("E_RUN_FAILED", lifecycle_error.to_string()))?;

    if let Some(token) = lease_token {
        // Best effort: a lease that cannot be released stays visible for
        // takeover rather than failing a finished run.
        let registry = LeaseRegistry::new(runtime.ledger());
        let _ = registry.release(&token, args.task_id, &run_id, args.step_id, Utc::now());
    }

    println!(
        "task_id={} run_id={} status={} current_step={}",
        args.task_id,
        run_id,
        final_state.status.as_str(),
        final_state.current_step.as_deref().unwrap_or("-"),
    );
    Ok(0)
}

fn generate_run_id(task_id: &str) -> String {
    format!("{task_id}_{}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::init::initialize_root;
    use crate::contracts::LeaseStatus;
    use tempfile::tempdir;

    fn args<'a>(root: &'a Path, run_id: &'a str) -> RunArgs<'a> {
        RunArgs {
            root,
            task_id: "T1",
            run_id: Some(run_id),
            goal: "demo",
            step_id: "S1",
            lane: "default",
            thread_id: Some("thread-test"),
            lease_ttl: 1200,
            simulate_interruption: false,
            no_lease: false,
        }
    }

    #[test]
    fn run_completes_and_releases_lease() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let exit = cmd_run(&args(dir.path(), "R1")).unwrap();
        assert_eq!(exit, 0);

        let ledger = Ledger::open(dir.path()).unwrap();
        let state = ledger.load_state().unwrap();
        assert_eq!(state.status.as_str(), "DONE");
        let leases = ledger.load_leases().unwrap().leases;
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].status, LeaseStatus::Released);
    }

    #[test]
    fn simulated_interruption_exits_130_with_active_lease() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let mut run_args = args(dir.path(), "R1");
        run_args.simulate_interruption = true;
        let exit = cmd_run(&run_args).unwrap();
        assert_eq!(exit, 130);

        let ledger = Ledger::open(dir.path()).unwrap();
        let leases = ledger.load_leases().unwrap().leases;
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].status, LeaseStatus::Active);
    }

    #[test]
    fn no_lease_skips_registration() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let mut run_args = args(dir.path(), "R1");
        run_args.no_lease = true;
        cmd_run(&run_args).unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        assert!(ledger.load_leases().unwrap().leases.is_empty());
    }

    #[test]
    fn run_id_is_derived_when_omitted() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let mut run_args = args(dir.path(), "ignored");
        run_args.run_id = None;
        cmd_run(&run_args).unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        let state = ledger.load_state().unwrap();
        assert!(state.run_id.unwrap().starts_with("T1_"));
    }
}
