//! `daokit replay` — iterate events or snapshots from the state ledger.

use std::path::Path;

use crate::ledger::Ledger;

use super::CliError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySource {
    Events,
    Snapshots,
}

pub struct ReplayArgs<'a> {
    pub root: &'a Path,
    pub source: ReplaySource,
    pub limit: usize,
    pub json: bool,
}

pub fn cmd_replay(args: &ReplayArgs<'_>) -> Result<i32, CliError> {
    let ledger = Ledger::open(args.root)
        .map_err(|ledger_error| CliError::new("E_REPLAY_FAILED", ledger_error.to_string()))?;
    let limit = args.limit.max(1);

    match args.source {
        ReplaySource::Events => {
            let events = ledger
                .list_events()
                .map_err(|ledger_error| CliError::new("E_REPLAY_FAILED", ledger_error.to_string()))?;
            let window = tail(&events, limit);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&window).unwrap_or_default());
                return Ok(0);
            }
            if window.is_empty() {
                println!("No events entries recorded.");
                return Ok(0);
            }
            for event in window {
                println!(
                    "{} {} step={} severity={}",
                    event.timestamp.to_rfc3339(),
                    event.event_type.as_str(),
                    event.step_id.as_deref().unwrap_or("-"),
                    event.severity.as_str(),
                );
            }
        }
        ReplaySource::Snapshots => {
            let snapshots = ledger
                .list_snapshots()
                .map_err(|ledger_error| CliError::new("E_REPLAY_FAILED", ledger_error.to_string()))?;
            let window = tail(&snapshots, limit);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&window).unwrap_or_default());
                return Ok(0);
            }
            if window.is_empty() {
                println!("No snapshots entries recorded.");
                return Ok(0);
            }
            for snapshot in window {
                println!(
                    "{} {} from={} to={}",
                    snapshot.timestamp.to_rfc3339(),
                    snapshot.node.as_deref().unwrap_or("-"),
                    snapshot.from_status.as_deref().unwrap_or("-"),
                    snapshot.to_status.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(0)
}

fn tail<T: Clone>(entries: &[T], limit: usize) -> Vec<T> {
    let start = entries.len().saturating_sub(limit);
    entries[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::init::initialize_root;
    use crate::cmd::run::{cmd_run, RunArgs};
    use tempfile::tempdir;

    fn completed_run_root() -> tempfile::TempDir {
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
        dir
    }

    #[test]
    fn replays_events_and_snapshots() {
        let dir = completed_run_root();
        for source in [ReplaySource::Events, ReplaySource::Snapshots] {
            let exit = cmd_replay(&ReplayArgs {
                root: dir.path(),
                source,
                limit: 20,
                json: false,
            })
            .unwrap();
            assert_eq!(exit, 0);
        }
    }

    #[test]
    fn replay_on_empty_root_reports_nothing() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        let exit = cmd_replay(&ReplayArgs {
            root: dir.path(),
            source: ReplaySource::Events,
            limit: 5,
            json: false,
        })
        .unwrap();
        assert_eq!(exit, 0);
    }

    #[test]
    fn corrupt_journal_fails_with_replay_code() {
        let dir = tempdir().unwrap();
        initialize_root(dir.path()).unwrap();
        std::fs::write(dir.path().join("state/events.jsonl"), "{broken\n").unwrap();
        let err = cmd_replay(&ReplayArgs {
            root: dir.path(),
            source: ReplaySource::Events,
            limit: 5,
            json: false,
        })
        .unwrap_err();
        assert_eq!(err.code, "E_REPLAY_FAILED");
    }
}
