//! `daokit init` — create the runtime directory tree and empty state files
//! idempotently.

use std::path::{Path, PathBuf};

use crate::ledger::{FileTreeBackend, LedgerPaths};

use super::CliError;

const REQUIRED_DIRECTORIES: &[&str] = &["state", "artifacts/dispatch", "checkpoints", "handoff"];

/// What init touched, for operator output.
#[derive(Debug, Default)]
pub struct InitOutcome {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

pub fn cmd_init(root: &Path) -> Result<i32, CliError> {
    let outcome = initialize_root(root)?;
    println!(
        "{} DAOKit runtime at: {}",
        console::style("Initialized").green().bold(),
        root.display()
    );
    if !outcome.created.is_empty() {
        println!("Created:");
        for item in &outcome.created {
            println!("  + {item}");
        }
    }
    if !outcome.skipped.is_empty() {
        println!("Unchanged:");
        for item in &outcome.skipped {
            println!("  = {item}");
        }
    }
    Ok(0)
}

/// Create the frozen topology under `root`. Existing files are never
/// overwritten; a path of the wrong type is a hard failure.
pub fn initialize_root(root: &Path) -> Result<InitOutcome, CliError> {
    if root.exists() && !root.is_dir() {
        return Err(CliError::new(
            "E_INIT_FAILED",
            format!(
                "target root '{}' is not a directory. Action: pass --root pointing at a directory.",
                root.display()
            ),
        ));
    }

    let mut outcome = InitOutcome::default();
    for relative in REQUIRED_DIRECTORIES {
        let directory = root.join(relative);
        if directory.exists() {
            if !directory.is_dir() {
                return Err(CliError::new(
                    "E_INIT_FAILED",
                    format!(
                        "expected directory at '{}', found a non-directory entry. Action: move \
                         the conflicting file aside and rerun init.",
                        directory.display()
                    ),
                ));
            }
            outcome.skipped.push(relative.to_string());
        } else {
            std::fs::create_dir_all(&directory).map_err(|source| {
                CliError::new(
                    "E_INIT_FAILED",
                    format!("failed to create '{}': {source}", directory.display()),
                )
            })?;
            outcome.created.push(relative.to_string());
        }
    }

    let paths = LedgerPaths::new(root);
    let state_files: Vec<PathBuf> = vec![
        paths.pipeline_state.clone(),
        paths.heartbeat_status.clone(),
        paths.process_leases.clone(),
        paths.events.clone(),
        paths.snapshots.clone(),
        paths.checkpoints.clone(),
    ];
    for file in &state_files {
        if file.exists() && !file.is_file() {
            return Err(CliError::new(
                "E_INIT_FAILED",
                format!(
                    "expected file at '{}', found a non-file entry. Action: move the \
                     conflicting entry aside and rerun init.",
                    file.display()
                ),
            ));
        }
    }
    let existing: Vec<bool> = state_files.iter().map(|file| file.exists()).collect();

    // The backend writes any missing default documents.
    FileTreeBackend::open(root).map_err(|ledger_error| {
        CliError::new("E_INIT_FAILED", ledger_error.to_string())
    })?;

    for (file, existed) in state_files.iter().zip(existing) {
        let relative = file
            .strip_prefix(root)
            .unwrap_or(file.as_path())
            .display()
            .to_string();
        if existed {
            outcome.skipped.push(relative);
        } else {
            outcome.created.push(relative);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_frozen_topology() {
        let dir = tempdir().unwrap();
        let outcome = initialize_root(dir.path()).unwrap();
        assert!(outcome.created.contains(&"state".to_string()));
        assert!(dir.path().join("state/pipeline_state.json").is_file());
        assert!(dir.path().join("state/events.jsonl").is_file());
        assert!(dir.path().join("artifacts/dispatch").is_dir());
        assert!(dir.path().join("checkpoints/checkpoints.jsonl").is_file());
        assert!(dir.path().join("handoff").is_dir());
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let first = initialize_root(dir.path()).unwrap();
        assert!(!first.created.is_empty());

        // Content survives re-init untouched.
        let state_path = dir.path().join("state/pipeline_state.json");
        let before = std::fs::read_to_string(&state_path).unwrap();
        let second = initialize_root(dir.path()).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(std::fs::read_to_string(&state_path).unwrap(), before);
    }

    #[test]
    fn path_type_conflict_fails_with_init_code() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("state"), "not a directory").unwrap();
        let err = initialize_root(dir.path()).unwrap_err();
        assert_eq!(err.code, "E_INIT_FAILED");
        assert!(err.message.contains("state"));
    }
}
