//! Typed ledger facade over the pluggable state backends.
//!
//! The ledger is the single source of truth for a run: pipeline state
//! snapshot, append-only event journal, process-lease registry, heartbeat
//! status, and checkpoint records. All subsystems publish through this
//! facade; none of them writes the files directly.

pub mod backend;
pub mod canonical;
pub mod fs;
pub mod sqlite;

pub use backend::{
    load_runtime_settings, resolve_backend_kind, BackendKind, EventDraft, LedgerPaths,
    SnapshotEntry, StateBackend, StoredCheckpoint, ENV_STATE_BACKEND,
};
pub use fs::FileTreeBackend;
pub use sqlite::SqliteBackend;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::contracts::{
    CheckpointRecord, EventRecord, EventType, HeartbeatStatusRecord, PipelineState,
    ProcessLeaseRegistry, Severity, SCHEMA_VERSION,
};
use crate::errors::LedgerError;

/// Typed read/write facade enforcing ledger invariants.
pub struct Ledger {
    backend: Box<dyn StateBackend>,
    root: PathBuf,
}

impl Ledger {
    /// Open a ledger at `root`, resolving the backend from the environment
    /// and the optional runtime settings file.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::open_with_selection(root, None, &env)
    }

    /// Open with an explicit backend override (used by parity tests).
    pub fn open_with_selection(
        root: impl AsRef<Path>,
        explicit_backend: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, LedgerError> {
        let root = root.as_ref().to_path_buf();
        let settings = load_runtime_settings(&root)?;
        let kind = resolve_backend_kind(explicit_backend, env, settings.as_ref())?;
        let backend: Box<dyn StateBackend> = match kind {
            BackendKind::FileTree => Box::new(FileTreeBackend::open(&root)?),
            BackendKind::Sqlite => Box::new(SqliteBackend::open(&root)?),
        };
        Ok(Self { backend, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> LedgerPaths {
        LedgerPaths::new(&self.root)
    }

    pub fn load_state(&self) -> Result<PipelineState, LedgerError> {
        self.backend.read_state()
    }

    /// Persist a new pipeline state snapshot.
    ///
    /// Stamps `updated_at`, then writes the state document, one snapshot
    /// journal entry, and one hash-bound checkpoint record in a single
    /// write boundary.
    pub fn save_state(
        &self,
        state: &PipelineState,
        node: Option<&str>,
        from_status: Option<&str>,
        to_status: Option<&str>,
    ) -> Result<PipelineState, LedgerError> {
        let mut stamped = state.clone();
        stamped.updated_at = Utc::now();
        let state_value = serde_json::to_value(&stamped).map_err(|serialize_error| {
            LedgerError::InvalidDocument {
                path: self.paths().pipeline_state,
                message: format!("failed to serialize pipeline state: {serialize_error}"),
            }
        })?;

        let snapshot = SnapshotEntry {
            timestamp: stamped.updated_at,
            node: node.map(str::to_string),
            from_status: from_status.map(str::to_string),
            to_status: to_status.map(str::to_string),
            state: state_value.clone(),
        };
        let checkpoint = CheckpointRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            checkpoint_id: format!("ckpt_{}", Uuid::new_v4().simple()),
            created_at: stamped.updated_at,
            node: node.map(str::to_string),
            from_status: from_status.map(str::to_string),
            to_status: to_status.map(str::to_string),
            state_hash: canonical::canonical_hash(&state_value),
            state: state_value,
        };
        self.backend.write_state(&stamped, &snapshot, &checkpoint)?;
        Ok(stamped)
    }

    pub fn load_heartbeat(&self) -> Result<HeartbeatStatusRecord, LedgerError> {
        self.backend.read_heartbeat()
    }

    pub fn save_heartbeat(&self, record: &HeartbeatStatusRecord) -> Result<(), LedgerError> {
        self.backend.write_heartbeat(record)
    }

    pub fn load_leases(&self) -> Result<ProcessLeaseRegistry, LedgerError> {
        self.backend.read_leases()
    }

    pub fn save_leases(&self, registry: &ProcessLeaseRegistry) -> Result<(), LedgerError> {
        let mut stamped = registry.clone();
        stamped.updated_at = Utc::now();
        self.backend.write_leases(&stamped)
    }

    /// Append one event to the journal. Event ids are assigned by the
    /// backend and strictly increase; an id once assigned is never
    /// rewritten.
    pub fn append_event(
        &self,
        task_id: &str,
        run_id: &str,
        step_id: Option<&str>,
        event_type: EventType,
        severity: Severity,
        payload: serde_json::Value,
        dedup_key: Option<String>,
    ) -> Result<EventRecord, LedgerError> {
        self.backend.append_event(&EventDraft {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            step_id: step_id.map(str::to_string),
            event_type,
            severity,
            payload,
            dedup_key,
        })
    }

    pub fn list_events(&self) -> Result<Vec<EventRecord>, LedgerError> {
        self.backend.read_events()
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotEntry>, LedgerError> {
        self.backend.read_snapshots()
    }

    /// Recover the newest pipeline state whose checkpoint validates.
    ///
    /// Walks checkpoints newest-first; entries with a hash mismatch,
    /// truncated JSON, or a broken shape are collected as diagnostics and
    /// skipped. The recovered state is annotated under `role_lifecycle`
    /// with the checkpoint id and resume status. With no checkpoints at
    /// all, the live state document is returned unannotated; if entries
    /// exist but none validate, resume fails.
    pub fn latest_valid_checkpoint(&self) -> Result<PipelineState, LedgerError> {
        let stored = self.backend.read_checkpoints_newest_first()?;
        if stored.is_empty() {
            return self.load_state();
        }

        let mut diagnostics: Vec<String> = Vec::new();
        for item in &stored {
            let record = match &item.entry {
                Ok(record) => record,
                Err(message) => {
                    diagnostics.push(format!("entry {}: {}", item.ordinal, message));
                    continue;
                }
            };
            if let Some(problem) = record.shape_error() {
                diagnostics.push(format!("entry {}: {}", item.ordinal, problem));
                continue;
            }
            let expected = canonical::canonical_hash(&record.state);
            if record.state_hash != expected {
                diagnostics.push(format!("entry {}: state_hash validation failed", item.ordinal));
                continue;
            }
            let mut state: PipelineState =
                match serde_json::from_value(record.state.clone()) {
                    Ok(state) => state,
                    Err(parse_error) => {
                        diagnostics.push(format!(
                            "entry {}: state does not parse as pipeline state: {parse_error}",
                            item.ordinal
                        ));
                        continue;
                    }
                };
            annotate_resume(&mut state, &record.checkpoint_id, &diagnostics);
            return Ok(state);
        }

        let mut summary = diagnostics
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if diagnostics.len() > 3 {
            summary = format!("{summary}; ... {} more", diagnostics.len() - 3);
        }
        Err(LedgerError::CheckpointResume(format!(
            "no valid checkpoint entries under '{}'; {summary}",
            self.root.display()
        )))
    }
}

fn annotate_resume(state: &mut PipelineState, checkpoint_id: &str, diagnostics: &[String]) {
    state
        .role_lifecycle
        .insert("checkpoint_resume_id".to_string(), checkpoint_id.to_string());
    if diagnostics.is_empty() {
        state.role_lifecycle.insert(
            "checkpoint_resume_status".to_string(),
            "clean".to_string(),
        );
        state
            .role_lifecycle
            .insert("checkpoint_resume_diagnostics_count".to_string(), "0".to_string());
        state.role_lifecycle.remove("checkpoint_resume_diagnostics");
    } else {
        state.role_lifecycle.insert(
            "checkpoint_resume_status".to_string(),
            "recovered_with_warnings".to_string(),
        );
        state.role_lifecycle.insert(
            "checkpoint_resume_diagnostics_count".to_string(),
            diagnostics.len().to_string(),
        );
        state.role_lifecycle.insert(
            "checkpoint_resume_diagnostics".to_string(),
            diagnostics
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::PipelineStatus;
    use tempfile::tempdir;

    fn open(root: &Path) -> Ledger {
        Ledger::open_with_selection(root, Some("filesystem"), &BTreeMap::new()).unwrap()
    }

    #[test]
    fn save_state_appends_snapshot_and_checkpoint() {
        let dir = tempdir().unwrap();
        let ledger = open(dir.path());
        let mut state = ledger.load_state().unwrap();
        state.goal = "demo".to_string();
        state.status = PipelineStatus::Analysis;
        ledger
            .save_state(&state, Some("extract"), Some("PLANNING"), Some("ANALYSIS"))
            .unwrap();

        let snapshots = ledger.list_snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].node.as_deref(), Some("extract"));
        assert_eq!(snapshots[0].to_status.as_deref(), Some("ANALYSIS"));
    }

    #[test]
    fn latest_valid_checkpoint_round_trips_state() {
        let dir = tempdir().unwrap();
        let ledger = open(dir.path());
        let mut state = ledger.load_state().unwrap();
        state.goal = "resume me".to_string();
        state.status = PipelineStatus::Freeze;
        ledger
            .save_state(&state, Some("plan"), Some("ANALYSIS"), Some("FREEZE"))
            .unwrap();

        let recovered = ledger.latest_valid_checkpoint().unwrap();
        assert_eq!(recovered.goal, "resume me");
        assert_eq!(recovered.status, PipelineStatus::Freeze);
        assert_eq!(
            recovered
                .role_lifecycle
                .get("checkpoint_resume_status")
                .map(String::as_str),
            Some("clean")
        );
    }

    #[test]
    fn invalid_newest_checkpoint_falls_back_with_warnings() {
        let dir = tempdir().unwrap();
        let ledger = open(dir.path());
        let mut state = ledger.load_state().unwrap();
        state.goal = "good".to_string();
        ledger.save_state(&state, Some("extract"), None, None).unwrap();

        // Append a corrupt newest entry directly to the journal.
        let checkpoints = ledger.paths().checkpoints;
        let mut text = std::fs::read_to_string(&checkpoints).unwrap();
        text.push_str("{truncated\n");
        std::fs::write(&checkpoints, text).unwrap();

        let recovered = ledger.latest_valid_checkpoint().unwrap();
        assert_eq!(recovered.goal, "good");
        assert_eq!(
            recovered
                .role_lifecycle
                .get("checkpoint_resume_status")
                .map(String::as_str),
            Some("recovered_with_warnings")
        );
        assert_eq!(
            recovered
                .role_lifecycle
                .get("checkpoint_resume_diagnostics_count")
                .map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let dir = tempdir().unwrap();
        let ledger = open(dir.path());
        let state = ledger.load_state().unwrap();
        ledger.save_state(&state, None, None, None).unwrap();

        let checkpoints = ledger.paths().checkpoints;
        let text = std::fs::read_to_string(&checkpoints).unwrap();
        let tampered = text.replace("\"goal\":\"\"", "\"goal\":\"tampered\"");
        assert_ne!(text, tampered);
        std::fs::write(&checkpoints, tampered).unwrap();

        let err = ledger.latest_valid_checkpoint().unwrap_err();
        assert!(err.to_string().contains("state_hash validation failed"));
    }

    #[test]
    fn no_checkpoints_returns_live_state() {
        let dir = tempdir().unwrap();
        let ledger = open(dir.path());
        let recovered = ledger.latest_valid_checkpoint().unwrap();
        assert_eq!(recovered.status, PipelineStatus::Planning);
        assert!(!recovered.role_lifecycle.contains_key("checkpoint_resume_id"));
    }
}
