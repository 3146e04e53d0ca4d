//! Pluggable persistence behind the ledger facade.
//!
//! Two interchangeable implementations exist: a file tree (`fs`) and a
//! transactional sqlite store (`sqlite`). Contract parity between them is
//! mandatory and validated by replaying identical scenarios.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::contracts::{
    CheckpointRecord, EventRecord, HeartbeatStatusRecord, PipelineState, ProcessLeaseRegistry,
};
use crate::errors::LedgerError;

/// One entry in the snapshot journal, written next to every state save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub timestamp: DateTime<Utc>,
    pub node: Option<String>,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub state: serde_json::Value,
}

/// A checkpoint entry as read back from storage: either a parsed record or
/// a diagnostic describing why the entry is unusable.
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    /// 1-based position in the journal (line number / row ordinal).
    pub ordinal: usize,
    pub entry: Result<CheckpointRecord, String>,
}

/// Persistence contract shared by both backends.
///
/// `write_state` persists the mutable state document together with its
/// snapshot and checkpoint entries as one write boundary: a reader never
/// observes the snapshot without its checkpoint or vice versa.
pub trait StateBackend: Send {
    fn read_state(&self) -> Result<PipelineState, LedgerError>;

    fn write_state(
        &self,
        state: &PipelineState,
        snapshot: &SnapshotEntry,
        checkpoint: &CheckpointRecord,
    ) -> Result<(), LedgerError>;

    fn read_heartbeat(&self) -> Result<HeartbeatStatusRecord, LedgerError>;

    fn write_heartbeat(&self, record: &HeartbeatStatusRecord) -> Result<(), LedgerError>;

    fn read_leases(&self) -> Result<ProcessLeaseRegistry, LedgerError>;

    fn write_leases(&self, registry: &ProcessLeaseRegistry) -> Result<(), LedgerError>;

    /// Append an event, assigning the next strictly increasing event id.
    fn append_event(&self, draft: &EventDraft) -> Result<EventRecord, LedgerError>;

    fn read_events(&self) -> Result<Vec<EventRecord>, LedgerError>;

    fn read_snapshots(&self) -> Result<Vec<SnapshotEntry>, LedgerError>;

    /// Checkpoints newest-first, with unusable entries kept as diagnostics.
    fn read_checkpoints_newest_first(&self) -> Result<Vec<StoredCheckpoint>, LedgerError>;
}

/// Event fields supplied by publishers; the backend stamps id and time.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub task_id: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub event_type: crate::contracts::EventType,
    pub severity: crate::contracts::Severity,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
}

/// Backend selection, resolved from the environment or the runtime
/// settings file. There is deliberately no CLI argument for this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    FileTree,
    Sqlite,
}

/// Environment variable controlling backend selection.
pub const ENV_STATE_BACKEND: &str = "DAOKIT_STATE_BACKEND";

/// Optional settings file consulted after the environment.
pub const RUNTIME_SETTINGS_FILE: &str = "state/runtime_settings.json";

/// Resolve the backend kind from an explicit override, the environment,
/// then the runtime settings file (`state.backend` or
/// `runtime.state_backend`). Defaults to the file tree.
pub fn resolve_backend_kind(
    explicit: Option<&str>,
    env: &BTreeMap<String, String>,
    settings: Option<&serde_json::Value>,
) -> Result<BackendKind, LedgerError> {
    let source = explicit
        .map(str::to_string)
        .or_else(|| env.get(ENV_STATE_BACKEND).cloned())
        .or_else(|| {
            settings.and_then(|value| {
                nested_string(value, &["state", "backend"])
                    .or_else(|| nested_string(value, &["runtime", "state_backend"]))
            })
        });

    let normalized = match &source {
        None => return Ok(BackendKind::FileTree),
        Some(text) => text.trim().to_ascii_lowercase(),
    };
    match normalized.as_str() {
        "fs" | "filesystem" | "file" | "file-system" | "file_system" => Ok(BackendKind::FileTree),
        "sqlite" | "sqlite3" => Ok(BackendKind::Sqlite),
        _ => Err(LedgerError::UnsupportedBackend { value: normalized }),
    }
}

/// Load `state/runtime_settings.json` when present.
pub fn load_runtime_settings(root: &Path) -> Result<Option<serde_json::Value>, LedgerError> {
    let path = root.join(RUNTIME_SETTINGS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).map_err(|source| LedgerError::ReadFailed {
        path: path.clone(),
        source,
    })?;
    let value =
        serde_json::from_str(&text).map_err(|parse_error| LedgerError::InvalidDocument {
            path,
            message: format!("invalid JSON: {parse_error}"),
        })?;
    Ok(Some(value))
}

fn nested_string(value: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut node = value;
    for token in path {
        node = node.get(token)?;
    }
    node.as_str().map(str::to_string)
}

/// Relative paths of the persisted file tree, shared by both backends (the
/// sqlite backend mirrors the JSON documents for operator tooling).
#[derive(Debug, Clone)]
pub struct LedgerPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub pipeline_state: PathBuf,
    pub heartbeat_status: PathBuf,
    pub process_leases: PathBuf,
    pub events: PathBuf,
    pub snapshots: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub checkpoints: PathBuf,
}

impl LedgerPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join("state");
        let checkpoints_dir = root.join("checkpoints");
        Self {
            pipeline_state: state_dir.join("pipeline_state.json"),
            heartbeat_status: state_dir.join("heartbeat_status.json"),
            process_leases: state_dir.join("process_leases.json"),
            events: state_dir.join("events.jsonl"),
            snapshots: state_dir.join("snapshots.jsonl"),
            checkpoints: checkpoints_dir.join("checkpoints.jsonl"),
            state_dir,
            checkpoints_dir,
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn backend_defaults_to_file_tree() {
        let kind = resolve_backend_kind(None, &env(&[]), None).unwrap();
        assert_eq!(kind, BackendKind::FileTree);
    }

    #[test]
    fn backend_env_aliases() {
        for alias in ["fs", "filesystem", "FILE", "file-system", "file_system"] {
            let kind =
                resolve_backend_kind(None, &env(&[(ENV_STATE_BACKEND, alias)]), None).unwrap();
            assert_eq!(kind, BackendKind::FileTree, "alias {alias}");
        }
        for alias in ["sqlite", "SQLITE3"] {
            let kind =
                resolve_backend_kind(None, &env(&[(ENV_STATE_BACKEND, alias)]), None).unwrap();
            assert_eq!(kind, BackendKind::Sqlite, "alias {alias}");
        }
    }

    #[test]
    fn backend_settings_paths() {
        let settings = json!({"state": {"backend": "sqlite"}});
        let kind = resolve_backend_kind(None, &env(&[]), Some(&settings)).unwrap();
        assert_eq!(kind, BackendKind::Sqlite);

        let settings = json!({"runtime": {"state_backend": "filesystem"}});
        let kind = resolve_backend_kind(None, &env(&[]), Some(&settings)).unwrap();
        assert_eq!(kind, BackendKind::FileTree);
    }

    #[test]
    fn explicit_beats_env_and_unknown_fails() {
        let environment = env(&[(ENV_STATE_BACKEND, "sqlite")]);
        let kind = resolve_backend_kind(Some("filesystem"), &environment, None).unwrap();
        assert_eq!(kind, BackendKind::FileTree);

        let err = resolve_backend_kind(Some("etcd"), &environment, None).unwrap_err();
        assert!(err.to_string().contains("unsupported state backend"));
    }

    #[test]
    fn ledger_paths_follow_frozen_topology() {
        let paths = LedgerPaths::new("/run/root");
        assert!(paths.pipeline_state.ends_with("state/pipeline_state.json"));
        assert!(paths.events.ends_with("state/events.jsonl"));
        assert!(paths.checkpoints.ends_with("checkpoints/checkpoints.jsonl"));
    }
}
