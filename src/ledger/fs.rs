//! File-tree state backend.
//!
//! Whole-object documents (`pipeline_state.json`, `heartbeat_status.json`,
//! `process_leases.json`) are rewritten through a temp file + atomic rename.
//! Journals (`events.jsonl`, `snapshots.jsonl`, `checkpoints.jsonl`) are
//! append-only with an fsync after every write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::contracts::{
    CheckpointRecord, EventRecord, HeartbeatStatusRecord, PipelineState, ProcessLeaseRegistry,
    SCHEMA_VERSION,
};
use crate::errors::LedgerError;

use super::backend::{EventDraft, LedgerPaths, SnapshotEntry, StateBackend, StoredCheckpoint};

/// File-backed ledger storage rooted at the runtime directory.
pub struct FileTreeBackend {
    paths: LedgerPaths,
}

impl FileTreeBackend {
    /// Open (and lazily create) the file tree under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let backend = Self {
            paths: LedgerPaths::new(root),
        };
        backend.ensure_layout()?;
        Ok(backend)
    }

    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    fn ensure_layout(&self) -> Result<(), LedgerError> {
        for dir in [&self.paths.state_dir, &self.paths.checkpoints_dir] {
            fs::create_dir_all(dir).map_err(|source| LedgerError::WriteFailed {
                path: dir.clone(),
                source,
            })?;
        }
        if !self.paths.pipeline_state.exists() {
            write_json_atomic(&self.paths.pipeline_state, &PipelineState::initial(Utc::now()))?;
        }
        if !self.paths.heartbeat_status.exists() {
            write_json_atomic(
                &self.paths.heartbeat_status,
                &HeartbeatStatusRecord::initial(Utc::now()),
            )?;
        }
        if !self.paths.process_leases.exists() {
            write_json_atomic(
                &self.paths.process_leases,
                &ProcessLeaseRegistry::empty(Utc::now()),
            )?;
        }
        for journal in [&self.paths.events, &self.paths.snapshots, &self.paths.checkpoints] {
            if !journal.exists() {
                fs::write(journal, "").map_err(|source| LedgerError::WriteFailed {
                    path: journal.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn next_event_id(&self) -> Result<u64, LedgerError> {
        let text = read_text(&self.paths.events)?;
        let last_id = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<EventRecord>(line).ok())
            .map(|event| event.event_id)
            .max()
            .unwrap_or(0);
        Ok(last_id + 1)
    }
}

impl StateBackend for FileTreeBackend {
    fn read_state(&self) -> Result<PipelineState, LedgerError> {
        read_json(&self.paths.pipeline_state)
    }

    fn write_state(
        &self,
        state: &PipelineState,
        snapshot: &SnapshotEntry,
        checkpoint: &CheckpointRecord,
    ) -> Result<(), LedgerError> {
        write_json_atomic(&self.paths.pipeline_state, state)?;
        append_jsonl(&self.paths.snapshots, snapshot)?;
        append_jsonl(&self.paths.checkpoints, checkpoint)?;
        Ok(())
    }

    fn read_heartbeat(&self) -> Result<HeartbeatStatusRecord, LedgerError> {
        read_json(&self.paths.heartbeat_status)
    }

    fn write_heartbeat(&self, record: &HeartbeatStatusRecord) -> Result<(), LedgerError> {
        write_json_atomic(&self.paths.heartbeat_status, record)
    }

    fn read_leases(&self) -> Result<ProcessLeaseRegistry, LedgerError> {
        read_json(&self.paths.process_leases)
    }

    fn write_leases(&self, registry: &ProcessLeaseRegistry) -> Result<(), LedgerError> {
        write_json_atomic(&self.paths.process_leases, registry)
    }

    fn append_event(&self, draft: &EventDraft) -> Result<EventRecord, LedgerError> {
        let event = EventRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id: self.next_event_id()?,
            timestamp: Utc::now(),
            event_type: draft.event_type,
            severity: draft.severity,
            task_id: draft.task_id.clone(),
            run_id: draft.run_id.clone(),
            step_id: draft.step_id.clone(),
            dedup_key: draft.dedup_key.clone(),
            payload: draft.payload.clone(),
        };
        append_jsonl(&self.paths.events, &event)?;
        Ok(event)
    }

    fn read_events(&self) -> Result<Vec<EventRecord>, LedgerError> {
        read_jsonl(&self.paths.events)
    }

    fn read_snapshots(&self) -> Result<Vec<SnapshotEntry>, LedgerError> {
        read_jsonl(&self.paths.snapshots)
    }

    fn read_checkpoints_newest_first(&self) -> Result<Vec<StoredCheckpoint>, LedgerError> {
        let text = read_text(&self.paths.checkpoints)?;
        let mut entries: Vec<StoredCheckpoint> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<CheckpointRecord>(trimmed)
                .map_err(|_| "checkpoint entry is not a valid checkpoint object".to_string());
            entries.push(StoredCheckpoint {
                ordinal: index + 1,
                entry,
            });
        }
        entries.reverse();
        Ok(entries)
    }
}

fn read_text(path: &PathBuf) -> Result<String, LedgerError> {
    fs::read_to_string(path).map_err(|source| LedgerError::ReadFailed {
        path: path.clone(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &PathBuf) -> Result<T, LedgerError> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|parse_error| LedgerError::InvalidDocument {
        path: path.clone(),
        message: format!("invalid JSON document: {parse_error}"),
    })
}

fn read_jsonl<T: DeserializeOwned>(path: &PathBuf) -> Result<Vec<T>, LedgerError> {
    let text = read_text(path)?;
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry =
            serde_json::from_str(trimmed).map_err(|parse_error| LedgerError::InvalidDocument {
                path: path.clone(),
                message: format!("line {}: invalid JSON entry: {parse_error}", index + 1),
            })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Whole-object rewrite with atomic replace: write a sibling temp file,
/// fsync, then rename over the target.
fn write_json_atomic<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), LedgerError> {
    let rendered = serde_json::to_string_pretty(value).map_err(|serialize_error| {
        LedgerError::InvalidDocument {
            path: path.clone(),
            message: format!("failed to serialize document: {serialize_error}"),
        }
    })?;
    let tmp_path = path.with_extension("json.tmp");
    let write = |path: &PathBuf, source| LedgerError::WriteFailed {
        path: path.clone(),
        source,
    };
    let mut file = File::create(&tmp_path).map_err(|source| write(&tmp_path, source))?;
    file.write_all(rendered.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|source| write(&tmp_path, source))?;
    fs::rename(&tmp_path, path).map_err(|source| write(path, source))?;
    Ok(())
}

/// Append one compact JSON line and fsync the journal.
fn append_jsonl<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), LedgerError> {
    let rendered =
        serde_json::to_string(value).map_err(|serialize_error| LedgerError::InvalidDocument {
            path: path.clone(),
            message: format!("failed to serialize journal entry: {serialize_error}"),
        })?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LedgerError::WriteFailed {
            path: path.clone(),
            source,
        })?;
    file.write_all(rendered.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|source| LedgerError::WriteFailed {
            path: path.clone(),
            source,
        })?;
    Ok(())
}
