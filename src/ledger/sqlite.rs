//! Transactional sqlite state backend.
//!
//! Same five persistence domains as the file tree, with transactional
//! appends for journals and single-statement updates for the mutable JSON
//! documents. Every write also mirrors the JSON file tree so operator
//! tooling that expects files on disk keeps working; the sqlite tables are
//! the authority when both exist.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::contracts::{
    CheckpointRecord, EventRecord, HeartbeatStatusRecord, PipelineState, ProcessLeaseRegistry,
    SCHEMA_VERSION,
};
use crate::errors::LedgerError;

use super::backend::{EventDraft, LedgerPaths, SnapshotEntry, StateBackend, StoredCheckpoint};
use super::fs::FileTreeBackend;

/// Sqlite-backed ledger storage with file-tree mirroring.
pub struct SqliteBackend {
    db_path: PathBuf,
    mirror: FileTreeBackend,
}

impl SqliteBackend {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let mirror = FileTreeBackend::open(root.as_ref())?;
        let db_path = mirror.paths().state_dir.join("state.sqlite3");
        let backend = Self { db_path, mirror };
        let conn = backend.connect()?;
        backend.ensure_schema(&conn)?;
        backend.seed_defaults(&conn)?;
        Ok(backend)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn paths(&self) -> &LedgerPaths {
        self.mirror.paths()
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(conn)
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_state (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 state_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS heartbeat_status (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 status_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS process_leases (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 leases_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS snapshots (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 entry_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS checkpoints (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 checkpoint_id TEXT NOT NULL UNIQUE,
                 entry_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS events (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 event_id INTEGER NOT NULL UNIQUE,
                 event_json TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    /// Seed singleton rows, preferring any JSON documents already on disk
    /// so a file-tree ledger can be adopted in place.
    fn seed_defaults(&self, conn: &Connection) -> Result<(), LedgerError> {
        if self.singleton_missing(conn, "pipeline_state")? {
            let seeded = self
                .mirror
                .read_state()
                .unwrap_or_else(|_| PipelineState::initial(Utc::now()));
            conn.execute(
                "INSERT INTO pipeline_state(id, state_json) VALUES (1, ?1)",
                params![to_json(&seeded)?],
            )?;
        }
        if self.singleton_missing(conn, "heartbeat_status")? {
            let seeded = self
                .mirror
                .read_heartbeat()
                .unwrap_or_else(|_| HeartbeatStatusRecord::initial(Utc::now()));
            conn.execute(
                "INSERT INTO heartbeat_status(id, status_json) VALUES (1, ?1)",
                params![to_json(&seeded)?],
            )?;
        }
        if self.singleton_missing(conn, "process_leases")? {
            let seeded = self
                .mirror
                .read_leases()
                .unwrap_or_else(|_| ProcessLeaseRegistry::empty(Utc::now()));
            conn.execute(
                "INSERT INTO process_leases(id, leases_json) VALUES (1, ?1)",
                params![to_json(&seeded)?],
            )?;
        }
        Ok(())
    }

    fn singleton_missing(&self, conn: &Connection, table: &str) -> Result<bool, LedgerError> {
        let row: Option<i64> = conn
            .query_row(&format!("SELECT 1 FROM {table} WHERE id = 1"), [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(row.is_none())
    }

    fn read_singleton<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
    ) -> Result<T, LedgerError> {
        let conn = self.connect()?;
        let text: String = conn.query_row(
            &format!("SELECT {column} FROM {table} WHERE id = 1"),
            [],
            |row| row.get(0),
        )?;
        from_json(&self.db_path, &text)
    }
}

impl StateBackend for SqliteBackend {
    fn read_state(&self) -> Result<PipelineState, LedgerError> {
        self.read_singleton("pipeline_state", "state_json")
    }

    fn write_state(
        &self,
        state: &PipelineState,
        snapshot: &SnapshotEntry,
        checkpoint: &CheckpointRecord,
    ) -> Result<(), LedgerError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE pipeline_state SET state_json = ?1 WHERE id = 1",
            params![to_json(state)?],
        )?;
        tx.execute(
            "INSERT INTO snapshots(entry_json) VALUES (?1)",
            params![to_json(snapshot)?],
        )?;
        tx.execute(
            "INSERT INTO checkpoints(checkpoint_id, entry_json) VALUES (?1, ?2)",
            params![checkpoint.checkpoint_id, to_json(checkpoint)?],
        )?;
        tx.commit()?;
        self.mirror.write_state(state, snapshot, checkpoint)
    }

    fn read_heartbeat(&self) -> Result<HeartbeatStatusRecord, LedgerError> {
        self.read_singleton("heartbeat_status", "status_json")
    }

    fn write_heartbeat(&self, record: &HeartbeatStatusRecord) -> Result<(), LedgerError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE heartbeat_status SET status_json = ?1 WHERE id = 1",
            params![to_json(record)?],
        )?;
        self.mirror.write_heartbeat(record)
    }

    fn read_leases(&self) -> Result<ProcessLeaseRegistry, LedgerError> {
        self.read_singleton("process_leases", "leases_json")
    }

    fn write_leases(&self, registry: &ProcessLeaseRegistry) -> Result<(), LedgerError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE process_leases SET leases_json = ?1 WHERE id = 1",
            params![to_json(registry)?],
        )?;
        self.mirror.write_leases(registry)
    }

    fn append_event(&self, draft: &EventDraft) -> Result<EventRecord, LedgerError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let last_id: Option<i64> =
            tx.query_row("SELECT MAX(event_id) FROM events", [], |row| row.get(0))?;
        let event = EventRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            event_id: last_id.unwrap_or(0) as u64 + 1,
            timestamp: Utc::now(),
            event_type: draft.event_type,
            severity: draft.severity,
            task_id: draft.task_id.clone(),
            run_id: draft.run_id.clone(),
            step_id: draft.step_id.clone(),
            dedup_key: draft.dedup_key.clone(),
            payload: draft.payload.clone(),
        };
        tx.execute(
            "INSERT INTO events(event_id, event_json) VALUES (?1, ?2)",
            params![event.event_id as i64, to_json(&event)?],
        )?;
        tx.commit()?;

        // Mirror by raw append so event ids stay aligned across views.
        mirror_event(&self.mirror, &event)?;
        Ok(event)
    }

    fn read_events(&self) -> Result<Vec<EventRecord>, LedgerError> {
        let conn = self.connect()?;
        let mut statement = conn.prepare("SELECT event_json FROM events ORDER BY seq ASC")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(from_json(&self.db_path, &row?)?);
        }
        Ok(events)
    }

    fn read_snapshots(&self) -> Result<Vec<SnapshotEntry>, LedgerError> {
        let conn = self.connect()?;
        let mut statement = conn.prepare("SELECT entry_json FROM snapshots ORDER BY seq ASC")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(from_json(&self.db_path, &row?)?);
        }
        Ok(snapshots)
    }

    fn read_checkpoints_newest_first(&self) -> Result<Vec<StoredCheckpoint>, LedgerError> {
        let conn = self.connect()?;
        let mut statement =
            conn.prepare("SELECT seq, entry_json FROM checkpoints ORDER BY seq DESC")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (seq, text) = row?;
            let entry = serde_json::from_str::<CheckpointRecord>(&text)
                .map_err(|_| "checkpoint entry is not a valid checkpoint object".to_string());
            entries.push(StoredCheckpoint {
                ordinal: seq as usize,
                entry,
            });
        }
        Ok(entries)
    }
}

fn mirror_event(mirror: &FileTreeBackend, event: &EventRecord) -> Result<(), LedgerError> {
    use std::io::Write;
    let path = &mirror.paths().events;
    let rendered =
        serde_json::to_string(event).map_err(|serialize_error| LedgerError::InvalidDocument {
            path: path.clone(),
            message: format!("failed to serialize journal entry: {serialize_error}"),
        })?;
    let mut file = std::fs::OpenOptions::new()
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

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, LedgerError> {
    serde_json::to_string(value).map_err(|serialize_error| LedgerError::InvalidDocument {
        path: PathBuf::from("state.sqlite3"),
        message: format!("failed to serialize document: {serialize_error}"),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(
    db_path: &Path,
    text: &str,
) -> Result<T, LedgerError> {
    serde_json::from_str(text).map_err(|parse_error| LedgerError::InvalidDocument {
        path: db_path.to_path_buf(),
        message: format!("invalid JSON document in sqlite store: {parse_error}"),
    })
}
