//! Typed error hierarchy for the DAOKit engine.
//!
//! Three top-level enums cover the cross-cutting subsystems:
//! - `LedgerError` — persisted-state read/write failures (fatal to a run)
//! - `LifecycleError` — transition-guard and runtime failures
//! - `DispatchError` — adapter invocation failures
//!
//! Subsystems that own a richer failure vocabulary (planner, acceptance,
//! leases, handoff, hooks) define their own error types next to their code.

use thiserror::Error;

/// Errors from the ledger and its backends. Ledger write failures are fatal
/// to the current run and surface as `E_RUN_FAILED` at the CLI boundary.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {message}")]
    InvalidDocument {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("sqlite backend error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(
        "unsupported state backend '{value}'. Supported values: filesystem, sqlite. \
         Action: set DAOKIT_STATE_BACKEND or state/runtime_settings.json to a supported value."
    )]
    UnsupportedBackend { value: String },

    #[error("checkpoint resume failed: {0}")]
    CheckpointResume(String),
}

/// Errors from the lifecycle runtime.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{message}")]
    IllegalTransition {
        message: String,
        diagnostics: serde_json::Value,
    },

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("run interrupted at node boundary")]
    Interrupted,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl LifecycleError {
    /// Structured diagnostics for transition-guard failures, empty object
    /// otherwise.
    pub fn diagnostics(&self) -> serde_json::Value {
        match self {
            Self::IllegalTransition { diagnostics, .. } => diagnostics.clone(),
            _ => serde_json::json!({}),
        }
    }
}

/// Errors from the dispatch adapter layer. These are captured into per-call
/// error artifacts and surfaced through the verify node; only input
/// normalization problems propagate as errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{name} must be a non-empty string")]
    EmptyField { name: &'static str },

    #[error("failed to spawn dispatch worker '{worker}': {source}")]
    SpawnFailed {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write dispatch artifact at {path}: {source}")]
    ArtifactWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "unsupported dispatch backend '{value}'. Supported values: subprocess, llm. \
         Action: set DAOKIT_DISPATCH_BACKEND to a supported value."
    )]
    UnsupportedBackend { value: String },

    #[error("llm configuration invalid: {0}")]
    LlmConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_error_carries_path() {
        let err = LedgerError::ReadFailed {
            path: "state/pipeline_state.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("pipeline_state.json"));
    }

    #[test]
    fn illegal_transition_exposes_diagnostics() {
        let err = LifecycleError::IllegalTransition {
            message: "bad edge".to_string(),
            diagnostics: serde_json::json!({"trigger": "verify"}),
        };
        assert_eq!(err.diagnostics()["trigger"], "verify");
        assert_eq!(
            LifecycleError::Interrupted.diagnostics(),
            serde_json::json!({})
        );
    }

    #[test]
    fn dispatch_error_messages_are_actionable() {
        let err = DispatchError::UnsupportedBackend {
            value: "carrier-pigeon".to_string(),
        };
        assert!(err.to_string().contains("DAOKIT_DISPATCH_BACKEND"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&LedgerError::CheckpointResume("x".into()));
        assert_std_error(&LifecycleError::Interrupted);
        assert_std_error(&DispatchError::EmptyField { name: "task_id" });
    }
}
