//! Dispatch adapter layer: bounded subprocess/LLM invocations with
//! per-call artifact persistence.
//!
//! Two backends share one capability set — `create`, `resume`, `rework` —
//! selected through a small factory keyed on the backend selector. Call
//! failures are captured into the error artifact and returned as
//! `status = "error"` results; they never propagate as panics or errors
//! out of the runtime.

pub mod artifacts;
pub mod config;
pub mod llm;
pub mod subprocess;

pub use artifacts::{CallArtifactInput, DispatchArtifactStore, DispatchCallArtifacts};
pub use config::{
    resolve_dispatch_backend, DispatchBackendKind, DispatchConfig, LlmConfig,
    ENV_DISPATCH_BACKEND, ENV_DISPATCH_WORKER, ENV_LLM_API_KEY, ENV_LLM_BASE_URL, ENV_LLM_MODEL,
};
pub use llm::LlmAdapter;
pub use subprocess::SubprocessAdapter;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;
use crate::ledger::canonical::sha256_hex;

/// The three dispatch actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAction {
    Create,
    Resume,
    Rework,
}

impl DispatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Resume => "resume",
            Self::Rework => "rework",
        }
    }
}

/// One adapter invocation, normalized.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: String,
    pub run_id: String,
    pub step_id: String,
    /// Caller-supplied thread id; derived when absent so retries converge
    /// on the same thread-space.
    pub thread_id: Option<String>,
    pub retry_index: u32,
    pub request: serde_json::Value,
    pub dry_run: bool,
}

impl DispatchRequest {
    pub fn new(task_id: &str, run_id: &str, step_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            thread_id: None,
            retry_index: 0,
            request: serde_json::json!({}),
            dry_run: false,
        }
    }

    pub fn resolved_thread_id(&self) -> String {
        match &self.thread_id {
            Some(thread_id) => thread_id.clone(),
            None => stable_thread_id(&self.task_id, &self.run_id, &self.step_id),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DispatchError> {
        for (value, name) in [
            (&self.task_id, "task_id"),
            (&self.run_id, "run_id"),
            (&self.step_id, "step_id"),
        ] {
            if value.trim().is_empty() {
                return Err(DispatchError::EmptyField { name });
            }
        }
        if let Some(thread_id) = &self.thread_id {
            if thread_id.trim().is_empty() {
                return Err(DispatchError::EmptyField { name: "thread_id" });
            }
        }
        Ok(())
    }
}

/// Result of one adapter call. `status` is `success` or `error`; errors
/// carry the captured message and always have a written artifact trio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCallResult {
    pub action: DispatchAction,
    pub status: String,
    pub task_id: String,
    pub run_id: String,
    pub step_id: String,
    pub thread_id: String,
    pub retry_index: u32,
    pub command: Vec<String>,
    pub parsed_output: serde_json::Value,
    pub artifacts: DispatchCallArtifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchCallResult {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }

    /// Files the dispatch action reports as changed, when the worker
    /// included them in its structured output.
    pub fn changed_files(&self) -> Option<Vec<String>> {
        self.parsed_output.get("changed_files").map(|value| {
            value
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| entry.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

/// Capability set shared by both backends.
pub trait DispatchAdapter: Send {
    fn create(&self, request: &DispatchRequest) -> Result<DispatchCallResult, DispatchError>;

    fn resume(&self, request: &DispatchRequest) -> Result<DispatchCallResult, DispatchError>;

    fn rework(
        &self,
        request: &DispatchRequest,
        rework_context: &serde_json::Value,
    ) -> Result<DispatchCallResult, DispatchError>;
}

/// Build the configured adapter.
pub fn create_dispatch_adapter(
    config: &DispatchConfig,
    artifact_root: impl AsRef<Path>,
) -> Result<Box<dyn DispatchAdapter>, DispatchError> {
    let store = DispatchArtifactStore::new(artifact_root);
    match config.backend {
        DispatchBackendKind::Subprocess => Ok(Box::new(SubprocessAdapter::new(
            &config.worker_path,
            std::time::Duration::from_secs(config.timeout_seconds),
            store,
        ))),
        DispatchBackendKind::Llm => {
            let llm_config = config
                .llm
                .clone()
                .ok_or_else(|| DispatchError::LlmConfig("llm backend selected without llm configuration".to_string()))?;
            Ok(Box::new(LlmAdapter::new(llm_config, config.max_retries, store)))
        }
    }
}

/// Resolve the adapter straight from the environment, the way the CLI does.
pub fn dispatch_adapter_from_env(
    env: &BTreeMap<String, String>,
    settings: Option<&serde_json::Value>,
    artifact_root: impl AsRef<Path>,
) -> Result<Box<dyn DispatchAdapter>, DispatchError> {
    let config = DispatchConfig::resolve(env, settings)?;
    create_dispatch_adapter(&config, artifact_root)
}

/// Stable thread id so retries for a `(task, run, step)` converge on the
/// same thread-space.
pub fn stable_thread_id(task_id: &str, run_id: &str, step_id: &str) -> String {
    let digest = sha256_hex(format!("{task_id}|{run_id}|{step_id}").as_bytes());
    format!("thread-{}", &digest[..12])
}

/// Parse worker stdout best-effort: JSON object first, then `key=value`
/// lines, else a raw-message form.
pub(crate) fn parse_worker_output(raw_stdout: &str) -> serde_json::Value {
    let text = raw_stdout.trim();
    if text.is_empty() {
        return serde_json::json!({});
    }
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) {
        if parsed.is_object() {
            return parsed;
        }
    }
    let mut key_values = serde_json::Map::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                key_values.insert(
                    key.to_string(),
                    serde_json::Value::String(value.trim().to_string()),
                );
            }
        }
    }
    if !key_values.is_empty() {
        return serde_json::Value::Object(key_values);
    }
    serde_json::json!({"message": text})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_and_prefixed() {
        let first = stable_thread_id("T1", "R1", "S1");
        let second = stable_thread_id("T1", "R1", "S1");
        assert_eq!(first, second);
        assert!(first.starts_with("thread-"));
        assert_eq!(first.len(), "thread-".len() + 12);
        assert_ne!(first, stable_thread_id("T1", "R1", "S2"));
    }

    #[test]
    fn parse_output_prefers_json() {
        let parsed = parse_worker_output("{\"status\": \"success\", \"n\": 3}");
        assert_eq!(parsed["status"], "success");
        assert_eq!(parsed["n"], 3);
    }

    #[test]
    fn parse_output_falls_back_to_key_values() {
        let parsed = parse_worker_output("status=success\nfiles = 3\nnot a pair\n");
        assert_eq!(parsed["status"], "success");
        assert_eq!(parsed["files"], "3");
        assert!(parsed.get("not a pair").is_none());
    }

    #[test]
    fn parse_output_falls_back_to_raw_message() {
        let parsed = parse_worker_output("worker finished cleanly");
        assert_eq!(parsed["message"], "worker finished cleanly");
        assert_eq!(parse_worker_output("   "), serde_json::json!({}));
    }

    #[test]
    fn request_validation_rejects_empty_fields() {
        let mut request = DispatchRequest::new("T1", "R1", "S1");
        assert!(request.validate().is_ok());
        request.step_id = " ".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn changed_files_extracted_from_parsed_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = DispatchArtifactStore::new(dir.path());
        let artifacts = store
            .write_call_artifacts(&CallArtifactInput {
                task_id: "T1",
                run_id: "R1",
                step_id: "S1",
                thread_id: "thread-x",
                action: "create",
                retry_index: 0,
                command: &[],
                request_payload: &serde_json::json!({}),
                status: "success",
                raw_stdout: "",
                raw_stderr: "",
                parsed_output: &serde_json::json!({}),
                error: None,
            })
            .unwrap();
        let result = DispatchCallResult {
            action: DispatchAction::Create,
            status: "success".to_string(),
            task_id: "T1".to_string(),
            run_id: "R1".to_string(),
            step_id: "S1".to_string(),
            thread_id: "thread-x".to_string(),
            retry_index: 0,
            command: vec![],
            parsed_output: serde_json::json!({"changed_files": ["src/a.rs", "src/b.rs"]}),
            artifacts,
            error: None,
        };
        assert_eq!(
            result.changed_files().unwrap(),
            vec!["src/a.rs", "src/b.rs"]
        );
    }
}
