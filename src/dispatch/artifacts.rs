//! Per-call dispatch artifact persistence.
//!
//! Every adapter call writes three artifacts — request, output, error — at
//! a deterministic path:
//! `<root>/<task>/<run>/<step>/<thread>/<action>/call-<nnn>/{request,output,error}.json`.
//! The error artifact is an empty-error record on success so the trio is
//! always complete.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// Paths of one call's artifact trio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCallArtifacts {
    pub request_path: PathBuf,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
}

/// Everything the store needs to persist one call.
#[derive(Debug, Clone)]
pub struct CallArtifactInput<'a> {
    pub task_id: &'a str,
    pub run_id: &'a str,
    pub step_id: &'a str,
    pub thread_id: &'a str,
    pub action: &'a str,
    pub retry_index: u32,
    pub command: &'a [String],
    pub request_payload: &'a serde_json::Value,
    pub status: &'a str,
    pub raw_stdout: &'a str,
    pub raw_stderr: &'a str,
    pub parsed_output: &'a serde_json::Value,
    pub error: Option<&'a str>,
}

/// Persists the request/output/error trio for every dispatch call.
pub struct DispatchArtifactStore {
    root: PathBuf,
}

impl DispatchArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one call, deterministic in its inputs.
    pub fn call_dir(
        &self,
        task_id: &str,
        run_id: &str,
        step_id: &str,
        thread_id: &str,
        action: &str,
        retry_index: u32,
    ) -> PathBuf {
        self.root
            .join(task_id)
            .join(run_id)
            .join(step_id)
            .join(thread_id)
            .join(action)
            .join(format!("call-{retry_index:03}"))
    }

    pub fn write_call_artifacts(
        &self,
        input: &CallArtifactInput<'_>,
    ) -> Result<DispatchCallArtifacts, DispatchError> {
        let call_dir = self.call_dir(
            input.task_id,
            input.run_id,
            input.step_id,
            input.thread_id,
            input.action,
            input.retry_index,
        );
        fs::create_dir_all(&call_dir).map_err(|source| DispatchError::ArtifactWriteFailed {
            path: call_dir.clone(),
            source,
        })?;

        let artifacts = DispatchCallArtifacts {
            request_path: call_dir.join("request.json"),
            output_path: call_dir.join("output.json"),
            error_path: call_dir.join("error.json"),
        };

        let correlation = serde_json::json!({
            "task_id": input.task_id,
            "run_id": input.run_id,
            "step_id": input.step_id,
            "thread_id": input.thread_id,
            "action": input.action,
            "retry_index": input.retry_index,
        });

        let mut request_doc = correlation.clone();
        merge(&mut request_doc, serde_json::json!({
            "command": input.command,
            "request": input.request_payload,
        }));

        let mut output_doc = correlation.clone();
        merge(&mut output_doc, serde_json::json!({
            "status": input.status,
            "raw_stdout": input.raw_stdout,
            "parsed_output": input.parsed_output,
        }));

        let mut error_doc = correlation;
        merge(&mut error_doc, serde_json::json!({
            "error": input.error,
            "raw_stderr": input.raw_stderr,
        }));

        write_json(&artifacts.request_path, &request_doc)?;
        write_json(&artifacts.output_path, &output_doc)?;
        write_json(&artifacts.error_path, &error_doc)?;
        Ok(artifacts)
    }
}

fn merge(target: &mut serde_json::Value, extra: serde_json::Value) {
    if let (Some(target_map), serde_json::Value::Object(extra_map)) =
        (target.as_object_mut(), extra)
    {
        target_map.extend(extra_map);
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), DispatchError> {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
    fs::write(path, format!("{rendered}\n")).map_err(|source| {
        DispatchError::ArtifactWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_complete_trio_at_deterministic_path() {
        let dir = tempdir().unwrap();
        let store = DispatchArtifactStore::new(dir.path());
        let request = json!({"goal": "demo"});
        let output = json!({"status": "success"});
        let artifacts = store
            .write_call_artifacts(&CallArtifactInput {
                task_id: "T1",
                run_id: "R1",
                step_id: "S1",
                thread_id: "thread-abc",
                action: "create",
                retry_index: 0,
                command: &["worker".to_string(), "create".to_string()],
                request_payload: &request,
                status: "success",
                raw_stdout: "{\"status\":\"success\"}",
                raw_stderr: "",
                parsed_output: &output,
                error: None,
            })
            .unwrap();

        let expected_dir = dir
            .path()
            .join("T1/R1/S1/thread-abc/create/call-000");
        assert_eq!(artifacts.request_path, expected_dir.join("request.json"));
        assert!(artifacts.request_path.is_file());
        assert!(artifacts.output_path.is_file());
        assert!(artifacts.error_path.is_file());

        let error_doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&artifacts.error_path).unwrap())
                .unwrap();
        assert!(error_doc["error"].is_null());
        assert_eq!(error_doc["task_id"], "T1");
    }

    #[test]
    fn retry_indexes_get_distinct_call_dirs() {
        let dir = tempdir().unwrap();
        let store = DispatchArtifactStore::new(dir.path());
        let first = store.call_dir("T1", "R1", "S1", "thread-abc", "rework", 0);
        let second = store.call_dir("T1", "R1", "S1", "thread-abc", "rework", 1);
        assert_ne!(first, second);
        assert!(second.ends_with("rework/call-001"));
    }

    #[test]
    fn error_artifact_is_populated_on_failure() {
        let dir = tempdir().unwrap();
        let store = DispatchArtifactStore::new(dir.path());
        let request = json!({});
        let output = json!({"status": "error"});
        let artifacts = store
            .write_call_artifacts(&CallArtifactInput {
                task_id: "T1",
                run_id: "R1",
                step_id: "S1",
                thread_id: "thread-abc",
                action: "create",
                retry_index: 0,
                command: &[],
                request_payload: &request,
                status: "error",
                raw_stdout: "",
                raw_stderr: "boom",
                parsed_output: &output,
                error: Some("worker exited with status 3"),
            })
            .unwrap();
        let error_doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&artifacts.error_path).unwrap())
                .unwrap();
        assert_eq!(error_doc["error"], "worker exited with status 3");
        assert_eq!(error_doc["raw_stderr"], "boom");
    }
}
