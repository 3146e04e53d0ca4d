//! Subprocess dispatch backend.
//!
//! Spawns a bounded worker process per call: JSON payload on stdin, stdout
//! and stderr drained on dedicated reader threads (never blocking on a
//! single pipe), an overall deadline enforced with `wait-timeout`, and exit
//! classification into success / retryable / fatal. Every call writes the
//! artifact trio whether or not the worker succeeded.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::errors::DispatchError;

use super::artifacts::{CallArtifactInput, DispatchArtifactStore};
use super::{parse_worker_output, DispatchAction, DispatchAdapter, DispatchCallResult, DispatchRequest};

/// How a worker exit is classified for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Timeout or signal kill; the verify node may route to rework.
    Retryable,
    Fatal,
}

struct WorkerOutcome {
    stdout: String,
    stderr: String,
    exit_class: ExitClass,
    error: Option<String>,
}

/// Worker-shim dispatch adapter with mandatory artifact capture.
pub struct SubprocessAdapter {
    worker_path: String,
    timeout: Duration,
    artifact_store: DispatchArtifactStore,
}

impl SubprocessAdapter {
    pub fn new(
        worker_path: impl Into<String>,
        timeout: Duration,
        artifact_store: DispatchArtifactStore,
    ) -> Self {
        Self {
            worker_path: worker_path.into(),
            timeout,
            artifact_store,
        }
    }

    fn dispatch(
        &self,
        action: DispatchAction,
        request: &DispatchRequest,
        rework_context: Option<&serde_json::Value>,
    ) -> Result<DispatchCallResult, DispatchError> {
        request.validate()?;
        let thread_id = request.resolved_thread_id();
        let command = self.build_command(action, request, &thread_id);

        let mut payload = serde_json::json!({
            "action": action.as_str(),
            "task_id": request.task_id,
            "run_id": request.run_id,
            "step_id": request.step_id,
            "thread_id": thread_id,
            "retry_index": request.retry_index,
            "request": request.request,
        });
        if let Some(context) = rework_context {
            payload["rework_context"] = context.clone();
        }

        let outcome = if request.dry_run {
            WorkerOutcome {
                stdout: serde_json::json!({
                    "status": "success",
                    "action": action.as_str(),
                    "execution_mode": "dry_run",
                })
                .to_string(),
                stderr: String::new(),
                exit_class: ExitClass::Success,
                error: None,
            }
        } else {
            self.run_worker(&command, &payload.to_string())?
        };

        let parsed_output = parse_worker_output(&outcome.stdout);
        let mut status = match outcome.exit_class {
            ExitClass::Success => "success".to_string(),
            ExitClass::Retryable | ExitClass::Fatal => "error".to_string(),
        };
        if outcome.exit_class == ExitClass::Success {
            if let Some(reported) = parsed_output.get("status").and_then(|value| value.as_str()) {
                if !reported.trim().is_empty() {
                    status = reported.trim().to_string();
                }
            }
        }

        let artifacts = self.artifact_store.write_call_artifacts(&CallArtifactInput {
            task_id: &request.task_id,
            run_id: &request.run_id,
            step_id: &request.step_id,
            thread_id: &thread_id,
            action: action.as_str(),
            retry_index: request.retry_index,
            command: &command,
            request_payload: &payload,
            status: &status,
            raw_stdout: &outcome.stdout,
            raw_stderr: &outcome.stderr,
            parsed_output: &parsed_output,
            error: outcome.error.as_deref(),
        })?;

        Ok(DispatchCallResult {
            action,
            status,
            task_id: request.task_id.clone(),
            run_id: request.run_id.clone(),
            step_id: request.step_id.clone(),
            thread_id,
            retry_index: request.retry_index,
            command,
            parsed_output,
            artifacts,
            error: outcome.error,
        })
    }

    fn build_command(
        &self,
        action: DispatchAction,
        request: &DispatchRequest,
        thread_id: &str,
    ) -> Vec<String> {
        vec![
            self.worker_path.clone(),
            action.as_str().to_string(),
            "--task-id".to_string(),
            request.task_id.clone(),
            "--run-id".to_string(),
            request.run_id.clone(),
            "--step-id".to_string(),
            request.step_id.clone(),
            "--thread-id".to_string(),
            thread_id.to_string(),
        ]
    }

    fn run_worker(&self, command: &[String], payload: &str) -> Result<WorkerOutcome, DispatchError> {
        let spawn_result = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(source) => {
                // A missing worker binary is a call failure, not a runtime
                // crash: it surfaces through the error artifact.
                return Ok(WorkerOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_class: ExitClass::Fatal,
                    error: Some(format!(
                        "failed to spawn dispatch worker '{}': {source}",
                        command[0]
                    )),
                });
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // Best effort: a worker that exits before reading stdin still
            // gets classified by its exit status.
            let _ = stdin.write_all(payload.as_bytes());
        }

        // One dedicated reader per pipe so a worker filling either buffer
        // cannot deadlock the wait.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain(stdout_pipe));
        let stderr_reader = thread::spawn(move || drain(stderr_pipe));

        let (exit_class, error) = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) if status.success() => (ExitClass::Success, None),
            Ok(Some(status)) => match status.code() {
                Some(code) => (
                    ExitClass::Fatal,
                    Some(format!("worker exited with status {code}")),
                ),
                None => (
                    ExitClass::Retryable,
                    Some("worker terminated by signal".to_string()),
                ),
            },
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                (
                    ExitClass::Retryable,
                    Some(format!(
                        "worker timed out after {} seconds",
                        self.timeout.as_secs()
                    )),
                )
            }
            Err(source) => (
                ExitClass::Fatal,
                Some(format!("failed to wait for worker: {source}")),
            ),
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok(WorkerOutcome {
            stdout,
            stderr,
            exit_class,
            error,
        })
    }
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer);
    }
    buffer
}

impl DispatchAdapter for SubprocessAdapter {
    fn create(&self, request: &DispatchRequest) -> Result<DispatchCallResult, DispatchError> {
        self.dispatch(DispatchAction::Create, request, None)
    }

    fn resume(&self, request: &DispatchRequest) -> Result<DispatchCallResult, DispatchError> {
        self.dispatch(DispatchAction::Resume, request, None)
    }

    fn rework(
        &self,
        request: &DispatchRequest,
        rework_context: &serde_json::Value,
    ) -> Result<DispatchCallResult, DispatchError> {
        self.dispatch(DispatchAction::Rework, request, Some(rework_context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_worker(dir: &Path, name: &str, content: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path.to_string_lossy().to_string()
    }

    fn adapter(worker: &str, artifacts: &Path, timeout: Duration) -> SubprocessAdapter {
        SubprocessAdapter::new(worker, timeout, DispatchArtifactStore::new(artifacts))
    }

    #[test]
    fn successful_worker_parses_json_stdout() {
        let dir = tempdir().unwrap();
        let worker = write_worker(
            dir.path(),
            "worker.sh",
            "#!/bin/sh\ncat > /dev/null\necho '{\"status\": \"success\", \"note\": \"done\"}'\n",
        );
        let adapter = adapter(&worker, dir.path(), Duration::from_secs(5));
        let result = adapter
            .create(&DispatchRequest::new("T1", "R1", "S1"))
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.parsed_output["note"], "done");
        assert!(result.error.is_none());
        assert!(result.artifacts.output_path.is_file());
    }

    #[test]
    fn failing_worker_is_captured_not_thrown() {
        let dir = tempdir().unwrap();
        let worker = write_worker(
            dir.path(),
            "worker.sh",
            "#!/bin/sh\ncat > /dev/null\necho 'stderr detail' >&2\nexit 3\n",
        );
        let adapter = adapter(&worker, dir.path(), Duration::from_secs(5));
        let result = adapter
            .create(&DispatchRequest::new("T1", "R1", "S1"))
            .unwrap();
        assert!(!result.succeeded());
        assert_eq!(result.error.as_deref(), Some("worker exited with status 3"));
        let error_doc: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&result.artifacts.error_path).unwrap(),
        )
        .unwrap();
        assert_eq!(error_doc["raw_stderr"], "stderr detail\n");
    }

    #[test]
    fn missing_worker_binary_is_a_call_failure() {
        let dir = tempdir().unwrap();
        let adapter = adapter(
            "/nonexistent/daokit-worker",
            dir.path(),
            Duration::from_secs(5),
        );
        let result = adapter
            .create(&DispatchRequest::new("T1", "R1", "S1"))
            .unwrap();
        assert!(!result.succeeded());
        assert!(result.error.unwrap().contains("failed to spawn"));
    }

    #[test]
    fn timeout_kills_worker_and_reports_retryable_error() {
        let dir = tempdir().unwrap();
        let worker = write_worker(
            dir.path(),
            "worker.sh",
            "#!/bin/sh\ncat > /dev/null\nsleep 10\n",
        );
        let adapter = adapter(&worker, dir.path(), Duration::from_millis(200));
        let result = adapter
            .create(&DispatchRequest::new("T1", "R1", "S1"))
            .unwrap();
        assert!(!result.succeeded());
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn key_value_stdout_is_parsed() {
        let dir = tempdir().unwrap();
        let worker = write_worker(
            dir.path(),
            "worker.sh",
            "#!/bin/sh\ncat > /dev/null\necho 'status=success'\necho 'files_changed=2'\n",
        );
        let adapter = adapter(&worker, dir.path(), Duration::from_secs(5));
        let result = adapter
            .create(&DispatchRequest::new("T1", "R1", "S1"))
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.parsed_output["files_changed"], "2");
    }

    #[test]
    fn rework_passes_context_on_stdin() {
        let dir = tempdir().unwrap();
        // The worker echoes back whether the payload carried rework context.
        let worker = write_worker(
            dir.path(),
            "worker.sh",
            "#!/bin/sh\nif grep -q rework_context; then echo '{\"status\":\"success\",\"saw_context\":true}'; else echo '{\"status\":\"success\",\"saw_context\":false}'; fi\n",
        );
        let adapter = adapter(&worker, dir.path(), Duration::from_secs(5));
        let result = adapter
            .rework(
                &DispatchRequest::new("T1", "R1", "S1"),
                &serde_json::json!({"failed_criteria": ["AC-001"]}),
            )
            .unwrap();
        assert_eq!(result.parsed_output["saw_context"], true);
        assert_eq!(result.action, DispatchAction::Rework);
    }

    #[test]
    fn dry_run_skips_the_worker() {
        let dir = tempdir().unwrap();
        let adapter = adapter("/nonexistent/worker", dir.path(), Duration::from_secs(5));
        let mut request = DispatchRequest::new("T1", "R1", "S1");
        request.dry_run = true;
        let result = adapter.create(&request).unwrap();
        assert!(result.succeeded());
        assert_eq!(result.parsed_output["execution_mode"], "dry_run");
    }
}
