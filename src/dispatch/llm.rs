//! LLM dispatch backend over an OpenAI-compatible chat-completions API.
//!
//! One blocking HTTP call per dispatch; retries are bounded and only fire
//! for transport errors and 5xx responses. Call failures are captured into
//! the error artifact, never raised out of the adapter.

use serde::Deserialize;

use crate::errors::DispatchError;

use super::artifacts::{CallArtifactInput, DispatchArtifactStore};
use super::config::LlmConfig;
use super::{DispatchAction, DispatchAdapter, DispatchCallResult, DispatchRequest};

const SYSTEM_PROMPT: &str = "You are a coding agent executing a single step in an orchestrated \
     pipeline. Return a concise implementation status and next action. Keep output short and \
     actionable.";

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

struct CompletionOutcome {
    content: String,
    model: String,
    finish_reason: String,
    usage: serde_json::Value,
}

/// HTTP dispatch adapter.
pub struct LlmAdapter {
    config: LlmConfig,
    max_retries: u32,
    client: reqwest::blocking::Client,
    artifact_store: DispatchArtifactStore,
}

impl LlmAdapter {
    pub fn new(config: LlmConfig, max_retries: u32, artifact_store: DispatchArtifactStore) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            config,
            max_retries,
            client,
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
        let command = vec![
            "llm".to_string(),
            self.config.base_url.clone(),
            self.config.model.clone(),
            action.as_str().to_string(),
        ];
        let messages = build_messages(action, &request.request, rework_context);

        let (status, parsed_output, error) = if request.dry_run {
            (
                "success".to_string(),
                serde_json::json!({
                    "status": "success",
                    "action": action.as_str(),
                    "execution_mode": "dry_run",
                    "llm_invoked": false,
                    "message": "dry-run dispatch execution",
                }),
                None,
            )
        } else {
            match self.chat_completion(&messages) {
                Ok(outcome) => (
                    "success".to_string(),
                    serde_json::json!({
                        "status": "success",
                        "action": action.as_str(),
                        "execution_mode": "llm_direct",
                        "llm_invoked": true,
                        "message": outcome.content,
                        "model": outcome.model,
                        "finish_reason": outcome.finish_reason,
                        "usage": outcome.usage,
                    }),
                    None,
                ),
                Err(message) => (
                    "error".to_string(),
                    serde_json::json!({
                        "status": "error",
                        "action": action.as_str(),
                        "execution_mode": "llm_direct",
                        "llm_invoked": false,
                        "message": message,
                    }),
                    Some(message),
                ),
            }
        };

        let request_payload = serde_json::json!({
            "task_id": request.task_id,
            "run_id": request.run_id,
            "step_id": request.step_id,
            "action": action.as_str(),
            "messages": messages,
        });
        let raw_stdout = parsed_output
            .get("message")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        let artifacts = self.artifact_store.write_call_artifacts(&CallArtifactInput {
            task_id: &request.task_id,
            run_id: &request.run_id,
            step_id: &request.step_id,
            thread_id: &thread_id,
            action: action.as_str(),
            retry_index: request.retry_index,
            command: &command,
            request_payload: &request_payload,
            status: &status,
            raw_stdout: &raw_stdout,
            raw_stderr: "",
            parsed_output: &parsed_output,
            error: error.as_deref(),
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
            error,
        })
    }

    /// One chat completion with bounded retries on transport errors and
    /// 5xx responses. 4xx responses fail immediately.
    fn chat_completion(&self, messages: &serde_json::Value) -> Result<CompletionOutcome, String> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let mut last_error = String::new();
        for _attempt in 0..=self.max_retries {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send();
            match response {
                Err(transport_error) => {
                    last_error = format!("llm transport error: {transport_error}");
                    continue;
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        last_error = format!("llm endpoint returned {status}");
                        continue;
                    }
                    if !status.is_success() {
                        return Err(format!("llm endpoint returned {status}"));
                    }
                    let parsed: ChatCompletionResponse = response
                        .json()
                        .map_err(|decode_error| format!("llm response decode failed: {decode_error}"))?;
                    let choice = parsed
                        .choices
                        .into_iter()
                        .next()
                        .ok_or_else(|| "llm response contained no choices".to_string())?;
                    let usage = parsed
                        .usage
                        .map(|usage| {
                            serde_json::json!({
                                "prompt_tokens": usage.prompt_tokens,
                                "completion_tokens": usage.completion_tokens,
                                "total_tokens": usage.total_tokens,
                            })
                        })
                        .unwrap_or_else(|| serde_json::json!({}));
                    return Ok(CompletionOutcome {
                        content: choice.message.content.unwrap_or_default(),
                        model: parsed.model,
                        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
                        usage,
                    });
                }
            }
        }
        Err(last_error)
    }
}

impl DispatchAdapter for LlmAdapter {
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

/// Build the prompt from the step request: title, goal, and up to five
/// acceptance criteria, plus failed-attempt context on rework.
fn build_messages(
    action: DispatchAction,
    request: &serde_json::Value,
    rework_context: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut lines = vec![
        format!("Action: {}", action.as_str()),
        format!(
            "Task ID: {}",
            request["task_id"].as_str().unwrap_or("unknown")
        ),
        format!("Run ID: {}", request["run_id"].as_str().unwrap_or("unknown")),
        format!(
            "Step ID: {}",
            request["step_id"].as_str().unwrap_or("unknown")
        ),
        format!(
            "Step Title: {}",
            request["step_title"]
                .as_str()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or("Complete the assigned step")
        ),
    ];
    if let Some(goal) = request["goal"].as_str().filter(|goal| !goal.trim().is_empty()) {
        lines.push(format!("Goal: {goal}"));
    }
    if let Some(criteria) = request["acceptance_criteria"].as_array() {
        let rendered: Vec<String> = criteria
            .iter()
            .filter_map(|item| item.as_str())
            .filter(|item| !item.trim().is_empty())
            .take(5)
            .map(|item| format!("- {item}"))
            .collect();
        if !rendered.is_empty() {
            lines.push("Acceptance Criteria:".to_string());
            lines.extend(rendered);
        }
    }
    lines.push("Return a concise implementation status and next action.".to_string());

    let mut messages = vec![
        serde_json::json!({"role": "system", "content": SYSTEM_PROMPT}),
        serde_json::json!({"role": "user", "content": lines.join("\n")}),
    ];

    if action == DispatchAction::Rework {
        if let Some(context) = rework_context {
            let mut rework_lines = vec!["Previous attempts failed:".to_string()];
            if let Some(failed) = context["failed_criteria"].as_array() {
                for item in failed {
                    let criterion = item["criterion"].as_str().unwrap_or("unknown criterion");
                    let codes = item["reason_codes"]
                        .as_array()
                        .map(|codes| {
                            codes
                                .iter()
                                .filter_map(|code| code.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default();
                    rework_lines.push(format!("- {criterion}: {codes}"));
                }
            }
            if let Some(directives) = context["directives"].as_array() {
                for directive in directives.iter().filter_map(|item| item.as_str()) {
                    rework_lines.push(format!("- {directive}"));
                }
            }
            rework_lines
                .push("Address these failures and provide a corrected implementation.".to_string());
            messages.push(serde_json::json!({
                "role": "user",
                "content": rework_lines.join("\n"),
            }));
        }
    }

    serde_json::Value::Array(messages)
}
