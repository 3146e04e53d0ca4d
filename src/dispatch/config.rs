//! Dispatch configuration: explicit records for every recognized option.
//!
//! Backend selection is internal (environment variable or the runtime
//! settings file); there is no public CLI argument for it.

use std::collections::BTreeMap;

use crate::errors::DispatchError;

pub const ENV_DISPATCH_BACKEND: &str = "DAOKIT_DISPATCH_BACKEND";
pub const ENV_DISPATCH_WORKER: &str = "DAOKIT_DISPATCH_WORKER";

pub const ENV_LLM_API_KEY: &str = "DAOKIT_LLM_API_KEY";
pub const ENV_LLM_BASE_URL: &str = "DAOKIT_LLM_BASE_URL";
pub const ENV_LLM_MODEL: &str = "DAOKIT_LLM_MODEL";
pub const ENV_LLM_MAX_TOKENS: &str = "DAOKIT_LLM_MAX_TOKENS";
pub const ENV_LLM_TEMPERATURE: &str = "DAOKIT_LLM_TEMPERATURE";
pub const ENV_LLM_TIMEOUT_SECONDS: &str = "DAOKIT_LLM_TIMEOUT_SECONDS";

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f64 = 0.0;
const DEFAULT_LLM_TIMEOUT_SECONDS: u64 = 60;

/// Which backend serves dispatch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchBackendKind {
    #[default]
    Subprocess,
    Llm,
}

/// Resolve the dispatch backend from an explicit override, the environment,
/// then the runtime settings file (`dispatch.backend` or
/// `runtime.dispatch_backend`). Defaults to the subprocess backend.
pub fn resolve_dispatch_backend(
    explicit: Option<&str>,
    env: &BTreeMap<String, String>,
    settings: Option<&serde_json::Value>,
) -> Result<DispatchBackendKind, DispatchError> {
    let source = explicit
        .map(str::to_string)
        .or_else(|| env.get(ENV_DISPATCH_BACKEND).cloned())
        .or_else(|| {
            settings.and_then(|value| {
                nested_string(value, &["dispatch", "backend"])
                    .or_else(|| nested_string(value, &["runtime", "dispatch_backend"]))
            })
        });
    let normalized = match &source {
        None => return Ok(DispatchBackendKind::Subprocess),
        Some(text) => text.trim().to_ascii_lowercase(),
    };
    match normalized.as_str() {
        "subprocess" | "worker" | "shim" => Ok(DispatchBackendKind::Subprocess),
        "llm" => Ok(DispatchBackendKind::Llm),
        _ => Err(DispatchError::UnsupportedBackend { value: normalized }),
    }
}

/// LLM endpoint configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_seconds: u64,
}

impl LlmConfig {
    /// Resolve from the environment. The api key is mandatory; everything
    /// else falls back to defaults.
    pub fn from_env(env: &BTreeMap<String, String>) -> Result<Self, DispatchError> {
        let api_key = env
            .get(ENV_LLM_API_KEY)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                DispatchError::LlmConfig(format!(
                    "{ENV_LLM_API_KEY} is required to configure the LLM dispatch backend"
                ))
            })?;
        Ok(Self {
            api_key,
            base_url: env_string(env, ENV_LLM_BASE_URL, DEFAULT_BASE_URL),
            model: env_string(env, ENV_LLM_MODEL, DEFAULT_MODEL),
            max_tokens: env_parsed(env, ENV_LLM_MAX_TOKENS, DEFAULT_MAX_TOKENS)?,
            temperature: env_parsed(env, ENV_LLM_TEMPERATURE, DEFAULT_TEMPERATURE)?,
            timeout_seconds: env_parsed(env, ENV_LLM_TIMEOUT_SECONDS, DEFAULT_LLM_TIMEOUT_SECONDS)?,
        })
    }
}

/// Full dispatch configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub backend: DispatchBackendKind,
    /// Worker binary for the subprocess backend.
    pub worker_path: String,
    /// Overall per-call timeout for the subprocess backend.
    pub timeout_seconds: u64,
    /// Bounded retries for the LLM backend (transport/5xx only).
    pub max_retries: u32,
    /// Present only when the LLM backend is selected.
    pub llm: Option<LlmConfig>,
}

impl DispatchConfig {
    /// Resolve the complete configuration from the environment and the
    /// optional runtime settings document.
    pub fn resolve(
        env: &BTreeMap<String, String>,
        settings: Option<&serde_json::Value>,
    ) -> Result<Self, DispatchError> {
        let backend = resolve_dispatch_backend(None, env, settings)?;
        let llm = match backend {
            DispatchBackendKind::Llm => Some(LlmConfig::from_env(env)?),
            DispatchBackendKind::Subprocess => None,
        };
        Ok(Self {
            backend,
            worker_path: env_string(env, ENV_DISPATCH_WORKER, "daokit-worker"),
            timeout_seconds: 120,
            max_retries: 2,
            llm,
        })
    }
}

fn env_string(env: &BTreeMap<String, String>, key: &str, default: &str) -> String {
    env.get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(
    env: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, DispatchError> {
    match env.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DispatchError::LlmConfig(format!("{key} has an invalid value: '{raw}'"))),
    }
}

fn nested_string(value: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut node = value;
    for token in path {
        node = node.get(token)?;
    }
    node.as_str().map(str::to_string)
}
