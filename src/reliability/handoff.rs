//! Handoff packages: a durable capture of the minimum state required to
//! resume a run in a fresh process or context.
//!
//! Pre-compact writes the package; session-start verifies it (hash, schema
//! version, task/run identity) and computes a resume plan over the steps
//! still in `{PENDING, FAILED, RUNNING}`. Accepted steps never replay.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::{PipelineState, StepClassification, SCHEMA_VERSION};
use crate::ledger::canonical::canonical_hash;

/// Handoff package or resume-input failures.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff package does not exist at '{0}'")]
    NotFound(PathBuf),

    #[error("failed to read handoff package at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write handoff package at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("handoff package is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("handoff package hash validation failed")]
    HashMismatch,

    #[error("handoff package schema_version must be '1.0.0', found '{0}'")]
    UnsupportedSchema(String),

    #[error("{field} mismatch between ledger and handoff package")]
    PackageMismatch { field: &'static str },

    #[error("{0}")]
    Invalid(String),
}

/// One open acceptance item for a resumable step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAcceptanceItem {
    pub step_id: String,
    pub criterion: String,
}

/// Step-status partition at package time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStepStatus {
    pub accepted: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

/// The persisted handoff package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffPackage {
    pub schema_version: String,
    pub task_id: String,
    pub run_id: String,
    pub current_step: Option<String>,
    pub open_acceptance_items: Vec<OpenAcceptanceItem>,
    pub evidence_paths: Vec<String>,
    pub next_action: String,
    pub resumable_step_ids: Vec<String>,
    pub skipped_step_ids: Vec<String>,
    pub step_status: PackageStepStatus,
    pub created_at: DateTime<Utc>,
    pub package_hash: String,
}

impl HandoffPackage {
    /// Content hash over everything except the hash field itself.
    fn compute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("package_hash");
        }
        canonical_hash(&value)
    }
}

/// Resume plan handed back to the lifecycle runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePlan {
    pub task_id: String,
    pub run_id: String,
    pub resume_step_id: Option<String>,
    pub resumable_step_ids: Vec<String>,
    pub skipped_step_ids: Vec<String>,
    pub open_acceptance_items: Vec<OpenAcceptanceItem>,
    pub next_action: String,
    pub package_path: String,
    pub loaded_at: DateTime<Utc>,
}

/// Persist and restore deterministic context-rotation handoff packages.
pub struct HandoffStore {
    package_path: PathBuf,
}

impl HandoffStore {
    pub fn new(package_path: impl AsRef<Path>) -> Self {
        Self {
            package_path: package_path.as_ref().to_path_buf(),
        }
    }

    /// Default location under the runtime root.
    pub fn at_root(root: impl AsRef<Path>) -> Self {
        Self::new(root.as_ref().join("handoff").join("handoff_package.json"))
    }

    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    pub fn package_exists(&self) -> bool {
        self.package_path.is_file()
    }

    /// Snapshot the ledger state into a package and persist it.
    pub fn write_package(
        &self,
        state: &PipelineState,
        evidence_paths_override: Option<&[String]>,
        include_accepted_steps: bool,
        at: DateTime<Utc>,
    ) -> Result<HandoffPackage, HandoffError> {
        let task_id = required_id(&state.task_id, "task_id")?;
        let run_id = required_id(&state.run_id, "run_id")?;

        let classification = classify(state);
        let resumable = resumable_steps(state, &classification, include_accepted_steps);
        let skipped: Vec<String> = state
            .steps
            .iter()
            .map(|step| step.id.clone())
            .filter(|id| !resumable.contains(id))
            .collect();
        let resume_step_id = pick_resume_step(state.current_step.as_deref(), None, &resumable);
        let open_acceptance_items = collect_open_items(state, &resumable);
        let evidence_paths = match evidence_paths_override {
            Some(paths) => dedupe(paths),
            None => collect_expected_outputs(state, &resumable),
        };

        let mut package = HandoffPackage {
            schema_version: SCHEMA_VERSION.to_string(),
            task_id,
            run_id,
            current_step: resume_step_id.clone(),
            open_acceptance_items,
            evidence_paths,
            next_action: if resume_step_id.is_some() {
                "resume".to_string()
            } else {
                "complete".to_string()
            },
            resumable_step_ids: resumable,
            skipped_step_ids: skipped,
            step_status: classification,
            created_at: at,
            package_hash: String::new(),
        };
        package.package_hash = package.compute_hash();

        if let Some(parent) = self.package_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HandoffError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let rendered = serde_json::to_string_pretty(&package)
            .map_err(|serialize_error| HandoffError::Invalid(serialize_error.to_string()))?;
        std::fs::write(&self.package_path, format!("{rendered}\n")).map_err(|source| {
            HandoffError::WriteFailed {
                path: self.package_path.clone(),
                source,
            }
        })?;
        Ok(package)
    }

    /// Load and fully validate the package, `None` when absent.
    pub fn load_package(&self) -> Result<Option<HandoffPackage>, HandoffError> {
        if !self.package_path.exists() {
            return Ok(None);
        }
        let text =
            std::fs::read_to_string(&self.package_path).map_err(|source| HandoffError::ReadFailed {
                path: self.package_path.clone(),
                source,
            })?;
        let package: HandoffPackage = serde_json::from_str(&text)
            .map_err(|parse_error| HandoffError::InvalidJson(parse_error.to_string()))?;
        if package.schema_version != SCHEMA_VERSION {
            return Err(HandoffError::UnsupportedSchema(package.schema_version));
        }
        if package.package_hash != package.compute_hash() {
            return Err(HandoffError::HashMismatch);
        }
        Ok(Some(package))
    }

    /// Apply the package against the live ledger state: verify identity,
    /// recompute the resume plan, and rewrite the resume markers.
    pub fn apply_package(
        &self,
        state: &mut PipelineState,
        include_accepted_steps: bool,
        at: DateTime<Utc>,
    ) -> Result<ResumePlan, HandoffError> {
        let package = self
            .load_package()?
            .ok_or_else(|| HandoffError::NotFound(self.package_path.clone()))?;

        match state.task_id.as_deref() {
            Some(ledger_task) if ledger_task != package.task_id => {
                return Err(HandoffError::PackageMismatch { field: "task_id" })
            }
            Some(_) => {}
            None => state.task_id = Some(package.task_id.clone()),
        }
        match state.run_id.as_deref() {
            Some(ledger_run) if ledger_run != package.run_id => {
                return Err(HandoffError::PackageMismatch { field: "run_id" })
            }
            Some(_) => {}
            None => state.run_id = Some(package.run_id.clone()),
        }

        let classification = classify(state);
        let mut resumable = resumable_steps(state, &classification, include_accepted_steps);
        let mut skipped: Vec<String> = state
            .steps
            .iter()
            .map(|step| step.id.clone())
            .filter(|id| !resumable.contains(id))
            .collect();

        let mut resume_step_id = pick_resume_step(
            state.current_step.as_deref(),
            package.current_step.as_deref(),
            &resumable,
        );
        if resume_step_id.is_none() && !package.resumable_step_ids.is_empty() {
            // The live ledger has no step contracts (fresh process); fall
            // back to the package's own resume set.
            resume_step_id = package.resumable_step_ids.first().cloned();
            if resumable.is_empty() {
                resumable = package.resumable_step_ids.clone();
                skipped = Vec::new();
            }
        }

        let mut open_items = collect_open_items(state, &resumable);
        if open_items.is_empty() {
            open_items = package.open_acceptance_items.clone();
        }

        let next_action = if resume_step_id.is_some() {
            "resume".to_string()
        } else {
            "complete".to_string()
        };

        state.current_step = resume_step_id.clone();
        state.role_lifecycle.insert(
            "handoff_resume_step".to_string(),
            resume_step_id.clone().unwrap_or_else(|| "none".to_string()),
        );
        state
            .role_lifecycle
            .insert("handoff_next_action".to_string(), next_action.clone());
        state.role_lifecycle.insert(
            "handoff_resumable_steps".to_string(),
            resumable.join(","),
        );
        state
            .role_lifecycle
            .insert("handoff_skipped_steps".to_string(), skipped.join(","));

        Ok(ResumePlan {
            task_id: package.task_id,
            run_id: package.run_id,
            resume_step_id,
            resumable_step_ids: resumable,
            skipped_step_ids: skipped,
            open_acceptance_items: open_items,
            next_action,
            package_path: self.package_path.display().to_string(),
            loaded_at: at,
        })
    }
}

fn classify(state: &PipelineState) -> PackageStepStatus {
    let mut status = PackageStepStatus::default();
    for step in &state.steps {
        match state.classify_step(&step.id) {
            StepClassification::Accepted => status.accepted.push(step.id.clone()),
            StepClassification::Failed => status.failed.push(step.id.clone()),
            StepClassification::Pending => status.pending.push(step.id.clone()),
        }
    }
    status
}

fn resumable_steps(
    state: &PipelineState,
    classification: &PackageStepStatus,
    include_accepted_steps: bool,
) -> Vec<String> {
    if include_accepted_steps {
        return state.steps.iter().map(|step| step.id.clone()).collect();
    }
    state
        .steps
        .iter()
        .map(|step| step.id.clone())
        .filter(|id| !classification.accepted.contains(id))
        .collect()
}

fn pick_resume_step(
    ledger_current: Option<&str>,
    package_current: Option<&str>,
    resumable: &[String],
) -> Option<String> {
    if let Some(current) = ledger_current {
        if resumable.iter().any(|id| id == current) {
            return Some(current.to_string());
        }
    }
    if let Some(current) = package_current {
        if resumable.iter().any(|id| id == current) {
            return Some(current.to_string());
        }
    }
    resumable.first().cloned()
}

fn collect_open_items(state: &PipelineState, resumable: &[String]) -> Vec<OpenAcceptanceItem> {
    let mut items = Vec::new();
    for step in &state.steps {
        if !resumable.iter().any(|id| id == &step.id) {
            continue;
        }
        for criterion in &step.acceptance_criteria {
            let criterion = criterion.trim();
            if criterion.is_empty() {
                continue;
            }
            items.push(OpenAcceptanceItem {
                step_id: step.id.clone(),
                criterion: criterion.to_string(),
            });
        }
    }
    items
}

fn collect_expected_outputs(state: &PipelineState, resumable: &[String]) -> Vec<String> {
    let mut outputs = Vec::new();
    for step in &state.steps {
        if !resumable.iter().any(|id| id == &step.id) {
            continue;
        }
        for output in &step.expected_outputs {
            let output = output.trim();
            if !output.is_empty() && !outputs.iter().any(|existing| existing == output) {
                outputs.push(output.to_string());
            }
        }
    }
    outputs
}

fn dedupe(values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|existing| existing == value) {
            out.push(value.to_string());
        }
    }
    out
}

fn required_id(value: &Option<String>, field: &'static str) -> Result<String, HandoffError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HandoffError::Invalid(format!("{field} must be set before handoff")))
}
