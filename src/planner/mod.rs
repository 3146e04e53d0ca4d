//! Plan compiler: goal + constraints in, deterministic validated step DAG out.
//!
//! For identical canonical input the compiler produces byte-identical step
//! contracts and derived ids on every run. All structural rejections carry
//! stable diagnostics; cycle detection is iterative (Kahn) with a sorted
//! ready queue so the blocked set is reported deterministically.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::StepContract;
use crate::ledger::canonical::canonical_hash;

/// Structured compile rejections. Each variant names the offending step or
/// entry so the plan node can surface an exact diagnostic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("{path} must be a non-empty string")]
    EmptyField { path: String },

    #[error("{path} must not contain duplicate entries")]
    DuplicateEntry { path: String },

    #[error("{path} must contain at least 1 entry")]
    EmptyList { path: String },

    #[error("steps must be a non-empty list")]
    NoSteps,

    #[error("duplicate step id '{id}'")]
    DuplicateStepId { id: String },

    #[error(
        "expected output conflict across multiple steps: \
         {first_step}:{first_output} vs {second_step}:{second_output}"
    )]
    OutputConflict {
        first_step: String,
        first_output: String,
        second_step: String,
        second_output: String,
    },

    #[error("step '{id}' cannot depend on itself")]
    SelfDependency { id: String },

    #[error("step '{id}' depends on unknown step '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    #[error("dependency cycle detected: {blocked}")]
    CycleDetected { blocked: String },
}

/// One pre-authored step, before normalization. Missing identity fields
/// get deterministic defaults (`S<n>`, `Step <n>`, `implementation`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub goal: String,
    pub actions: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_scope: Option<Vec<String>>,
    #[serde(default)]
    pub require_command_evidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_policy: Option<serde_json::Value>,
}

/// Compiler input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanInput {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Dependencies satisfied outside this plan (other tasks, releases).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_dependencies: Vec<String>,
    pub steps: Vec<StepInput>,
}

/// Canonical compiled plan with stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPlan {
    pub task_id: String,
    pub run_id: String,
    pub goal: String,
    pub steps: Vec<StepContract>,
}

impl CompiledPlan {
    /// Dispatch-ready payload shape: steps plus an id->index map.
    pub fn to_dispatch_payload(&self) -> serde_json::Value {
        let step_index: BTreeMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.id.as_str(), index))
            .collect();
        serde_json::json!({
            "task_id": self.task_id,
            "run_id": self.run_id,
            "goal": self.goal,
            "steps": self.steps,
            "step_index": step_index,
        })
    }
}

/// Compile and validate a plan.
pub fn compile_plan(input: &PlanInput) -> Result<CompiledPlan, PlanError> {
    let goal = expect_non_empty(&input.goal, "goal")?;
    if input.steps.is_empty() {
        return Err(PlanError::NoSteps);
    }

    let steps: Vec<StepContract> = input
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| normalize_step(step, index))
        .collect::<Result<_, _>>()?;

    let external: BTreeSet<String> = input
        .external_dependencies
        .iter()
        .enumerate()
        .map(|(index, dep)| expect_non_empty(dep, &format!("external_dependencies[{index}]")))
        .collect::<Result<_, _>>()?;

    assert_unique_step_ids(&steps)?;
    assert_no_conflicting_outputs(&steps)?;
    assert_no_dependency_contradictions(&steps, &external)?;

    let task_id = match &input.task_id {
        Some(provided) => expect_non_empty(provided, "task_id")?,
        None => derive_task_id(&goal, &steps),
    };
    let run_id = match &input.run_id {
        Some(provided) => expect_non_empty(provided, "run_id")?,
        None => derive_run_id(&task_id, &goal, &steps),
    };

    Ok(CompiledPlan {
        task_id,
        run_id,
        goal,
        steps,
    })
}

fn normalize_step(step: &StepInput, index: usize) -> Result<StepContract, PlanError> {
    let path = |field: &str| format!("steps[{index}].{field}");

    let id = match &step.id {
        Some(id) => expect_non_empty(id, &path("id"))?,
        None => format!("S{}", index + 1),
    };
    let title = match &step.title {
        Some(title) => expect_non_empty(title, &path("title"))?,
        None => format!("Step {}", index + 1),
    };
    let category = match &step.category {
        Some(category) => expect_non_empty(category, &path("category"))?,
        None => "implementation".to_string(),
    };
    Ok(StepContract {
        id,
        title,
        category,
        goal: expect_non_empty(&step.goal, &path("goal"))?,
        actions: expect_string_list(&step.actions, &path("actions"), false)?,
        acceptance_criteria: expect_string_list(
            &step.acceptance_criteria,
            &path("acceptance_criteria"),
            false,
        )?,
        expected_outputs: expect_string_list(&step.expected_outputs, &path("expected_outputs"), false)?,
        dependencies: expect_string_list(&step.dependencies, &path("dependencies"), true)?,
        allowed_scope: step.allowed_scope.clone(),
        require_command_evidence: step.require_command_evidence,
        retrieval_policy: step.retrieval_policy.clone(),
    })
}

fn assert_unique_step_ids(steps: &[StepContract]) -> Result<(), PlanError> {
    let mut seen = BTreeSet::new();
    for step in steps {
        if !seen.insert(step.id.clone()) {
            return Err(PlanError::DuplicateStepId {
                id: step.id.clone(),
            });
        }
    }
    Ok(())
}

fn assert_no_conflicting_outputs(steps: &[StepContract]) -> Result<(), PlanError> {
    let mut owners: BTreeMap<String, (String, String)> = BTreeMap::new();
    for step in steps {
        for output in &step.expected_outputs {
            let key = normalize_output_key(output);
            if let Some((first_step, first_output)) = owners.get(&key) {
                return Err(PlanError::OutputConflict {
                    first_step: first_step.clone(),
                    first_output: first_output.clone(),
                    second_step: step.id.clone(),
                    second_output: output.clone(),
                });
            }
            owners.insert(key, (step.id.clone(), output.clone()));
        }
    }
    Ok(())
}

fn assert_no_dependency_contradictions(
    steps: &[StepContract],
    external: &BTreeSet<String>,
) -> Result<(), PlanError> {
    let step_ids: BTreeSet<&str> = steps.iter().map(|step| step.id.as_str()).collect();
    let mut internal_deps: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in steps {
        for dependency in &step.dependencies {
            if dependency == &step.id {
                return Err(PlanError::SelfDependency {
                    id: step.id.clone(),
                });
            }
            if !step_ids.contains(dependency.as_str()) && !external.contains(dependency) {
                return Err(PlanError::UnknownDependency {
                    id: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        internal_deps.insert(
            step.id.as_str(),
            step.dependencies
                .iter()
                .filter(|dep| step_ids.contains(dep.as_str()))
                .map(String::as_str)
                .collect(),
        );
    }

    // Kahn's algorithm with a sorted ready queue keeps processing order and
    // the reported blocked set deterministic.
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    for (step_id, dependencies) in &internal_deps {
        in_degree.insert(step_id, dependencies.len());
        for dependency in dependencies {
            dependents.entry(dependency).or_default().push(step_id);
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|&(_, degree)| *degree == 0)
        .map(|(step_id, _)| *step_id)
        .collect();
    ready.sort_unstable();

    let mut processed = 0;
    while let Some(current) = ready.first().copied() {
        ready.remove(0);
        processed += 1;
        if let Some(children) = dependents.get(current) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(child);
                    }
                }
            }
        }
        ready.sort_unstable();
    }

    if processed != steps.len() {
        let blocked: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, degree)| *degree > 0)
            .map(|(step_id, _)| *step_id)
            .collect();
        return Err(PlanError::CycleDetected {
            blocked: blocked.join(", "),
        });
    }
    Ok(())
}

fn derive_task_id(goal: &str, steps: &[StepContract]) -> String {
    let digest = stable_digest(&serde_json::json!({"goal": goal, "steps": steps}));
    format!("TASK-{}", &digest[..12])
}

fn derive_run_id(task_id: &str, goal: &str, steps: &[StepContract]) -> String {
    let digest = stable_digest(&serde_json::json!({
        "task_id": task_id,
        "goal": goal,
        "steps": steps,
    }));
    format!("{task_id}_{}", &digest[12..24])
}

fn stable_digest(value: &serde_json::Value) -> String {
    canonical_hash(value).to_ascii_uppercase()
}

/// Collapse output paths so aliases like `a/./b` and `a\b` land on one key.
fn normalize_output_key(value: &str) -> String {
    let replaced = value.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in replaced.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if matches!(parts.last(), Some(&"..")) || parts.is_empty() {
                    parts.push("..");
                } else {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn expect_non_empty(value: &str, path: &str) -> Result<String, PlanError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(PlanError::EmptyField {
            path: path.to_string(),
        });
    }
    Ok(normalized.to_string())
}

fn expect_string_list(
    values: &[String],
    path: &str,
    allow_empty: bool,
) -> Result<Vec<String>, PlanError> {
    let mut normalized = Vec::with_capacity(values.len());
    let mut seen = BTreeSet::new();
    for (index, value) in values.iter().enumerate() {
        let entry = expect_non_empty(value, &format!("{path}[{index}]"))?;
        if !seen.insert(entry.clone()) {
            return Err(PlanError::DuplicateEntry {
                path: path.to_string(),
            });
        }
        normalized.push(entry);
    }
    if !allow_empty && normalized.is_empty() {
        return Err(PlanError::EmptyList {
            path: path.to_string(),
        });
    }
    Ok(normalized)
}
