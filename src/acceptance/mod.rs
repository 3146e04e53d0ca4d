//! Acceptance engine: criterion evaluation over persisted evidence
//! artifacts.
//!
//! Every failure carries a stable reason code so the verify node can route
//! deterministically, and every pass produces a proof record whose id is
//! derived from the step, criteria, and artifact hashes. Acceptance never
//! crashes the runtime: it returns a decision with an optional rework
//! payload, and only input normalization problems are errors.

pub mod scope;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::StepContract;
use crate::ledger::canonical::{canonical_hash, sha256_hex};

use scope::audit_changed_files;

/// Reason codes surfaced in decisions, events, and the CLI.
pub const REASON_MISSING_EVIDENCE: &str = "MISSING_EVIDENCE";
pub const REASON_UNREADABLE_EVIDENCE: &str = "UNREADABLE_EVIDENCE";
pub const REASON_INVALID_EVIDENCE_PATH: &str = "INVALID_EVIDENCE_PATH";
pub const REASON_MISSING_COMMAND_EVIDENCE: &str = "MISSING_COMMAND_EVIDENCE";
pub const REASON_OUT_OF_SCOPE_CHANGE: &str = "OUT_OF_SCOPE_CHANGE";
pub const REASON_SCOPE_AUDIT_INPUT_INCOMPLETE: &str = "SCOPE_AUDIT_INPUT_INCOMPLETE";
pub const REASON_SCOPE_AUDIT_INPUT_INVALID: &str = "SCOPE_AUDIT_INPUT_INVALID";
pub const REASON_REWORK_EXHAUSTED: &str = "REWORK_EXHAUSTED";

/// Raised when acceptance input cannot be normalized safely.
#[derive(Debug, Error)]
pub enum AcceptanceError {
    #[error("{name} must be a non-empty string")]
    EmptyField { name: String },

    #[error("{name} must contain at least 1 entry")]
    EmptyList { name: String },
}

/// Evaluation configuration: the explicit record replacing the original's
/// free-form keyword options.
#[derive(Debug, Clone)]
pub struct AcceptanceConfig {
    /// Evaluate evidence at all; when false the verify node treats the
    /// step's acceptance as trivially passing.
    pub enforce_evidence: bool,
    /// Maximum rework attempts before a step fails `REWORK_EXHAUSTED`.
    pub rework_bound: u32,
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            enforce_evidence: false,
            rework_bound: 2,
        }
    }
}

/// One resolved evidence artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub output_name: String,
    pub path: String,
    pub exists: bool,
    pub readable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Per-criterion verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion_id: String,
    pub criterion: String,
    pub passed: bool,
    pub reason_codes: Vec<String>,
}

/// One failure with its stable code and detail payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

/// Proof record backing a passed (or failed) evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceProof {
    pub proof_id: String,
    pub status: AcceptanceStatus,
    pub task_id: String,
    pub run_id: String,
    pub step_id: String,
    pub criteria: Vec<CriterionResult>,
    pub evidence: Vec<EvidenceRecord>,
}

/// Criterion reference inside a rework payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReworkCriterion {
    pub criterion_id: String,
    pub criterion: String,
    pub reason_codes: Vec<String>,
}

/// What the dispatcher must change to pass the failed criteria: the
/// minimum artifact delta, phrased as directives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReworkPayload {
    pub next_action: String,
    pub step_id: String,
    pub failed_criteria: Vec<ReworkCriterion>,
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    Passed,
    Failed,
}

/// Full evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceDecision {
    pub status: AcceptanceStatus,
    pub proof: AcceptanceProof,
    pub failure_reasons: Vec<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rework: Option<ReworkPayload>,
}

impl AcceptanceDecision {
    pub fn passed(&self) -> bool {
        self.status == AcceptanceStatus::Passed
    }
}

/// Inputs for one step evaluation.
#[derive(Debug, Clone)]
pub struct AcceptanceRequest<'a> {
    pub task_id: &'a str,
    pub run_id: &'a str,
    pub step_id: &'a str,
    pub acceptance_criteria: &'a [String],
    pub expected_outputs: &'a [String],
    pub evidence_root: &'a Path,
    pub changed_files: Option<&'a [String]>,
    pub allowed_scope: Option<&'a [String]>,
    pub require_command_evidence: bool,
}

/// Evaluates step acceptance using concrete evidence artifacts.
pub struct AcceptanceEngine {
    command_block_marker: Regex,
}

impl Default for AcceptanceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptanceEngine {
    pub fn new() -> Self {
        Self {
            command_block_marker: Regex::new(r"=== COMMAND ENTRY \d+ (START|END) ===")
                .expect("static pattern"),
        }
    }

    /// Evaluate a step contract at the given evidence root.
    pub fn evaluate_contract(
        &self,
        task_id: &str,
        run_id: &str,
        step: &StepContract,
        evidence_root: &Path,
        changed_files: Option<&[String]>,
    ) -> Result<AcceptanceDecision, AcceptanceError> {
        self.evaluate_step(&AcceptanceRequest {
            task_id,
            run_id,
            step_id: &step.id,
            acceptance_criteria: &step.acceptance_criteria,
            expected_outputs: &step.expected_outputs,
            evidence_root,
            changed_files,
            allowed_scope: step.allowed_scope.as_deref(),
            require_command_evidence: step.require_command_evidence,
        })
    }

    pub fn evaluate_step(
        &self,
        request: &AcceptanceRequest<'_>,
    ) -> Result<AcceptanceDecision, AcceptanceError> {
        let task_id = expect_non_empty(request.task_id, "task_id")?;
        let run_id = expect_non_empty(request.run_id, "run_id")?;
        let step_id = expect_non_empty(request.step_id, "step_id")?;
        let criteria = expect_list(request.acceptance_criteria, "acceptance_criteria")?;
        let outputs = expect_list(request.expected_outputs, "expected_outputs")?;

        let evidence_root = lexically_normalize(request.evidence_root);
        let (evidence, invalid_paths) = resolve_evidence(&outputs, &evidence_root);

        let criterion_index: BTreeMap<String, String> = criteria
            .iter()
            .enumerate()
            .map(|(index, criterion)| (criterion_id(index), criterion.clone()))
            .collect();
        let mut reason_codes: BTreeMap<String, Vec<String>> = criterion_index
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        let mut failures: Vec<FailureReason> = Vec::new();

        for invalid in &invalid_paths {
            let targets = match_criteria(
                &criterion_index,
                &["evidence path", "evidence", "artifact"],
                &["output"],
            );
            attach(
                &mut failures,
                &mut reason_codes,
                &targets,
                FailureReason {
                    code: REASON_INVALID_EVIDENCE_PATH.to_string(),
                    message: "expected output path resolves outside the evidence root".to_string(),
                    details: serde_json::json!({
                        "output_name": invalid.output_name,
                        "path": invalid.path,
                        "evidence_root": evidence_root.display().to_string(),
                    }),
                },
            );
        }

        for record in &evidence {
            if invalid_paths
                .iter()
                .any(|invalid| invalid.output_name == record.output_name)
            {
                continue;
            }
            if !record.exists {
                let targets = match_criteria(
                    &criterion_index,
                    &["missing evidence"],
                    &["evidence"],
                );
                attach(
                    &mut failures,
                    &mut reason_codes,
                    &targets,
                    FailureReason {
                        code: REASON_MISSING_EVIDENCE.to_string(),
                        message: format!("required evidence is missing: {}", record.output_name),
                        details: serde_json::json!({"missing_output": record.output_name}),
                    },
                );
            } else if !record.readable {
                let targets = match_criteria(
                    &criterion_index,
                    &["unreadable", "readable"],
                    &["evidence"],
                );
                attach(
                    &mut failures,
                    &mut reason_codes,
                    &targets,
                    FailureReason {
                        code: REASON_UNREADABLE_EVIDENCE.to_string(),
                        message: format!("evidence exists but cannot be read: {}", record.output_name),
                        details: serde_json::json!({"unreadable_output": record.output_name}),
                    },
                );
            }
        }

        if request.require_command_evidence {
            self.check_command_evidence(&evidence, &criterion_index, &mut reason_codes, &mut failures);
        }

        self.check_scope(
            request.changed_files,
            request.allowed_scope,
            &criterion_index,
            &mut reason_codes,
            &mut failures,
        );

        let criteria_states: Vec<CriterionResult> = criterion_index
            .iter()
            .map(|(id, criterion)| {
                let codes = reason_codes.get(id).cloned().unwrap_or_default();
                CriterionResult {
                    criterion_id: id.clone(),
                    criterion: criterion.clone(),
                    passed: codes.is_empty(),
                    reason_codes: codes,
                }
            })
            .collect();

        let status = if failures.is_empty() {
            AcceptanceStatus::Passed
        } else {
            AcceptanceStatus::Failed
        };

        let proof_payload = serde_json::json!({
            "task_id": task_id,
            "run_id": run_id,
            "step_id": step_id,
            "status": status,
            "criteria": criteria_states,
            "evidence": evidence,
            "failure_reasons": failures,
        });
        let proof = AcceptanceProof {
            proof_id: format!("proof-{}", &canonical_hash(&proof_payload)[..16]),
            status,
            task_id,
            run_id,
            step_id: step_id.clone(),
            criteria: criteria_states.clone(),
            evidence,
        };

        let rework = if status == AcceptanceStatus::Failed {
            Some(ReworkPayload {
                next_action: "rework".to_string(),
                step_id,
                failed_criteria: criteria_states
                    .iter()
                    .filter(|result| !result.passed)
                    .map(|result| ReworkCriterion {
                        criterion_id: result.criterion_id.clone(),
                        criterion: result.criterion.clone(),
                        reason_codes: result.reason_codes.clone(),
                    })
                    .collect(),
                directives: build_directives(&failures),
            })
        } else {
            None
        };

        Ok(AcceptanceDecision {
            status,
            proof,
            failure_reasons: failures,
            rework,
        })
    }

    fn check_command_evidence(
        &self,
        evidence: &[EvidenceRecord],
        criterion_index: &BTreeMap<String, String>,
        reason_codes: &mut BTreeMap<String, Vec<String>>,
        failures: &mut Vec<FailureReason>,
    ) {
        let verification = evidence.iter().find(|record| {
            Path::new(&record.output_name)
                .file_name()
                .map(|name| name == "verification.log")
                .unwrap_or(false)
        });
        let Some(record) = verification else {
            return;
        };
        if !record.exists || !record.readable {
            return;
        }
        let text = std::fs::read_to_string(&record.path).unwrap_or_default();
        let has_line_marker = text.contains("Command:");
        let has_block_marker = self.command_block_marker.is_match(&text);
        if has_line_marker || has_block_marker {
            return;
        }
        let targets = match_criteria(
            criterion_index,
            &["command evidence", "verification.log"],
            &["verification", "command"],
        );
        attach(
            failures,
            reason_codes,
            &targets,
            FailureReason {
                code: REASON_MISSING_COMMAND_EVIDENCE.to_string(),
                message: "verification.log must include command evidence markers \
                          ('Command: <cmd>' or '=== COMMAND ENTRY N START/END ===')"
                    .to_string(),
                details: serde_json::json!({"path": record.path}),
            },
        );
    }

    fn check_scope(
        &self,
        changed_files: Option<&[String]>,
        allowed_scope: Option<&[String]>,
        criterion_index: &BTreeMap<String, String>,
        reason_codes: &mut BTreeMap<String, Vec<String>>,
        failures: &mut Vec<FailureReason>,
    ) {
        if changed_files.is_none() && allowed_scope.is_none() {
            return;
        }
        let targets = match_criteria(
            criterion_index,
            &["out-of-scope", "scope", "unrelated"],
            &["change", "file"],
        );
        let (Some(changed), Some(scope)) = (changed_files, allowed_scope) else {
            attach(
                failures,
                reason_codes,
                &targets,
                FailureReason {
                    code: REASON_SCOPE_AUDIT_INPUT_INCOMPLETE.to_string(),
                    message: "scope audit requires both changed_files and allowed_scope"
                        .to_string(),
                    details: serde_json::json!({}),
                },
            );
            return;
        };
        match audit_changed_files(changed, scope) {
            Ok(audit) if audit.passed() => {}
            Ok(audit) => attach(
                failures,
                reason_codes,
                &targets,
                FailureReason {
                    code: REASON_OUT_OF_SCOPE_CHANGE.to_string(),
                    message: "changed files violate allowed scope policy".to_string(),
                    details: serde_json::json!({
                        "allowed_scope": audit.allowed_scope,
                        "violating_files": audit.violating_files,
                    }),
                },
            ),
            Err(scope_error) => attach(
                failures,
                reason_codes,
                &targets,
                FailureReason {
                    code: REASON_SCOPE_AUDIT_INPUT_INVALID.to_string(),
                    message: scope_error.to_string(),
                    details: serde_json::json!({}),
                },
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct InvalidPath {
    output_name: String,
    path: String,
}

fn resolve_evidence(
    expected_outputs: &[String],
    evidence_root: &Path,
) -> (Vec<EvidenceRecord>, Vec<InvalidPath>) {
    let mut records = Vec::with_capacity(expected_outputs.len());
    let mut invalid = Vec::new();
    for output_name in expected_outputs {
        let raw = PathBuf::from(output_name);
        let joined = if raw.is_absolute() {
            raw
        } else {
            evidence_root.join(output_name)
        };
        let resolved = lexically_normalize(&joined);
        let within_root = resolved.starts_with(evidence_root);
        if !within_root {
            invalid.push(InvalidPath {
                output_name: output_name.clone(),
                path: resolved.display().to_string(),
            });
        }
        let exists = within_root && resolved.is_file();
        let (readable, sha256, size_bytes) = if exists {
            match std::fs::read(&resolved) {
                Ok(bytes) => (true, Some(sha256_hex(&bytes)), Some(bytes.len() as u64)),
                Err(_) => (false, None, None),
            }
        } else {
            (false, None, None)
        };
        records.push(EvidenceRecord {
            output_name: output_name.clone(),
            path: resolved.display().to_string(),
            exists,
            readable,
            sha256,
            size_bytes,
        });
    }
    (records, invalid)
}

/// Resolve `.` and `..` segments without touching the filesystem, so paths
/// to not-yet-written evidence still normalize.
fn lexically_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn criterion_id(index: usize) -> String {
    format!("AC-{:03}", index + 1)
}

/// Pick the criteria a failure attaches to: the ones mentioning a preferred
/// phrase, else a fallback phrase, else all of them.
fn match_criteria(
    criteria: &BTreeMap<String, String>,
    preferred: &[&str],
    fallback: &[&str],
) -> Vec<String> {
    let lowered: BTreeMap<&String, String> = criteria
        .iter()
        .map(|(id, text)| (id, text.to_ascii_lowercase()))
        .collect();
    let matches = |phrases: &[&str]| -> Vec<String> {
        lowered
            .iter()
            .filter(|(_, text)| phrases.iter().any(|phrase| text.contains(phrase)))
            .map(|(id, _)| (*id).clone())
            .collect()
    };
    let preferred_matches = matches(preferred);
    if !preferred_matches.is_empty() {
        return preferred_matches;
    }
    let fallback_matches = matches(fallback);
    if !fallback_matches.is_empty() {
        return fallback_matches;
    }
    criteria.keys().cloned().collect()
}

fn attach(
    failures: &mut Vec<FailureReason>,
    reason_codes: &mut BTreeMap<String, Vec<String>>,
    targets: &[String],
    failure: FailureReason,
) {
    for target in targets {
        if let Some(codes) = reason_codes.get_mut(target) {
            if !codes.contains(&failure.code) {
                codes.push(failure.code.clone());
            }
        }
    }
    failures.push(failure);
}

fn build_directives(failures: &[FailureReason]) -> Vec<String> {
    let mut directives = Vec::new();
    for failure in failures {
        let directive = match failure.code.as_str() {
            REASON_MISSING_EVIDENCE => {
                let missing = failure.details["missing_output"]
                    .as_str()
                    .unwrap_or("<unknown>");
                format!("create missing evidence artifact: {missing}")
            }
            REASON_UNREADABLE_EVIDENCE => {
                let unreadable = failure.details["unreadable_output"]
                    .as_str()
                    .unwrap_or("<unknown>");
                format!("rewrite unreadable evidence artifact: {unreadable}")
            }
            REASON_MISSING_COMMAND_EVIDENCE => "add command evidence markers to \
                 verification.log: include 'Command: <cmd>' and/or \
                 '=== COMMAND ENTRY N START/END ==='"
                .to_string(),
            REASON_OUT_OF_SCOPE_CHANGE => {
                let files = failure.details["violating_files"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|value| value.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .filter(|rendered| !rendered.is_empty())
                    .unwrap_or_else(|| "<unknown>".to_string());
                format!("remove out-of-scope edits and keep only allowed files: {files}")
            }
            REASON_SCOPE_AUDIT_INPUT_INCOMPLETE | REASON_SCOPE_AUDIT_INPUT_INVALID => {
                "provide valid scope audit inputs: changed_files and allowed_scope".to_string()
            }
            _ => "resolve acceptance failure and rerun verification".to_string(),
        };
        if !directives.contains(&directive) {
            directives.push(directive);
        }
    }
    directives
}

fn expect_non_empty(value: &str, name: &str) -> Result<String, AcceptanceError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(AcceptanceError::EmptyField {
            name: name.to_string(),
        });
    }
    Ok(normalized.to_string())
}

fn expect_list(values: &[String], name: &str) -> Result<Vec<String>, AcceptanceError> {
    let mut normalized = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        let entry = expect_non_empty(value, &format!("{name}[{index}]"))?;
        if !normalized.contains(&entry) {
            normalized.push(entry);
        }
    }
    if normalized.is_empty() {
        return Err(AcceptanceError::EmptyList {
            name: name.to_string(),
        });
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn request<'a>(
        criteria: &'a [String],
        outputs: &'a [String],
        root: &'a Path,
    ) -> AcceptanceRequest<'a> {
        AcceptanceRequest {
            task_id: "T1",
            run_id: "R1",
            step_id: "S1",
            acceptance_criteria: criteria,
            expected_outputs: outputs,
            evidence_root: root,
            changed_files: None,
            allowed_scope: None,
            require_command_evidence: false,
        }
    }

    #[test]
    fn passes_when_evidence_trio_exists() {
        let dir = tempdir().unwrap();
        for name in ["report.md", "verification.log", "audit-summary.md"] {
            std::fs::write(dir.path().join(name), "Command: cargo test\nok").unwrap();
        }
        let criteria = strings(&["evidence exists for every output"]);
        let outputs = strings(&["report.md", "verification.log", "audit-summary.md"]);
        let engine = AcceptanceEngine::new();
        let decision = engine
            .evaluate_step(&request(&criteria, &outputs, dir.path()))
            .unwrap();
        assert!(decision.passed());
        assert!(decision.rework.is_none());
        assert!(decision.proof.proof_id.starts_with("proof-"));
        assert!(decision.proof.evidence.iter().all(|record| record.exists));
    }

    #[test]
    fn proof_id_is_stable_for_identical_inputs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), "content").unwrap();
        let criteria = strings(&["report exists"]);
        let outputs = strings(&["report.md"]);
        let engine = AcceptanceEngine::new();
        let first = engine
            .evaluate_step(&request(&criteria, &outputs, dir.path()))
            .unwrap();
        let second = engine
            .evaluate_step(&request(&criteria, &outputs, dir.path()))
            .unwrap();
        assert_eq!(first.proof.proof_id, second.proof.proof_id);
    }

    #[test]
    fn missing_evidence_fails_with_rework_payload() {
        let dir = tempdir().unwrap();
        let criteria = strings(&["missing evidence must be reported"]);
        let outputs = strings(&["report.md"]);
        let engine = AcceptanceEngine::new();
        let decision = engine
            .evaluate_step(&request(&criteria, &outputs, dir.path()))
            .unwrap();
        assert!(!decision.passed());
        assert_eq!(decision.failure_reasons[0].code, REASON_MISSING_EVIDENCE);
        let rework = decision.rework.unwrap();
        assert_eq!(rework.next_action, "rework");
        assert_eq!(rework.failed_criteria.len(), 1);
        assert!(rework.directives[0].contains("report.md"));
    }

    #[test]
    fn parent_traversal_in_expected_output_is_invalid() {
        let dir = tempdir().unwrap();
        let criteria = strings(&["evidence path stays inside the evidence root"]);
        let outputs = strings(&["../outside.md"]);
        let engine = AcceptanceEngine::new();
        let decision = engine
            .evaluate_step(&request(&criteria, &outputs, dir.path()))
            .unwrap();
        assert!(!decision.passed());
        assert_eq!(
            decision.failure_reasons[0].code,
            REASON_INVALID_EVIDENCE_PATH
        );
        // The escape is reported once, not doubled as missing evidence.
        assert_eq!(decision.failure_reasons.len(), 1);
    }

    #[test]
    fn command_evidence_accepts_both_marker_styles() {
        let engine = AcceptanceEngine::new();
        let criteria = strings(&["verification.log carries command evidence"]);
        let outputs = strings(&["verification.log"]);

        for content in [
            "Command: cargo test --all\nresult ok",
            "=== COMMAND ENTRY 1 START ===\ncargo test\n=== COMMAND ENTRY 1 END ===",
        ] {
            let dir = tempdir().unwrap();
            std::fs::write(dir.path().join("verification.log"), content).unwrap();
            let mut req = request(&criteria, &outputs, dir.path());
            req.require_command_evidence = true;
            let decision = engine.evaluate_step(&req).unwrap();
            assert!(decision.passed(), "content: {content}");
        }

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("verification.log"), "no markers here").unwrap();
        let mut req = request(&criteria, &outputs, dir.path());
        req.require_command_evidence = true;
        let decision = engine.evaluate_step(&req).unwrap();
        assert!(!decision.passed());
        assert_eq!(
            decision.failure_reasons[0].code,
            REASON_MISSING_COMMAND_EVIDENCE
        );
    }

    #[test]
    fn out_of_scope_change_lists_violators() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), "ok").unwrap();
        let criteria = strings(&[
            "report exists",
            "no out-of-scope changes are introduced",
        ]);
        let outputs = strings(&["report.md"]);
        let changed = strings(&["src/foo/a.py", "src/bar/b.py"]);
        let scope = strings(&["src/foo/**"]);
        let mut req = request(&criteria, &outputs, dir.path());
        req.changed_files = Some(&changed);
        req.allowed_scope = Some(&scope);

        let engine = AcceptanceEngine::new();
        let decision = engine.evaluate_step(&req).unwrap();
        assert!(!decision.passed());
        let failure = &decision.failure_reasons[0];
        assert_eq!(failure.code, REASON_OUT_OF_SCOPE_CHANGE);
        assert_eq!(failure.details["violating_files"][0], "src/bar/b.py");

        // Only the scope criterion fails; the rework payload references it
        // alone.
        let rework = decision.rework.unwrap();
        assert_eq!(rework.failed_criteria.len(), 1);
        assert_eq!(rework.failed_criteria[0].criterion_id, "AC-002");
    }

    #[test]
    fn scope_audit_requires_both_inputs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), "ok").unwrap();
        let criteria = strings(&["scope is respected"]);
        let outputs = strings(&["report.md"]);
        let changed = strings(&["src/a.rs"]);
        let mut req = request(&criteria, &outputs, dir.path());
        req.changed_files = Some(&changed);

        let decision = AcceptanceEngine::new().evaluate_step(&req).unwrap();
        assert_eq!(
            decision.failure_reasons[0].code,
            REASON_SCOPE_AUDIT_INPUT_INCOMPLETE
        );
    }

    #[test]
    fn empty_inputs_are_normalization_errors() {
        let dir = tempdir().unwrap();
        let criteria = strings(&[]);
        let outputs = strings(&["report.md"]);
        let err = AcceptanceEngine::new()
            .evaluate_step(&request(&criteria, &outputs, dir.path()))
            .unwrap_err();
        assert!(err.to_string().contains("acceptance_criteria"));
    }
}
