//! `daokit check` — validate layout, persisted state, and heartbeat health.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::reliability::heartbeat::{evaluate_heartbeat, latest_artifact_mtime, HeartbeatThresholds};

use super::CliError;

const REQUIRED_STATE_FILES: &[&str] = &[
    "state/pipeline_state.json",
    "state/heartbeat_status.json",
    "state/process_leases.json",
    "state/events.jsonl",
];

const RUN_ACTIVE_STATUSES: &[&str] = &[
    "ANALYSIS", "FREEZE", "EXECUTE", "ACCEPT", "DRAINING", "BLOCKED",
];

pub struct CheckArgs<'a> {
    pub root: &'a Path,
    pub artifact_root: &'a str,
    pub check_interval: u64,
    pub warning_after: u64,
    pub stale_after: u64,
    pub json: bool,
}

pub fn cmd_check(args: &CheckArgs<'_>) -> Result<i32, CliError> {
    validate_layout(args.root)?;

    let pipeline_state = load_json_object(&args.root.join("state/pipeline_state.json"))?;
    let heartbeat_status = load_json_object(&args.root.join("state/heartbeat_status.json"))?;
    let leases_payload = load_json_object(&args.root.join("state/process_leases.json"))?;

    let thresholds =
        HeartbeatThresholds::new(args.check_interval, args.warning_after, args.stale_after)
            .map_err(|heartbeat_error| {
                CliError::new("E_CHECK_HEARTBEAT_INVALID", heartbeat_error.to_string())
            })?;

    let explicit_heartbeat_at = parse_optional_datetime(
        heartbeat_status.get("last_heartbeat_at"),
        "heartbeat_status.last_heartbeat_at",
    )?;
    let implicit_output_at = latest_artifact_mtime(args.root.join(args.artifact_root));

    let status_text = pipeline_state
        .get("status")
        .and_then(|value| value.as_str())
        .unwrap_or("")
        .to_ascii_uppercase();
    let evaluation = evaluate_heartbeat(
        Utc::now(),
        RUN_ACTIVE_STATUSES.contains(&status_text.as_str()),
        &thresholds,
        explicit_heartbeat_at,
        implicit_output_at,
    );

    let lease_count = leases_payload
        .get("leases")
        .and_then(|value| value.as_array())
        .map(|leases| leases.len())
        .unwrap_or(0);
    let heartbeat_state = evaluation.state.to_persisted();
    let payload = serde_json::json!({
        "health": if heartbeat_state == crate::contracts::HeartbeatState::Stale { "WARN" } else { "PASS" },
        "pipeline_status": pipeline_state.get("status"),
        "heartbeat": {
            "status": heartbeat_state.as_str(),
            "reason_code": evaluation.reason_code,
            "silence_seconds": evaluation.silence_seconds,
        },
        "lease_count": lease_count,
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
    } else {
        let health = payload["health"].as_str().unwrap_or("PASS");
        let rendered = if health == "PASS" {
            console::style(health).green()
        } else {
            console::style(health).yellow()
        };
        println!("Health check: {rendered}");
        println!(
            "pipeline_status={}",
            pipeline_state
                .get("status")
                .and_then(|value| value.as_str())
                .unwrap_or("-")
        );
        println!(
            "heartbeat={} silence_seconds={}",
            payload["heartbeat"]["status"].as_str().unwrap_or("-"),
            evaluation.silence_seconds
        );
        println!("lease_count={lease_count}");
    }
    Ok(0)
}

fn validate_layout(root: &Path) -> Result<(), CliError> {
    for relative in REQUIRED_STATE_FILES {
        let candidate = root.join(relative);
        if !candidate.exists() {
            return Err(CliError::new(
                "E_CHECK_LAYOUT_MISSING",
                format!("missing required file: {relative}. Action: run 'daokit init --root {}' first.", root.display()),
            ));
        }
        if !candidate.is_file() {
            return Err(CliError::new(
                "E_CHECK_LAYOUT_MISSING",
                format!("required path is not a file: {relative}"),
            ));
        }
    }
    Ok(())
}

fn load_json_object(path: &Path) -> Result<serde_json::Value, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        CliError::new(
            "E_CHECK_STATE_INVALID",
            format!("missing JSON file: {}: {source}", path.display()),
        )
    })?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(|_| {
        CliError::new(
            "E_CHECK_STATE_INVALID",
            format!("{}: invalid JSON. Action: restore the file from a checkpoint or rerun init on a fresh root.", path.display()),
        )
    })?;
    if !value.is_object() {
        return Err(CliError::new(
            "E_CHECK_STATE_INVALID",
            format!("{}: expected JSON object", path.display()),
        ));
    }
    Ok(value)
}

fn parse_optional_datetime(
    value: Option<&serde_json::Value>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, CliError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(text)) if !text.trim().is_empty() => {
            DateTime::parse_from_rfc3339(text)
                .map(|parsed| Some(parsed.with_timezone(&Utc)))
                .map_err(|_| {
                    CliError::new(
                        "E_CHECK_HEARTBEAT_INVALID",
                        format!("{field_name} has invalid datetime format"),
                    )
                })
        }
        Some(_) => Err(CliError::new(
            "E_CHECK_HEARTBEAT_INVALID",
            format!("{field_name} must be an ISO datetime string"),
        )),
    }
}
