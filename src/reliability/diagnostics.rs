//! Operator diagnostics derived from the ledger. Read-only: this module
//! never mutates state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::{EventRecord, EventType, HeartbeatStatusRecord, ProcessLease};
use crate::errors::LedgerError;
use crate::ledger::Ledger;

const SCHEMA_VERSION: &str = "1.0.0";

/// Correlation triple plus event anchors for one diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticCorrelationRef {
    pub task_id: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub event_id: Option<u64>,
    pub event_type: Option<String>,
    pub occurred_at: String,
}

/// Current heartbeat freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatFreshnessDiagnostic {
    pub status: String,
    pub reason_code: Option<String>,
    pub observed_at: String,
    pub last_signal_at: Option<String>,
    pub silence_seconds: u64,
    pub warning_after_seconds: Option<u64>,
    pub stale_after_seconds: Option<u64>,
    pub correlation: DiagnosticCorrelationRef,
}

/// A lease transition: either a registry snapshot or event-sourced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTransitionDiagnostic {
    pub transition_kind: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub reason_code: Option<String>,
    pub lease_token: Option<String>,
    pub lane: Option<String>,
    pub thread_id: Option<String>,
    pub pid: Option<u32>,
    pub transition_at: String,
    pub correlation: DiagnosticCorrelationRef,
}

/// The most recent takeover with its decision timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverDiagnostic {
    pub trigger_reason_code: String,
    pub lease_reason_code: Option<String>,
    pub heartbeat_status: Option<String>,
    pub decision_at: Option<String>,
    pub takeover_at: String,
    /// `takeover_at - decision_at`; negative values are rejected to None.
    pub decision_latency_seconds: Option<i64>,
    pub adopted_step_ids: Vec<String>,
    pub failed_step_ids: Vec<String>,
    pub correlation: DiagnosticCorrelationRef,
}

/// One row of the operator timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorTimelineEntry {
    pub occurred_at: String,
    pub category: String,
    pub event_type: String,
    pub severity: String,
    pub reason_code: Option<String>,
    pub summary: String,
    pub correlation: DiagnosticCorrelationRef,
}

/// Merged, deterministically ordered reliability timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorTimelineView {
    pub schema_version: String,
    pub task_id: String,
    pub run_id: String,
    pub generated_at: String,
    pub total_entries: usize,
    pub stale_heartbeat_events: usize,
    pub lease_transition_events: usize,
    pub takeover_events: usize,
    pub entries: Vec<OperatorTimelineEntry>,
}

/// The full operator diagnostics report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityDiagnosticsReport {
    pub schema_version: String,
    pub task_id: String,
    pub run_id: String,
    pub generated_at: String,
    pub heartbeat: HeartbeatFreshnessDiagnostic,
    pub lease_transitions: Vec<LeaseTransitionDiagnostic>,
    pub takeover: Option<TakeoverDiagnostic>,
    pub timeline: OperatorTimelineView,
}

/// One consistency problem found while validating the signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsValidationIssue {
    pub code: String,
    pub severity: String,
    pub message: String,
}

/// Report plus validation outcome and evidence counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityDiagnosticsEmission {
    pub report: ReliabilityDiagnosticsReport,
    pub validation_issues: Vec<DiagnosticsValidationIssue>,
    pub event_count: usize,
    pub lease_count: usize,
}

/// Build the diagnostics emission for one run straight from the ledger.
pub fn emit_diagnostics(
    ledger: &Ledger,
    task_id: &str,
    run_id: &str,
    generated_at: DateTime<Utc>,
) -> Result<ReliabilityDiagnosticsEmission, LedgerError> {
    let heartbeat_status = ledger.load_heartbeat()?;
    let leases: Vec<ProcessLease> = ledger
        .load_leases()?
        .leases
        .into_iter()
        .filter(|lease| lease.matches(task_id, run_id))
        .collect();
    let events: Vec<EventRecord> = ledger
        .list_events()?
        .into_iter()
        .filter(|event| event.matches_run(task_id, run_id))
        .collect();

    let report = build_report(task_id, run_id, &heartbeat_status, &leases, &events, generated_at);
    let validation_issues = validate_signals(&report, &events);
    Ok(ReliabilityDiagnosticsEmission {
        event_count: events.len(),
        lease_count: leases.len(),
        report,
        validation_issues,
    })
}

/// Assemble the report from already-filtered inputs.
pub fn build_report(
    task_id: &str,
    run_id: &str,
    heartbeat_status: &HeartbeatStatusRecord,
    leases: &[ProcessLease],
    events: &[EventRecord],
    generated_at: DateTime<Utc>,
) -> ReliabilityDiagnosticsReport {
    ReliabilityDiagnosticsReport {
        schema_version: SCHEMA_VERSION.to_string(),
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        generated_at: generated_at.to_rfc3339(),
        heartbeat: heartbeat_diagnostic(task_id, run_id, heartbeat_status, events, generated_at),
        lease_transitions: lease_transitions(task_id, run_id, leases, events, generated_at),
        takeover: takeover_diagnostic(task_id, run_id, events, generated_at),
        timeline: timeline_view(task_id, run_id, events, generated_at),
    }
}

fn heartbeat_diagnostic(
    task_id: &str,
    run_id: &str,
    status: &HeartbeatStatusRecord,
    events: &[EventRecord],
    generated_at: DateTime<Utc>,
) -> HeartbeatFreshnessDiagnostic {
    let silence_seconds = match status.last_heartbeat_at {
        Some(signal) => (generated_at - signal).num_seconds().max(0) as u64,
        None => status.stale_after_seconds.unwrap_or(0),
    };
    let heartbeat_event = events.iter().rev().find(|event| {
        matches!(
            event.event_type,
            EventType::HeartbeatStale | EventType::HeartbeatWarning
        )
    });
    HeartbeatFreshnessDiagnostic {
        status: status.status.as_str().to_string(),
        reason_code: status.reason_code.clone(),
        observed_at: generated_at.to_rfc3339(),
        last_signal_at: status.last_heartbeat_at.map(|at| at.to_rfc3339()),
        silence_seconds,
        warning_after_seconds: status.warning_after_seconds,
        stale_after_seconds: status.stale_after_seconds,
        correlation: correlation_from(task_id, run_id, heartbeat_event, None, generated_at),
    }
}

fn lease_transitions(
    task_id: &str,
    run_id: &str,
    leases: &[ProcessLease],
    events: &[EventRecord],
    generated_at: DateTime<Utc>,
) -> Vec<LeaseTransitionDiagnostic> {
    let mut transitions: Vec<LeaseTransitionDiagnostic> = Vec::new();

    for lease in leases {
        let to_status = lease.status.as_str().to_string();
        transitions.push(LeaseTransitionDiagnostic {
            transition_kind: "SNAPSHOT".to_string(),
            from_status: None,
            reason_code: Some(format!("LEASE_{to_status}_SNAPSHOT")),
            to_status,
            lease_token: Some(lease.lease_token.clone()),
            lane: Some(lease.lane.clone()),
            thread_id: Some(lease.thread_id.clone()),
            pid: Some(lease.pid),
            transition_at: lease.updated_at.to_rfc3339(),
            correlation: DiagnosticCorrelationRef {
                task_id: task_id.to_string(),
                run_id: run_id.to_string(),
                step_id: Some(lease.step_id.clone()),
                event_id: None,
                event_type: Some("LEASE_SNAPSHOT".to_string()),
                occurred_at: lease.updated_at.to_rfc3339(),
            },
        });
    }

    for event in events {
        let reason_code = payload_str(event, "reason_code");
        let (from_status, to_status, reason) = match event.event_type {
            EventType::LeaseTakeover => (
                Some("ACTIVE"),
                "ACTIVE",
                reason_code.unwrap_or_else(|| "LEASE_TAKEOVER".to_string()),
            ),
            EventType::LeaseAdopted => (
                Some("ACTIVE"),
                "ACTIVE",
                reason_code.unwrap_or_else(|| "VALID_UNEXPIRED_LEASE".to_string()),
            ),
            EventType::StepFailed if reason_code.as_deref() == Some("LEASE_NOT_ADOPTED") => {
                (Some("ACTIVE"), "FAILED", "LEASE_NOT_ADOPTED".to_string())
            }
            _ => continue,
        };
        let transition_at = payload_str(event, "takeover_at")
            .unwrap_or_else(|| event.timestamp.to_rfc3339());
        transitions.push(LeaseTransitionDiagnostic {
            transition_kind: "EVENT".to_string(),
            from_status: from_status.map(str::to_string),
            to_status: to_status.to_string(),
            reason_code: Some(reason),
            lease_token: payload_str(event, "lease_token"),
            lane: payload_str(event, "lane"),
            thread_id: payload_str(event, "thread_id"),
            pid: event.payload.get("pid").and_then(|value| value.as_u64()).map(|pid| pid as u32),
            transition_at: transition_at.clone(),
            correlation: correlation_from(task_id, run_id, Some(event), None, generated_at),
        });
    }

    transitions.sort_by(|left, right| {
        (
            &left.transition_at,
            left.correlation.event_id,
            &left.correlation.step_id,
            &left.reason_code,
        )
            .cmp(&(
                &right.transition_at,
                right.correlation.event_id,
                &right.correlation.step_id,
                &right.reason_code,
            ))
    });
    transitions
}

fn takeover_diagnostic(
    task_id: &str,
    run_id: &str,
    events: &[EventRecord],
    generated_at: DateTime<Utc>,
) -> Option<TakeoverDiagnostic> {
    let takeover_event = events
        .iter()
        .rev()
        .find(|event| event.event_type == EventType::LeaseTakeover)?;
    let takeover_at = payload_str(takeover_event, "takeover_at")
        .unwrap_or_else(|| takeover_event.timestamp.to_rfc3339());
    let takeover_dt = parse_rfc3339(&takeover_at);

    // The newest decision signal at or before the takeover.
    let decision_event = events
        .iter()
        .rev()
        .filter(|event| {
            event.payload.get("stage").and_then(|value| value.as_str()) == Some("decide")
                && event.payload.get("takeover_required").and_then(|value| value.as_bool())
                    == Some(true)
        })
        .find(|event| {
            let decided = payload_str(event, "decided_at")
                .and_then(|at| parse_rfc3339(&at))
                .or(Some(event.timestamp));
            match (decided, takeover_dt) {
                (Some(decided), Some(takeover)) => decided <= takeover,
                _ => true,
            }
        });

    let decision_at = decision_event.map(|event| {
        payload_str(event, "decided_at").unwrap_or_else(|| event.timestamp.to_rfc3339())
    });
    let decision_latency_seconds = match (decision_at.as_deref().and_then(parse_rfc3339_str), takeover_dt)
    {
        (Some(decided), Some(takeover)) => {
            let latency = (takeover - decided).num_seconds();
            if latency < 0 {
                None
            } else {
                Some(latency)
            }
        }
        _ => None,
    };

    Some(TakeoverDiagnostic {
        trigger_reason_code: payload_str(takeover_event, "reason_code")
            .unwrap_or_else(|| "MANUAL_TAKEOVER".to_string()),
        lease_reason_code: decision_event.and_then(|event| payload_str(event, "lease_reason_code")),
        heartbeat_status: decision_event.and_then(|event| payload_str(event, "heartbeat_status")),
        decision_at,
        takeover_at: takeover_at.clone(),
        decision_latency_seconds,
        adopted_step_ids: payload_string_list(takeover_event, "adopted_step_ids"),
        failed_step_ids: payload_string_list(takeover_event, "failed_step_ids"),
        correlation: correlation_from(task_id, run_id, Some(takeover_event), None, generated_at),
    })
}

fn timeline_view(
    task_id: &str,
    run_id: &str,
    events: &[EventRecord],
    generated_at: DateTime<Utc>,
) -> OperatorTimelineView {
    let mut entries: Vec<OperatorTimelineEntry> = Vec::new();
    for event in events {
        let reason_code = payload_str(event, "reason_code")
            .or_else(|| payload_str(event, "decision_reason_code"));
        let category = match event.event_type {
            EventType::HeartbeatStale | EventType::HeartbeatWarning => "HEARTBEAT",
            EventType::LeaseTakeover | EventType::SuccessionAccepted | EventType::HandoffApplied => {
                "TAKEOVER"
            }
            EventType::LeaseAdopted | EventType::LeaseNotAdopted => "LEASE",
            EventType::StepFailed if reason_code.as_deref() == Some("LEASE_NOT_ADOPTED") => "LEASE",
            _ => continue,
        };
        let occurred_at = payload_str(event, "takeover_at")
            .unwrap_or_else(|| event.timestamp.to_rfc3339());
        let correlation = correlation_from(task_id, run_id, Some(event), None, generated_at);
        entries.push(OperatorTimelineEntry {
            occurred_at,
            category: category.to_string(),
            event_type: event.event_type.as_str().to_string(),
            severity: event.severity.as_str().to_string(),
            reason_code,
            summary: summarize(event, correlation.step_id.as_deref()),
            correlation,
        });
    }

    entries.sort_by(|left, right| {
        (
            &left.occurred_at,
            left.correlation.event_id,
            &left.event_type,
            &left.correlation.step_id,
        )
            .cmp(&(
                &right.occurred_at,
                right.correlation.event_id,
                &right.event_type,
                &right.correlation.step_id,
            ))
    });

    OperatorTimelineView {
        schema_version: SCHEMA_VERSION.to_string(),
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        generated_at: generated_at.to_rfc3339(),
        total_entries: entries.len(),
        stale_heartbeat_events: entries
            .iter()
            .filter(|entry| entry.event_type == "HEARTBEAT_STALE")
            .count(),
        lease_transition_events: entries.iter().filter(|entry| entry.category == "LEASE").count(),
        takeover_events: entries
            .iter()
            .filter(|entry| entry.event_type == "LEASE_TAKEOVER")
            .count(),
        entries,
    }
}

fn validate_signals(
    report: &ReliabilityDiagnosticsReport,
    events: &[EventRecord],
) -> Vec<DiagnosticsValidationIssue> {
    let mut issues = Vec::new();
    let stale_events = events
        .iter()
        .filter(|event| event.event_type == EventType::HeartbeatStale)
        .count();
    let decision_events = events
        .iter()
        .filter(|event| {
            event.payload.get("stage").and_then(|value| value.as_str()) == Some("decide")
                && event.payload.get("takeover_required").and_then(|value| value.as_bool())
                    == Some(true)
        })
        .count();

    if report.heartbeat.status == "STALE" && stale_events == 0 {
        issues.push(DiagnosticsValidationIssue {
            code: "MISSING_HEARTBEAT_STALE_SIGNAL".to_string(),
            severity: "ERROR".to_string(),
            message: "heartbeat status is STALE but no HEARTBEAT_STALE event exists".to_string(),
        });
    }
    if decision_events > 0 && report.takeover.is_none() {
        issues.push(DiagnosticsValidationIssue {
            code: "MISSING_TAKEOVER_EVENT".to_string(),
            severity: "ERROR".to_string(),
            message: "takeover decision exists but LEASE_TAKEOVER event is missing".to_string(),
        });
    }
    if let Some(takeover) = &report.takeover {
        if decision_events == 0 {
            issues.push(DiagnosticsValidationIssue {
                code: "MISSING_TAKEOVER_DECISION_SIGNAL".to_string(),
                severity: "WARN".to_string(),
                message: "LEASE_TAKEOVER event exists but no decision signal precedes it"
                    .to_string(),
            });
        } else if takeover.decision_latency_seconds.is_none() {
            issues.push(DiagnosticsValidationIssue {
                code: "INCONSISTENT_TAKEOVER_TIMING".to_string(),
                severity: "ERROR".to_string(),
                message: "takeover timing is inconsistent or incomplete".to_string(),
            });
        }
    }
    issues
}

fn summarize(event: &EventRecord, step_id: Option<&str>) -> String {
    match event.event_type {
        EventType::HeartbeatStale => "Heartbeat became stale".to_string(),
        EventType::HeartbeatWarning => "Heartbeat entered warning".to_string(),
        EventType::LeaseTakeover => "Lease takeover executed".to_string(),
        EventType::SuccessionAccepted => "Succession accepted".to_string(),
        EventType::LeaseAdopted => {
            format!("Lease adopted for step {}", step_id.unwrap_or("unknown"))
        }
        EventType::HandoffApplied => "Handoff package applied after takeover".to_string(),
        EventType::StepFailed => format!(
            "Step {} failed because lease was not adopted",
            step_id.unwrap_or("unknown")
        ),
        other => other.as_str().to_string(),
    }
}

fn correlation_from(
    task_id: &str,
    run_id: &str,
    event: Option<&EventRecord>,
    fallback_step_id: Option<&str>,
    generated_at: DateTime<Utc>,
) -> DiagnosticCorrelationRef {
    match event {
        None => DiagnosticCorrelationRef {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            step_id: fallback_step_id.map(str::to_string),
            event_id: None,
            event_type: None,
            occurred_at: generated_at.to_rfc3339(),
        },
        Some(event) => DiagnosticCorrelationRef {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            step_id: event
                .step_id
                .clone()
                .or_else(|| fallback_step_id.map(str::to_string)),
            event_id: Some(event.event_id),
            event_type: Some(event.event_type.as_str().to_string()),
            occurred_at: payload_str(event, "takeover_at")
                .unwrap_or_else(|| event.timestamp.to_rfc3339()),
        },
    }
}

fn payload_str(event: &EventRecord, key: &str) -> Option<String> {
    event
        .payload
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn payload_string_list(event: &EventRecord, key: &str) -> Vec<String> {
    event
        .payload
        .get(key)
        .and_then(|value| value.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_rfc3339(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn parse_rfc3339_str(text: &str) -> Option<DateTime<Utc>> {
    parse_rfc3339(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::HeartbeatState;
    use crate::ledger::Ledger;
    use crate::reliability::lease::{LeaseRegistry, RegisterLease};
    use crate::reliability::succession::SuccessionManager;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn open_ledger(root: &std::path::Path) -> Ledger {
        Ledger::open_with_selection(root, Some("filesystem"), &BTreeMap::new()).unwrap()
    }

    fn seed(ledger: &Ledger) {
        let mut state = ledger.load_state().unwrap();
        state.task_id = Some("T1".to_string());
        state.run_id = Some("R1".to_string());
        ledger.save_state(&state, None, None, None).unwrap();
    }

    #[test]
    fn report_covers_heartbeat_leases_takeover_and_timeline() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed(&ledger);
        let now = Utc::now();

        LeaseRegistry::new(&ledger)
            .register(
                &RegisterLease {
                    lane: "controller".to_string(),
                    step_id: "S1".to_string(),
                    task_id: "T1".to_string(),
                    run_id: "R1".to_string(),
                    thread_id: "thread-main".to_string(),
                    pid: 77,
                    ttl_seconds: 1200,
                },
                now,
            )
            .unwrap();

        let mut heartbeat = ledger.load_heartbeat().unwrap();
        heartbeat.status = HeartbeatState::Stale;
        heartbeat.reason_code = Some("NO_OUTPUT_20M".to_string());
        heartbeat.last_heartbeat_at = Some(now - Duration::seconds(2000));
        heartbeat.stale_after_seconds = Some(1200);
        ledger.save_heartbeat(&heartbeat).unwrap();

        let manager = SuccessionManager::new("T1", "R1");
        manager
            .run_self_healing_cycle(&ledger, "thread-recover", 42, None, None, now)
            .unwrap();

        let emission = emit_diagnostics(&ledger, "T1", "R1", now + Duration::seconds(5)).unwrap();
        let report = &emission.report;
        assert_eq!(report.heartbeat.status, "STALE");
        assert_eq!(report.heartbeat.reason_code.as_deref(), Some("NO_OUTPUT_20M"));
        assert!(report.heartbeat.silence_seconds >= 2000);

        let takeover = report.takeover.as_ref().unwrap();
        assert_eq!(takeover.trigger_reason_code, "HEARTBEAT_STALE");
        assert_eq!(takeover.adopted_step_ids, vec!["S1"]);
        assert_eq!(takeover.decision_latency_seconds, Some(0));

        assert!(!report.lease_transitions.is_empty());
        assert!(report.timeline.takeover_events >= 1);
        assert!(report.timeline.total_entries >= 2);

        // The decision event exists, so validation is quiet about timing.
        assert!(emission
            .validation_issues
            .iter()
            .all(|issue| issue.code != "MISSING_TAKEOVER_EVENT"));
    }

    #[test]
    fn timeline_is_ordered_deterministically() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed(&ledger);
        let now = Utc::now();
        let manager = SuccessionManager::new("T1", "R1");
        manager
            .accept_successor(&ledger, "thread-a", 1, None, None, now)
            .unwrap();

        let emission = emit_diagnostics(&ledger, "T1", "R1", now).unwrap();
        let entries = &emission.report.timeline.entries;
        for window in entries.windows(2) {
            assert!(
                (&window[0].occurred_at, window[0].correlation.event_id)
                    <= (&window[1].occurred_at, window[1].correlation.event_id)
            );
        }
    }

    #[test]
    fn stale_status_without_event_is_flagged() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed(&ledger);
        let mut heartbeat = ledger.load_heartbeat().unwrap();
        heartbeat.status = HeartbeatState::Stale;
        ledger.save_heartbeat(&heartbeat).unwrap();

        let emission = emit_diagnostics(&ledger, "T1", "R1", Utc::now()).unwrap();
        assert!(emission
            .validation_issues
            .iter()
            .any(|issue| issue.code == "MISSING_HEARTBEAT_STALE_SIGNAL"));
    }

    #[test]
    fn no_takeover_means_no_takeover_diagnostic() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        seed(&ledger);
        let emission = emit_diagnostics(&ledger, "T1", "R1", Utc::now()).unwrap();
        assert!(emission.report.takeover.is_none());
        assert_eq!(emission.report.timeline.total_entries, 0);
    }
}
