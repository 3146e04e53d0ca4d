//! Process lease lifecycle.
//!
//! Leases are the cross-process coordination primitive: a time-bounded
//! ownership record binding an executor identity to a `(run, step)`. Every
//! mutating operation requires a matching `(task_id, run_id, step_id)`
//! triple, expired leases transition to EXPIRED before any evaluation, and
//! no two ACTIVE leases may exist for the same `(run_id, step_id)`.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::{LeaseStatus, PipelineState, ProcessLease};
use crate::errors::LedgerError;
use crate::ledger::Ledger;

pub const DEFAULT_CONTROLLER_LANE: &str = "controller";

/// Lease lifecycle failures with stable reason codes.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("lease token is not bound to the provided task/run/step")]
    OwnershipMismatch,

    #[error("lease is expired")]
    Expired,

    #[error("lease is not ACTIVE (status={status})")]
    NotActive { status: String },

    #[error("an ACTIVE lease already exists for run '{run_id}' step '{step_id}'")]
    DuplicateActiveLease { run_id: String, step_id: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl LeaseError {
    /// Stable reason code for CLI output and event payloads.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_LEASE_INPUT",
            Self::OwnershipMismatch => "LEASE_OWNERSHIP_MISMATCH",
            Self::Expired => "LEASE_EXPIRED",
            Self::NotActive { .. } => "NO_ACTIVE_LEASE",
            Self::DuplicateActiveLease { .. } => "DUPLICATE_ACTIVE_LEASE",
            Self::Ledger(_) => "LEASE_STORE_FAILED",
        }
    }
}

/// Inputs for registering a new lease.
#[derive(Debug, Clone)]
pub struct RegisterLease {
    pub lane: String,
    pub step_id: String,
    pub task_id: String,
    pub run_id: String,
    pub thread_id: String,
    pub pid: u32,
    pub ttl_seconds: u64,
}

/// Batch takeover outcome.
#[derive(Debug, Clone, Default)]
pub struct LeaseTakeoverBatch {
    pub adopted: Vec<ProcessLease>,
    pub non_adopted: Vec<ProcessLease>,
}

/// Lease lifecycle manager over the ledger's lease registry document.
pub struct LeaseRegistry<'a> {
    ledger: &'a Ledger,
}

impl<'a> LeaseRegistry<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn register(&self, input: &RegisterLease, at: DateTime<Utc>) -> Result<ProcessLease, LeaseError> {
        let lane = normalize_lane(&input.lane)?;
        for (value, name) in [
            (&input.step_id, "step_id"),
            (&input.task_id, "task_id"),
            (&input.run_id, "run_id"),
            (&input.thread_id, "thread_id"),
        ] {
            expect_non_empty(value, name)?;
        }
        if input.pid == 0 {
            return Err(LeaseError::InvalidInput(
                "pid must be a positive integer".to_string(),
            ));
        }
        let ttl = expect_positive_seconds(input.ttl_seconds)?;

        let mut registry = self.ledger.load_leases()?;
        expire_stale(&mut registry.leases, at);

        let duplicate = registry.leases.iter().any(|lease| {
            lease.run_id == input.run_id
                && lease.step_id == input.step_id
                && lease.status == LeaseStatus::Active
        });
        if duplicate {
            return Err(LeaseError::DuplicateActiveLease {
                run_id: input.run_id.clone(),
                step_id: input.step_id.clone(),
            });
        }

        let record = ProcessLease {
            lane,
            step_id: input.step_id.trim().to_string(),
            task_id: input.task_id.trim().to_string(),
            run_id: input.run_id.trim().to_string(),
            thread_id: input.thread_id.trim().to_string(),
            pid: input.pid,
            lease_token: new_token(),
            expiry: at + Duration::seconds(ttl),
            status: LeaseStatus::Active,
            last_heartbeat_at: at,
            created_at: at,
            updated_at: at,
        };
        registry.leases.push(record.clone());
        self.ledger.save_leases(&registry)?;
        self.sync_lane_ownership(&record)?;
        Ok(record)
    }

    pub fn heartbeat(
        &self,
        lease_token: &str,
        task_id: &str,
        run_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ProcessLease, LeaseError> {
        self.mutate_bound_lease(lease_token, task_id, run_id, step_id, at, |lease, at| {
            lease.last_heartbeat_at = at;
            Ok(())
        })
    }

    pub fn renew(
        &self,
        lease_token: &str,
        task_id: &str,
        run_id: &str,
        step_id: &str,
        ttl_seconds: u64,
        at: DateTime<Utc>,
    ) -> Result<ProcessLease, LeaseError> {
        let ttl = expect_positive_seconds(ttl_seconds)?;
        self.mutate_bound_lease(lease_token, task_id, run_id, step_id, at, move |lease, at| {
            lease.last_heartbeat_at = at;
            lease.expiry = at + Duration::seconds(ttl);
            Ok(())
        })
    }

    pub fn release(
        &self,
        lease_token: &str,
        task_id: &str,
        run_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ProcessLease, LeaseError> {
        let mut registry = self.ledger.load_leases()?;
        let index = find_bound(&registry.leases, lease_token, task_id, run_id, step_id)?;
        registry.leases[index].status = LeaseStatus::Released;
        registry.leases[index].updated_at = at;
        let released = registry.leases[index].clone();
        self.ledger.save_leases(&registry)?;
        self.sync_lane_ownership(&released)?;
        Ok(released)
    }

    /// Transfer a single lease to a successor. Non-active or expired leases
    /// yield `None` rather than an error: they simply cannot be adopted.
    pub fn takeover(
        &self,
        lease_token: &str,
        task_id: &str,
        run_id: &str,
        step_id: &str,
        successor_thread_id: &str,
        successor_pid: u32,
        ttl_seconds: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<Option<ProcessLease>, LeaseError> {
        validate_successor(successor_thread_id, successor_pid)?;
        let mut registry = self.ledger.load_leases()?;
        let index = find_bound(&registry.leases, lease_token, task_id, run_id, step_id)?;

        if registry.leases[index].status != LeaseStatus::Active {
            return Ok(None);
        }
        if registry.leases[index].is_expired(at) {
            registry.leases[index].status = LeaseStatus::Expired;
            registry.leases[index].updated_at = at;
            self.ledger.save_leases(&registry)?;
            return Ok(None);
        }

        apply_takeover(
            &mut registry.leases[index],
            successor_thread_id,
            successor_pid,
            ttl_seconds,
            at,
        );
        let adopted = registry.leases[index].clone();
        self.ledger.save_leases(&registry)?;
        self.sync_lane_ownership(&adopted)?;
        Ok(Some(adopted))
    }

    /// Adopt every ACTIVE unexpired lease of a run for the successor.
    /// Expired running leases flip to EXPIRED and land in the non-adopted
    /// set.
    pub fn batch_takeover_run(
        &self,
        task_id: &str,
        run_id: &str,
        successor_thread_id: &str,
        successor_pid: u32,
        ttl_seconds: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<LeaseTakeoverBatch, LeaseError> {
        expect_non_empty(task_id, "task_id")?;
        expect_non_empty(run_id, "run_id")?;
        validate_successor(successor_thread_id, successor_pid)?;

        let mut registry = self.ledger.load_leases()?;
        let mut batch = LeaseTakeoverBatch::default();
        let mut mutated = false;

        for lease in registry.leases.iter_mut() {
            if !lease.matches(task_id, run_id) || lease.status != LeaseStatus::Active {
                continue;
            }
            if lease.is_expired(at) {
                lease.status = LeaseStatus::Expired;
                lease.updated_at = at;
                batch.non_adopted.push(lease.clone());
                mutated = true;
                continue;
            }
            apply_takeover(lease, successor_thread_id, successor_pid, ttl_seconds, at);
            batch.adopted.push(lease.clone());
            mutated = true;
        }

        if mutated {
            self.ledger.save_leases(&registry)?;
            for lease in batch.adopted.iter().chain(batch.non_adopted.iter()) {
                self.sync_lane_ownership(lease)?;
            }
        }
        Ok(batch)
    }

    pub fn list(
        &self,
        task_id: Option<&str>,
        run_id: Option<&str>,
    ) -> Result<Vec<ProcessLease>, LeaseError> {
        let registry = self.ledger.load_leases()?;
        Ok(registry
            .leases
            .into_iter()
            .filter(|lease| task_id.map(|task| lease.task_id == task).unwrap_or(true))
            .filter(|lease| run_id.map(|run| lease.run_id == run).unwrap_or(true))
            .collect())
    }

    fn mutate_bound_lease(
        &self,
        lease_token: &str,
        task_id: &str,
        run_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
        mutate: impl FnOnce(&mut ProcessLease, DateTime<Utc>) -> Result<(), LeaseError>,
    ) -> Result<ProcessLease, LeaseError> {
        let mut registry = self.ledger.load_leases()?;
        let index = find_bound(&registry.leases, lease_token, task_id, run_id, step_id)?;

        let status = registry.leases[index].status;
        if status != LeaseStatus::Active {
            return Err(LeaseError::NotActive {
                status: status.as_str().to_string(),
            });
        }
        if registry.leases[index].is_expired(at) {
            registry.leases[index].status = LeaseStatus::Expired;
            registry.leases[index].updated_at = at;
            self.ledger.save_leases(&registry)?;
            return Err(LeaseError::Expired);
        }

        mutate(&mut registry.leases[index], at)?;
        registry.leases[index].updated_at = at;
        let updated = registry.leases[index].clone();
        self.ledger.save_leases(&registry)?;
        Ok(updated)
    }

    /// Mirror lease ownership into pipeline-state lane lifecycle markers
    /// when the lease belongs to the run the ledger currently tracks.
    fn sync_lane_ownership(&self, lease: &ProcessLease) -> Result<(), LeaseError> {
        let mut state = self.ledger.load_state()?;
        if state.task_id.as_deref() != Some(lease.task_id.as_str())
            || state.run_id.as_deref() != Some(lease.run_id.as_str())
        {
            return Ok(());
        }

        let mut changed = false;
        if lease.status == LeaseStatus::Active {
            changed |= set_marker(&mut state, "controller_lane", &lease.lane);
            changed |= set_marker(
                &mut state,
                "controller_ownership",
                &format!("{}:{}", lease.lane, lease.step_id),
            );
            changed |= set_marker(
                &mut state,
                &format!("lane:{}", lease.lane),
                &format!("active_step:{}", lease.step_id),
            );
            changed |= set_marker(
                &mut state,
                &format!("step:{}", lease.step_id),
                &format!("owned_by_lane:{}", lease.lane),
            );
            if state.current_step.is_none() {
                state.current_step = Some(lease.step_id.clone());
                changed = true;
            }
        } else {
            changed |= set_marker(
                &mut state,
                &format!("step:{}", lease.step_id),
                &format!(
                    "lease_{}:{}",
                    lease.status.as_str().to_ascii_lowercase(),
                    lease.lane
                ),
            );
            let ownership_key = "controller_ownership".to_string();
            if state.role_lifecycle.get(&ownership_key).map(String::as_str)
                == Some(&format!("{}:{}", lease.lane, lease.step_id))
            {
                changed |= set_marker(
                    &mut state,
                    &ownership_key,
                    &format!("{}:unassigned", lease.lane),
                );
            }
        }

        if changed {
            let status = state.status.as_str();
            self.ledger
                .save_state(&state, Some("lease_lifecycle_sync"), Some(status), Some(status))?;
        }
        Ok(())
    }
}

fn set_marker(state: &mut PipelineState, key: &str, value: &str) -> bool {
    if state.role_lifecycle.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    state
        .role_lifecycle
        .insert(key.to_string(), value.to_string());
    true
}

fn expire_stale(leases: &mut [ProcessLease], at: DateTime<Utc>) {
    for lease in leases.iter_mut() {
        if lease.status == LeaseStatus::Active && lease.is_expired(at) {
            lease.status = LeaseStatus::Expired;
            lease.updated_at = at;
        }
    }
}

fn find_bound(
    leases: &[ProcessLease],
    lease_token: &str,
    task_id: &str,
    run_id: &str,
    step_id: &str,
) -> Result<usize, LeaseError> {
    expect_non_empty(lease_token, "lease_token")?;
    expect_non_empty(task_id, "task_id")?;
    expect_non_empty(run_id, "run_id")?;
    expect_non_empty(step_id, "step_id")?;

    for (index, lease) in leases.iter().enumerate() {
        if lease.lease_token != lease_token {
            continue;
        }
        if lease.task_id == task_id && lease.run_id == run_id && lease.step_id == step_id {
            return Ok(index);
        }
        break;
    }
    Err(LeaseError::OwnershipMismatch)
}

fn apply_takeover(
    lease: &mut ProcessLease,
    successor_thread_id: &str,
    successor_pid: u32,
    ttl_seconds: Option<u64>,
    at: DateTime<Utc>,
) {
    lease.thread_id = successor_thread_id.trim().to_string();
    lease.pid = successor_pid;
    lease.lease_token = new_token();
    lease.last_heartbeat_at = at;
    lease.updated_at = at;
    if let Some(ttl) = ttl_seconds {
        lease.expiry = at + Duration::seconds(ttl as i64);
    }
}

fn validate_successor(thread_id: &str, pid: u32) -> Result<(), LeaseError> {
    expect_non_empty(thread_id, "successor_thread_id")?;
    if pid == 0 {
        return Err(LeaseError::InvalidInput(
            "successor_pid must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

fn normalize_lane(lane: &str) -> Result<String, LeaseError> {
    let normalized = expect_non_empty(lane, "lane")?;
    if normalized.eq_ignore_ascii_case("default") || normalized.eq_ignore_ascii_case("controller") {
        return Ok(DEFAULT_CONTROLLER_LANE.to_string());
    }
    Ok(normalized)
}

fn expect_non_empty(value: &str, name: &str) -> Result<String, LeaseError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(LeaseError::InvalidInput(format!("{name} must be non-empty")));
    }
    Ok(normalized.to_string())
}

fn expect_positive_seconds(value: u64) -> Result<i64, LeaseError> {
    if value == 0 {
        return Err(LeaseError::InvalidInput(
            "ttl_seconds must be a positive integer".to_string(),
        ));
    }
    Ok(value as i64)
}

fn new_token() -> String {
    format!("lease_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn open_ledger(root: &std::path::Path) -> Ledger {
        Ledger::open_with_selection(root, Some("filesystem"), &BTreeMap::new()).unwrap()
    }

    fn register_input(step_id: &str) -> RegisterLease {
        RegisterLease {
            lane: "default".to_string(),
            step_id: step_id.to_string(),
            task_id: "T1".to_string(),
            run_id: "R1".to_string(),
            thread_id: "thread-main".to_string(),
            pid: 4321,
            ttl_seconds: 1200,
        }
    }

    #[test]
    fn register_normalizes_lane_and_persists() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let lease = registry.register(&register_input("S1"), Utc::now()).unwrap();
        assert_eq!(lease.lane, "controller");
        assert_eq!(lease.status, LeaseStatus::Active);
        assert!(lease.lease_token.starts_with("lease_"));
        assert_eq!(registry.list(Some("T1"), Some("R1")).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_active_lease_for_run_step_is_rejected() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();
        registry.register(&register_input("S1"), now).unwrap();
        let err = registry.register(&register_input("S1"), now).unwrap_err();
        assert_eq!(err.reason_code(), "DUPLICATE_ACTIVE_LEASE");

        // A different step is fine.
        assert!(registry.register(&register_input("S2"), now).is_ok());
    }

    #[test]
    fn heartbeat_requires_matching_identity() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();
        let lease = registry.register(&register_input("S1"), now).unwrap();

        let err = registry
            .heartbeat(&lease.lease_token, "T1", "R1", "S2", now)
            .unwrap_err();
        assert_eq!(err.reason_code(), "LEASE_OWNERSHIP_MISMATCH");

        let beat = registry
            .heartbeat(&lease.lease_token, "T1", "R1", "S1", now + Duration::seconds(5))
            .unwrap();
        assert_eq!(beat.last_heartbeat_at, now + Duration::seconds(5));
    }

    #[test]
    fn expired_lease_cannot_heartbeat_or_renew() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();
        let mut input = register_input("S1");
        input.ttl_seconds = 10;
        let lease = registry.register(&input, now).unwrap();

        let late = now + Duration::seconds(11);
        let err = registry
            .heartbeat(&lease.lease_token, "T1", "R1", "S1", late)
            .unwrap_err();
        assert_eq!(err.reason_code(), "LEASE_EXPIRED");

        // The lease is now EXPIRED; further operations see NO_ACTIVE_LEASE.
        let err = registry
            .renew(&lease.lease_token, "T1", "R1", "S1", 100, late)
            .unwrap_err();
        assert_eq!(err.reason_code(), "NO_ACTIVE_LEASE");
    }

    #[test]
    fn renew_extends_expiry() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();
        let lease = registry.register(&register_input("S1"), now).unwrap();
        let renewed = registry
            .renew(&lease.lease_token, "T1", "R1", "S1", 3600, now + Duration::seconds(1))
            .unwrap();
        assert_eq!(
            renewed.expiry,
            now + Duration::seconds(1) + Duration::seconds(3600)
        );
    }

    #[test]
    fn takeover_rotates_token_and_identity() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();
        let lease = registry.register(&register_input("S1"), now).unwrap();

        let adopted = registry
            .takeover(
                &lease.lease_token,
                "T1",
                "R1",
                "S1",
                "thread-recover",
                9876,
                Some(1800),
                now + Duration::seconds(5),
            )
            .unwrap()
            .unwrap();
        assert_eq!(adopted.thread_id, "thread-recover");
        assert_eq!(adopted.pid, 9876);
        assert_ne!(adopted.lease_token, lease.lease_token);
        assert_eq!(adopted.status, LeaseStatus::Active);
    }

    #[test]
    fn released_lease_is_not_adoptable() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();
        let lease = registry.register(&register_input("S1"), now).unwrap();
        registry
            .release(&lease.lease_token, "T1", "R1", "S1", now)
            .unwrap();
        let adopted = registry
            .takeover(&lease.lease_token, "T1", "R1", "S1", "thread-x", 1, None, now)
            .unwrap();
        assert!(adopted.is_none());
    }

    #[test]
    fn batch_takeover_partitions_adopted_and_expired() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let registry = LeaseRegistry::new(&ledger);
        let now = Utc::now();

        registry.register(&register_input("S1"), now).unwrap();
        let mut short = register_input("S2");
        short.ttl_seconds = 10;
        registry.register(&short, now).unwrap();

        let batch = registry
            .batch_takeover_run("T1", "R1", "thread-recover", 2222, None, now + Duration::seconds(60))
            .unwrap();
        assert_eq!(batch.adopted.len(), 1);
        assert_eq!(batch.adopted[0].step_id, "S1");
        assert_eq!(batch.non_adopted.len(), 1);
        assert_eq!(batch.non_adopted[0].step_id, "S2");
        assert_eq!(batch.non_adopted[0].status, LeaseStatus::Expired);
    }

    #[test]
    fn lane_ownership_syncs_into_pipeline_state() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        let mut state = ledger.load_state().unwrap();
        state.task_id = Some("T1".to_string());
        state.run_id = Some("R1".to_string());
        ledger.save_state(&state, None, None, None).unwrap();

        let registry = LeaseRegistry::new(&ledger);
        let lease = registry.register(&register_input("S1"), Utc::now()).unwrap();

        let state = ledger.load_state().unwrap();
        assert_eq!(
            state.role_lifecycle.get("controller_ownership").map(String::as_str),
            Some("controller:S1")
        );
        assert_eq!(state.current_step.as_deref(), Some("S1"));

        registry
            .release(&lease.lease_token, "T1", "R1", "S1", Utc::now())
            .unwrap();
        let state = ledger.load_state().unwrap();
        assert_eq!(
            state.role_lifecycle.get("step:S1").map(String::as_str),
            Some("lease_released:controller")
        );
        assert_eq!(
            state.role_lifecycle.get("controller_ownership").map(String::as_str),
            Some("controller:unassigned")
        );
    }
}
