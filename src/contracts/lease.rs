//! Process lease records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SCHEMA_VERSION;

/// Lease lifecycle status. A lease is transferable only while ACTIVE and
/// unexpired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Active,
    Released,
    Expired,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Released => "RELEASED",
            Self::Expired => "EXPIRED",
        }
    }
}

/// Time-bounded ownership record binding an executor identity to a
/// `(run, step)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLease {
    pub lane: String,
    pub step_id: String,
    pub task_id: String,
    pub run_id: String,
    pub thread_id: String,
    pub pid: u32,
    pub lease_token: String,
    pub expiry: DateTime<Utc>,
    pub status: LeaseStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessLease {
    pub fn matches(&self, task_id: &str, run_id: &str) -> bool {
        self.task_id == task_id && self.run_id == run_id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// Persisted lease registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLeaseRegistry {
    pub schema_version: String,
    pub leases: Vec<ProcessLease>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessLeaseRegistry {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            leases: Vec::new(),
            updated_at: now,
        }
    }
}
