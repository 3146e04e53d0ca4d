//! Persisted contract schemas for the DAOKit ledger.
//!
//! Five record families are persisted: pipeline state, events, process
//! leases, heartbeat status, and checkpoints. Every record carries
//! `schema_version = "1.0.0"`; top-level shapes are closed, and
//! extensibility lives only inside `role_lifecycle`, the succession
//! sub-record, and event payloads.

pub mod checkpoint;
pub mod event;
pub mod heartbeat;
pub mod lease;
pub mod pipeline;

pub use checkpoint::CheckpointRecord;
pub use event::{EventRecord, EventType, Severity};
pub use heartbeat::{HeartbeatState, HeartbeatStatusRecord};
pub use lease::{LeaseStatus, ProcessLease, ProcessLeaseRegistry};
pub use pipeline::{
    classify_step_lifecycle, PipelineState, PipelineStatus, StepClassification, StepContract,
    Succession, SuccessorIdentity,
};

/// Frozen contract family version. Enum values and top-level shapes never
/// change within this family; new detail fields are additive and live
/// inside payload objects only.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Returns the frozen schema version for newly minted records.
pub fn schema_version() -> String {
    SCHEMA_VERSION.to_string()
}
