//! Reliability fabric: heartbeat evaluation, lease lifecycle, succession,
//! handoff packages, and operator diagnostics.

pub mod diagnostics;
pub mod handoff;
pub mod heartbeat;
pub mod lease;
pub mod succession;

pub use diagnostics::{emit_diagnostics, ReliabilityDiagnosticsEmission, ReliabilityDiagnosticsReport};
pub use handoff::{HandoffError, HandoffPackage, HandoffStore, ResumePlan};
pub use heartbeat::{
    evaluate_heartbeat, latest_artifact_mtime, silence_reason_code, EvaluationState,
    HeartbeatError, HeartbeatMonitor, HeartbeatThresholds, HeartbeatTickResult,
};
pub use lease::{LeaseError, LeaseRegistry, LeaseTakeoverBatch, RegisterLease};
pub use succession::{
    SelfHealingAction, SelfHealingCycleResult, SuccessionError, SuccessionManager,
    SuccessionTakeoverResult,
};
