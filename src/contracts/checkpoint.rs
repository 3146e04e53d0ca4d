//! Checkpoint records marking safe resume boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One checkpoint entry. The hash binds the snapshot content; resume
/// validation rejects tampered or truncated entries without corrupting the
/// ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: String,
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_status: Option<String>,
    /// Full pipeline state snapshot at the node boundary.
    pub state: serde_json::Value,
    /// sha256 over the canonical JSON form of `state`.
    pub state_hash: String,
}

impl CheckpointRecord {
    /// Validate the structural shape of a parsed entry, returning the first
    /// problem found. Hash validation happens in the ledger, which owns the
    /// canonical form.
    pub fn shape_error(&self) -> Option<String> {
        if self.schema_version != super::SCHEMA_VERSION {
            return Some("checkpoint schema_version must be '1.0.0'".to_string());
        }
        if self.checkpoint_id.trim().is_empty() {
            return Some("checkpoint_id must be a non-empty string".to_string());
        }
        if !self.state.is_object() {
            return Some("state must be an object".to_string());
        }
        let state_version = self
            .state
            .get("schema_version")
            .and_then(serde_json::Value::as_str);
        if state_version != Some(super::SCHEMA_VERSION) {
            return Some("state.schema_version must be '1.0.0'".to_string());
        }
        if self.state_hash.trim().is_empty() {
            return Some("state_hash must be a non-empty string".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(state: serde_json::Value) -> CheckpointRecord {
        CheckpointRecord {
            schema_version: "1.0.0".to_string(),
            checkpoint_id: "ckpt_1".to_string(),
            created_at: Utc::now(),
            node: Some("plan".to_string()),
            from_status: Some("ANALYSIS".to_string()),
            to_status: Some("FREEZE".to_string()),
            state,
            state_hash: "abc".to_string(),
        }
    }

    #[test]
    fn well_formed_entry_has_no_shape_error() {
        let ok = record(json!({"schema_version": "1.0.0", "status": "FREEZE"}));
        assert!(ok.shape_error().is_none());
    }

    #[test]
    fn shape_errors_are_detected() {
        let mut bad = record(json!({"schema_version": "1.0.0"}));
        bad.checkpoint_id = "  ".to_string();
        assert!(bad.shape_error().unwrap().contains("checkpoint_id"));

        let wrong_version = record(json!({"schema_version": "2.0.0"}));
        assert!(
            wrong_version
                .shape_error()
                .unwrap()
                .contains("state.schema_version")
        );

        let not_object = record(json!([1, 2]));
        assert!(not_object.shape_error().unwrap().contains("object"));
    }
}
