//! History record types.
//!
//! One record per persisted tick whose step reached a terminal status. Each
//! record is an immutable snapshot of the managed index metadata at that
//! point, written once and never updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_core::metadata::{ManagedIndexMetadata, StepStatus};

/// A write-once snapshot of one managed index's execution state.
///
/// The flat fields duplicate the metadata's position so records can be
/// filtered without deserializing the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Unique record ID.
    pub record_id: Uuid,

    /// When the snapshot was taken.
    pub recorded_at: DateTime<Utc>,

    /// Index name.
    pub index: String,

    /// Index UUID (the metadata document key).
    pub index_uuid: String,

    /// Policy governing the index.
    pub policy_id: String,

    /// State name at snapshot time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Action type name at snapshot time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Step name at snapshot time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Step status at snapshot time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,

    /// The full metadata document.
    pub metadata: ManagedIndexMetadata,
}

impl HistoryRecord {
    /// Snapshot the given metadata at `recorded_at`.
    pub fn snapshot(metadata: &ManagedIndexMetadata, recorded_at: DateTime<Utc>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            recorded_at,
            index: metadata.index.clone(),
            index_uuid: metadata.index_uuid.clone(),
            policy_id: metadata.policy_id.clone(),
            state: metadata.state.as_ref().map(|s| s.name.clone()),
            action: metadata.action.as_ref().map(|a| a.name.clone()),
            step: metadata.step.as_ref().map(|s| s.name.clone()),
            step_status: metadata.step.as_ref().map(|s| s.step_status),
            metadata: metadata.clone(),
        }
    }

    /// Format the record as a human-readable log line.
    ///
    /// Format: `[timestamp] index=... policy=... state=... action=... step=... status=...`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] index={} policy={}",
            self.recorded_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.index,
            self.policy_id,
        );

        if let Some(ref state) = self.state {
            line.push_str(&format!(" state={}", state));
        }
        if let Some(ref action) = self.action {
            line.push_str(&format!(" action={}", action));
        }
        if let Some(ref step) = self.step {
            line.push_str(&format!(" step={}", step));
        }
        if let Some(status) = self.step_status {
            line.push_str(&format!(" status={}", status));
        }
        if self.metadata.retry_info.failed {
            line.push_str(" failed=true");
        }
        if let Some(cause) = self.metadata.info.get("cause") {
            line.push_str(&format!(" cause=\"{}\"", cause.replace('"', "'")));
        }

        line
    }
}
