//! Managed index metadata, the durable "program counter".
//!
//! One document per managed index, keyed by index UUID. The runner loads it
//! at the start of every tick, mutates it, and writes it back under
//! optimistic concurrency. Field names are the wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Terminal status reported by one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step selected but not yet observed as complete.
    Starting,
    /// A transient backend condition blocked the step; retry later.
    ConditionNotMet,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::ConditionNotMet => write!(f, "condition_not_met"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Durable per-index execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedIndexMetadata {
    /// Index name at the time the policy was attached.
    pub index: String,

    /// Index UUID; the metadata document key.
    pub index_uuid: String,

    pub policy_id: String,

    /// Sequence number of the policy document captured at attach time.
    pub policy_seq_no: u64,

    /// Primary term of the policy document captured at attach time.
    pub policy_primary_term: u64,

    #[serde(default)]
    pub policy_completed: bool,

    /// Whether this index has ever rolled over under this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_over: Option<bool>,

    /// Pending transition target, recorded when a transition condition
    /// matched but the state change has not been applied yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepMetadata>,

    #[serde(default)]
    pub retry_info: RetryInfo,

    /// Operator-visible details: last message, failure cause, validation
    /// outcome.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, String>,
}

impl ManagedIndexMetadata {
    /// Metadata for an index on its first tick after a policy is attached.
    pub fn initial(
        index: impl Into<String>,
        index_uuid: impl Into<String>,
        policy: &crate::policy::Policy,
        policy_seq_no: u64,
        policy_primary_term: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            index: index.into(),
            index_uuid: index_uuid.into(),
            policy_id: policy.policy_id.clone(),
            policy_seq_no,
            policy_primary_term,
            policy_completed: false,
            rolled_over: None,
            transition_to: None,
            state: Some(StateMetadata {
                name: policy.default_state.clone(),
                start_time: now,
            }),
            action: None,
            step: None,
            retry_info: RetryInfo::default(),
            info: BTreeMap::new(),
        }
    }

    /// Whether the whole policy run is stuck pending an explicit retry.
    pub fn is_terminally_failed(&self) -> bool {
        self.retry_info.failed
    }

    /// Record an operator-visible message, replacing any previous one.
    pub fn set_info_message(&mut self, message: impl Into<String>) {
        self.info.insert("message".to_string(), message.into());
    }

    /// Record a failure cause alongside the message.
    pub fn set_info_cause(&mut self, cause: impl Into<String>) {
        self.info.insert("cause".to_string(), cause.into());
    }
}

/// Current state position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub name: String,
    pub start_time: DateTime<Utc>,
}

/// Current action position within the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    /// Action type name ("rollover", "force_merge", ...).
    pub name: String,

    /// Position of the action in the state's action list.
    pub index: usize,

    pub start_time: DateTime<Utc>,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub consumed_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_time: Option<DateTime<Utc>>,

    /// Scratch state carried across ticks of a multi-step action; cleared
    /// when the action completes or fails permanently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<ActionProperties>,
}

impl ActionMetadata {
    pub fn new(name: impl Into<String>, index: usize, start_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            index,
            start_time,
            failed: false,
            consumed_retries: 0,
            last_retry_time: None,
            properties: None,
        }
    }
}

/// Current step position within the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub step_status: StepStatus,
}

/// Terminal failure marker for the whole policy run on this index. Once
/// `failed` is set, no further ticks execute until an explicit retry call
/// clears it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryInfo {
    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub consumed_retries: u32,
}

/// Action-specific scratch state needed across ticks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_segments: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup_job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink: Option<ShrinkProperties>,
}

/// Scratch state for an in-flight shrink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShrinkProperties {
    pub target_index: String,
    pub target_num_shards: u32,
}

/// Advisory validation outcome computed before executing a step. Never gates
/// execution; surfaced to operators through `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub message: String,
    pub status: ValidationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed,
    ReValidating,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::ReValidating => write!(f, "re_validating"),
        }
    }
}
