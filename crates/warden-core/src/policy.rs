//! Policy document model.
//!
//! A policy is an immutable, declarative description of a managed index's
//! lifecycle: an ordered list of states, each with ordered actions and
//! ordered transitions. Policies are JSON documents; the field names here
//! are the wire contract and must stay stable across schema versions.
//!
//! Parsing performs no validation beyond shape. Structural invariants
//! (default state resolves, delete is last, transition targets exist, action
//! parameters are possible) are enforced eagerly by `warden-policy` before a
//! document is ever handed to the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A complete lifecycle policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy id, referenced by managed index metadata.
    pub policy_id: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Document schema version, gates migrations.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// When this policy document was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_time: Option<DateTime<Utc>>,

    /// Notification sent when a managed index becomes terminally failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_notification: Option<ErrorNotification>,

    /// Name of the state a newly managed index starts in.
    pub default_state: String,

    /// Ordered states. Names are unique within a policy.
    pub states: Vec<State>,
}

impl Policy {
    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Parse a policy from a JSON document.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Parse a policy from a YAML document (used by tooling; the persisted
    /// form is always JSON).
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

fn default_schema_version() -> u32 {
    1
}

/// One state in a policy: ordered actions, then ordered transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,

    /// Actions executed in order, addressed by position.
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Candidate transitions, evaluated in order; first match wins.
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl State {
    /// Whether this state ends with a delete action.
    pub fn has_delete(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a.kind, ActionKind::Delete(_)))
    }
}

/// One lifecycle action: common retry/timeout settings plus exactly one
/// typed variant carrying the action's parameters.
///
/// Wire shape: `{"timeout": "1h", "retry": {...}, "force_merge": {...}}`;
/// the variant key doubles as the action type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Wall-clock budget for the whole action; exceeding it fails the
    /// managed index, bypassing the retry budget.
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Retry budget applied per action.
    #[serde(default)]
    pub retry: ActionRetry,

    #[serde(flatten)]
    pub kind: ActionKind,
}

/// The closed set of action variants.
///
/// The transition pseudo-action is engine-internal and never appears on the
/// wire, so it has no variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Rollover(RolloverConfig),
    ForceMerge(ForceMergeConfig),
    ReadOnly(ReadOnlyConfig),
    ReadWrite(ReadWriteConfig),
    ReplicaCount(ReplicaCountConfig),
    Close(CloseConfig),
    Open(OpenConfig),
    Delete(DeleteConfig),
    Snapshot(SnapshotConfig),
    Shrink(ShrinkConfig),
    Allocation(AllocationConfig),
    IndexPriority(IndexPriorityConfig),
    Notification(NotificationConfig),
    Rollup(RollupConfig),
}

impl ActionKind {
    /// The wire/type name of this variant, as used in metadata and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Rollover(_) => "rollover",
            Self::ForceMerge(_) => "force_merge",
            Self::ReadOnly(_) => "read_only",
            Self::ReadWrite(_) => "read_write",
            Self::ReplicaCount(_) => "replica_count",
            Self::Close(_) => "close",
            Self::Open(_) => "open",
            Self::Delete(_) => "delete",
            Self::Snapshot(_) => "snapshot",
            Self::Shrink(_) => "shrink",
            Self::Allocation(_) => "allocation",
            Self::IndexPriority(_) => "index_priority",
            Self::Notification(_) => "notification",
            Self::Rollup(_) => "rollup",
        }
    }
}

/// Rollover conditions. All absent means "roll over immediately".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RolloverConfig {
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_age: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceMergeConfig {
    /// Target maximum number of segments per shard. Must be positive.
    pub max_num_segments: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadOnlyConfig {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadWriteConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaCountConfig {
    pub number_of_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CloseConfig {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OpenConfig {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot repository to write into.
    pub repository: String,

    /// Snapshot name prefix; the executed snapshot name is suffixed with the
    /// action start time and recorded in action properties.
    pub snapshot: String,
}

/// Shrink sizing: exactly one of the three sizing fields must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShrinkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_new_shards: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shard_size_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_of_source_shards: Option<f64>,

    /// Suffix appended to the source index name to form the shrink target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_index_suffix: Option<String>,
}

impl ShrinkConfig {
    /// Number of sizing options set (the validator requires exactly one).
    pub fn sizing_options(&self) -> usize {
        usize::from(self.num_new_shards.is_some())
            + usize::from(self.max_shard_size_bytes.is_some())
            + usize::from(self.percentage_of_source_shards.is_some())
    }
}

/// Allocation routing. At least one of the three maps must be non-empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub require: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exclude: BTreeMap<String, String>,
}

impl AllocationConfig {
    pub fn is_empty(&self) -> bool {
        self.require.is_empty() && self.include.is_empty() && self.exclude.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPriorityConfig {
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Destination channel id, resolved by the notification substrate.
    pub channel: String,

    /// Template with `{{placeholder}}` substitution over index/policy/state.
    pub message_template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Prefix for the rollup job id; the full id is suffixed with the action
    /// start time and recorded in action properties.
    pub job_id_prefix: String,

    /// Opaque job configuration handed to the admin substrate.
    pub config: serde_json::Value,
}

/// Per-action retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRetry {
    /// Maximum number of retries after the first failure.
    #[serde(default = "default_retry_count")]
    pub count: u32,

    #[serde(default)]
    pub backoff: Backoff,

    /// Base delay between retries.
    #[serde(default = "default_retry_delay", with = "crate::duration")]
    pub delay: Duration,
}

impl Default for ActionRetry {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            backoff: Backoff::default(),
            delay: default_retry_delay(),
        }
    }
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(60)
}

/// Backoff policy between retries of a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Exponential,
    Constant,
    Linear,
}

impl Backoff {
    /// Delay to wait before retry number `consumed` (1-based count of
    /// failures observed so far).
    pub fn delay_for(&self, base: Duration, consumed: u32) -> Duration {
        let consumed = consumed.max(1);
        let factor = match self {
            Self::Exponential => 2u32.saturating_pow(consumed - 1),
            Self::Constant => 1,
            Self::Linear => consumed,
        };
        base.checked_mul(factor).unwrap_or(Duration::MAX)
    }
}

/// Notification rendered and handed off when a managed index becomes
/// terminally failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotification {
    pub channel: String,
    pub message_template: String,
}

/// Conditional edge from one state to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Target state name.
    pub state_name: String,

    /// Absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<TransitionConditions>,
}

/// A transition condition. Exactly one field must be set (enforced by the
/// validator); evaluation happens against fresh observations of the index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransitionConditions {
    /// Time since index creation.
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_age: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size_bytes: Option<u64>,

    /// Cron expression; matches once its next execution time after the state
    /// was entered has passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Time since the index rolled over; requires that it has rolled over.
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub rollover_age: Option<Duration>,
}

impl TransitionConditions {
    /// Number of condition fields set.
    pub fn set_count(&self) -> usize {
        usize::from(self.min_age.is_some())
            + usize::from(self.min_doc_count.is_some())
            + usize::from(self.min_size_bytes.is_some())
            + usize::from(self.cron.is_some())
            + usize::from(self.rollover_age.is_some())
    }
}
