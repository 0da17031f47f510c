//! Action registry.
//!
//! Maps every action variant to its ordered step list, its advancement
//! queries, and its failure-resume policy. The registry is an explicit value
//! built at startup and passed by reference into the runner; there are no
//! ambient globals. Because both `ActionKind` and `StepName` are closed
//! enums, the `(action, step)` space is exhaustively checked at compile
//! time.

use crate::adapter::IndexObservation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use warden_core::metadata::{ValidationResult, ValidationStatus};
use warden_core::policy::ActionKind;

/// The closed set of step identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    AttemptRollover,
    SetReadOnly,
    CallForceMerge,
    WaitForForceMerge,
    SetReadWrite,
    SetReplicaCount,
    SetIndexPriority,
    SetAllocation,
    CloseIndex,
    OpenIndex,
    DeleteIndex,
    AttemptSnapshot,
    WaitForSnapshot,
    MoveShards,
    WaitForMoveShards,
    AttemptShrink,
    WaitForShrink,
    SendNotification,
    CreateRollupJob,
    WaitForRollup,
    /// Pseudo-step recorded while the engine evaluates transitions.
    AttemptTransition,
}

impl StepName {
    /// Wire name of the step, as recorded in metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttemptRollover => "attempt_rollover",
            Self::SetReadOnly => "set_read_only",
            Self::CallForceMerge => "call_force_merge",
            Self::WaitForForceMerge => "wait_for_force_merge",
            Self::SetReadWrite => "set_read_write",
            Self::SetReplicaCount => "set_replica_count",
            Self::SetIndexPriority => "set_index_priority",
            Self::SetAllocation => "set_allocation",
            Self::CloseIndex => "close_index",
            Self::OpenIndex => "open_index",
            Self::DeleteIndex => "delete_index",
            Self::AttemptSnapshot => "attempt_snapshot",
            Self::WaitForSnapshot => "wait_for_snapshot",
            Self::MoveShards => "move_shards",
            Self::WaitForMoveShards => "wait_for_move_shards",
            Self::AttemptShrink => "attempt_shrink",
            Self::WaitForShrink => "wait_for_shrink",
            Self::SendNotification => "send_notification",
            Self::CreateRollupJob => "create_rollup_job",
            Self::WaitForRollup => "wait_for_rollup",
            Self::AttemptTransition => "attempt_transition",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "attempt_rollover" => Self::AttemptRollover,
            "set_read_only" => Self::SetReadOnly,
            "call_force_merge" => Self::CallForceMerge,
            "wait_for_force_merge" => Self::WaitForForceMerge,
            "set_read_write" => Self::SetReadWrite,
            "set_replica_count" => Self::SetReplicaCount,
            "set_index_priority" => Self::SetIndexPriority,
            "set_allocation" => Self::SetAllocation,
            "close_index" => Self::CloseIndex,
            "open_index" => Self::OpenIndex,
            "delete_index" => Self::DeleteIndex,
            "attempt_snapshot" => Self::AttemptSnapshot,
            "wait_for_snapshot" => Self::WaitForSnapshot,
            "move_shards" => Self::MoveShards,
            "wait_for_move_shards" => Self::WaitForMoveShards,
            "attempt_shrink" => Self::AttemptShrink,
            "wait_for_shrink" => Self::WaitForShrink,
            "send_notification" => Self::SendNotification,
            "create_rollup_job" => Self::CreateRollupJob,
            "wait_for_rollup" => Self::WaitForRollup,
            "attempt_transition" => Self::AttemptTransition,
            _ => return Err(()),
        })
    }
}

/// Registry of the closed action set: step ordering, advancement, resume
/// policy, and advisory validation.
pub struct ActionRegistry;

impl ActionRegistry {
    pub fn new() -> Self {
        Self
    }

    /// The ordered step list an action variant performs.
    pub fn steps(&self, kind: &ActionKind) -> &'static [StepName] {
        use StepName::*;
        match kind {
            ActionKind::Rollover(_) => &[AttemptRollover],
            ActionKind::ForceMerge(_) => &[SetReadOnly, CallForceMerge, WaitForForceMerge],
            ActionKind::ReadOnly(_) => &[SetReadOnly],
            ActionKind::ReadWrite(_) => &[SetReadWrite],
            ActionKind::ReplicaCount(_) => &[SetReplicaCount],
            ActionKind::Close(_) => &[CloseIndex],
            ActionKind::Open(_) => &[OpenIndex],
            ActionKind::Delete(_) => &[DeleteIndex],
            ActionKind::Snapshot(_) => &[AttemptSnapshot, WaitForSnapshot],
            ActionKind::Shrink(_) => &[MoveShards, WaitForMoveShards, AttemptShrink, WaitForShrink],
            ActionKind::Allocation(_) => &[SetAllocation],
            ActionKind::IndexPriority(_) => &[SetIndexPriority],
            ActionKind::Notification(_) => &[SendNotification],
            ActionKind::Rollup(_) => &[CreateRollupJob, WaitForRollup],
        }
    }

    /// The first step of an action.
    pub fn first_step(&self, kind: &ActionKind) -> StepName {
        self.steps(kind)[0]
    }

    /// The step following `current`, or `None` if `current` is the last.
    pub fn next_step(&self, kind: &ActionKind, current: StepName) -> Option<StepName> {
        let steps = self.steps(kind);
        steps
            .iter()
            .position(|s| *s == current)
            .and_then(|i| steps.get(i + 1))
            .copied()
    }

    /// Whether `step` belongs to this action's step set.
    pub fn owns_step(&self, kind: &ActionKind, step: StepName) -> bool {
        self.steps(kind).contains(&step)
    }

    /// Whether a failed step restarts the action from its first step.
    ///
    /// Shrink restarts: its partial progress (shards drained onto one node,
    /// a half-created target index) is unsafe to resume. Every other action
    /// resumes in place.
    pub fn restarts_on_failure(&self, kind: &ActionKind) -> bool {
        matches!(kind, ActionKind::Shrink(_))
    }

    /// Advisory validation computed before executing a step. Never gates
    /// execution; `None` means the action declares no validation.
    pub fn validate(
        &self,
        kind: &ActionKind,
        observation: Option<&IndexObservation>,
    ) -> Option<ValidationResult> {
        match kind {
            ActionKind::Rollover(_) => Some(match observation {
                Some(obs) if obs.has_rollover_alias => ValidationResult {
                    message: "index is the write target of a rollover alias".to_string(),
                    status: ValidationStatus::Passed,
                },
                Some(_) => ValidationResult {
                    message: "index has no rollover alias; rollover will fail".to_string(),
                    status: ValidationStatus::Failed,
                },
                None => ValidationResult {
                    message: "index not observable; re-validating".to_string(),
                    status: ValidationStatus::ReValidating,
                },
            }),
            ActionKind::Delete(_) => Some(match observation {
                Some(_) => ValidationResult {
                    message: "index exists and can be deleted".to_string(),
                    status: ValidationStatus::Passed,
                },
                None => ValidationResult {
                    message: "index no longer exists".to_string(),
                    status: ValidationStatus::Failed,
                },
            }),
            _ => None,
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::policy::{ForceMergeConfig, ShrinkConfig};

    fn force_merge() -> ActionKind {
        ActionKind::ForceMerge(ForceMergeConfig {
            max_num_segments: 1,
        })
    }

    fn shrink() -> ActionKind {
        ActionKind::Shrink(ShrinkConfig {
            num_new_shards: Some(1),
            max_shard_size_bytes: None,
            percentage_of_source_shards: None,
            target_index_suffix: None,
        })
    }

    #[test]
    fn force_merge_step_ordering() {
        let registry = ActionRegistry::new();
        let kind = force_merge();

        assert_eq!(registry.first_step(&kind), StepName::SetReadOnly);
        assert_eq!(
            registry.next_step(&kind, StepName::SetReadOnly),
            Some(StepName::CallForceMerge)
        );
        assert_eq!(
            registry.next_step(&kind, StepName::CallForceMerge),
            Some(StepName::WaitForForceMerge)
        );
        assert_eq!(registry.next_step(&kind, StepName::WaitForForceMerge), None);
    }

    #[test]
    fn only_shrink_restarts_on_failure() {
        let registry = ActionRegistry::new();
        assert!(registry.restarts_on_failure(&shrink()));
        assert!(!registry.restarts_on_failure(&force_merge()));
        assert!(!registry.restarts_on_failure(&ActionKind::Close(Default::default())));
    }

    #[test]
    fn step_names_round_trip() {
        let registry = ActionRegistry::new();
        for kind in [force_merge(), shrink()] {
            for step in registry.steps(&kind) {
                assert_eq!(step.as_str().parse::<StepName>(), Ok(*step));
            }
        }
    }

    #[test]
    fn ownership_is_per_action() {
        let registry = ActionRegistry::new();
        assert!(registry.owns_step(&force_merge(), StepName::SetReadOnly));
        assert!(!registry.owns_step(&shrink(), StepName::SetReadOnly));
    }
}
