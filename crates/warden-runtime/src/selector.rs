//! Step selection: the state machine transition function.
//!
//! Given the persisted metadata and the action the policy currently points
//! at, compute which step must run this tick. This function is pure and
//! side-effect-free; every side effect happens in step execution, never
//! here.

use crate::registry::{ActionRegistry, StepName};
use warden_core::metadata::{ManagedIndexMetadata, StepStatus};
use warden_core::policy::ActionKind;

/// Result of step selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Execute this step this tick.
    Step(StepName),
    /// The action's last step has completed; the caller advances the action
    /// (or evaluates transitions if it was the state's last action).
    ActionComplete,
}

/// Select the step to run for `kind`, applying the rules in order:
///
/// 1. No step recorded: the action starts at its first step.
/// 2. The recorded step belongs to a previous action (different action type,
///    or a name this action does not own): a new action always starts
///    fresh, regardless of what the prior action left behind.
/// 3. Recorded step completed: advance to the following step, or report
///    the action complete after its last step.
/// 4. Recorded step failed: restart-from-first actions (shrink) go back to
///    their first step; everything else retries the same step in place.
/// 5. Otherwise (starting / condition not met): re-run the same step.
pub fn select_step(
    registry: &ActionRegistry,
    kind: &ActionKind,
    metadata: &ManagedIndexMetadata,
) -> Selection {
    let Some(step_meta) = &metadata.step else {
        return Selection::Step(registry.first_step(kind));
    };

    let recorded_action = metadata.action.as_ref().map(|a| a.name.as_str());
    if recorded_action != Some(kind.type_name()) {
        return Selection::Step(registry.first_step(kind));
    }

    let Ok(step) = step_meta.name.parse::<StepName>() else {
        return Selection::Step(registry.first_step(kind));
    };
    if !registry.owns_step(kind, step) {
        return Selection::Step(registry.first_step(kind));
    }

    match step_meta.step_status {
        StepStatus::Completed => match registry.next_step(kind, step) {
            Some(next) => Selection::Step(next),
            None => Selection::ActionComplete,
        },
        StepStatus::Failed => {
            if registry.restarts_on_failure(kind) {
                Selection::Step(registry.first_step(kind))
            } else {
                Selection::Step(step)
            }
        }
        StepStatus::Starting | StepStatus::ConditionNotMet => Selection::Step(step),
    }
}
