//! Validation error types for policy documents.
//!
//! These errors are produced eagerly at policy-parse/validation time; an
//! invalid policy never reaches the runtime.

use std::fmt;

/// Error type for policy validation failures.
#[derive(Debug, Clone)]
pub struct PolicyError {
    /// The kind of validation error.
    pub kind: PolicyErrorKind,
    /// Human-readable error message.
    pub message: String,
}

impl PolicyError {
    /// Create a new policy error.
    pub fn new(kind: PolicyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    // =========================================================================
    // POLICY SHAPE ERRORS
    // =========================================================================

    /// Create an empty policy id error.
    pub fn empty_policy_id() -> Self {
        Self::new(PolicyErrorKind::EmptyPolicyId, "Policy id must be non-empty")
    }

    /// Create a no states error.
    pub fn no_states(policy_id: &str) -> Self {
        Self::new(
            PolicyErrorKind::NoStates,
            format!("Policy '{}' must declare at least one state", policy_id),
        )
    }

    /// Create a default state not found error.
    pub fn default_state_not_found(policy_id: &str, default_state: &str) -> Self {
        Self::new(
            PolicyErrorKind::DefaultStateNotFound,
            format!(
                "Policy '{}' names default state '{}' but no state with that name exists",
                policy_id, default_state
            ),
        )
    }

    /// Create a duplicate state name error.
    pub fn duplicate_state_name(policy_id: &str, state: &str) -> Self {
        Self::new(
            PolicyErrorKind::DuplicateStateName,
            format!("Policy '{}' declares state '{}' more than once", policy_id, state),
        )
    }

    // =========================================================================
    // STATE SHAPE ERRORS
    // =========================================================================

    /// Create a delete-not-last error.
    pub fn delete_not_last(state: &str) -> Self {
        Self::new(
            PolicyErrorKind::DeleteNotLast,
            format!(
                "State '{}' has a delete action that is not its last action",
                state
            ),
        )
    }

    /// Create a transitions-after-delete error.
    pub fn transitions_after_delete(state: &str) -> Self {
        Self::new(
            PolicyErrorKind::TransitionsAfterDelete,
            format!(
                "State '{}' schedules the index for deletion and cannot declare transitions",
                state
            ),
        )
    }

    /// Create a dangling transition target error.
    pub fn dangling_transition(state: &str, target: &str) -> Self {
        Self::new(
            PolicyErrorKind::DanglingTransitionTarget,
            format!(
                "State '{}' transitions to '{}' which is not a state in this policy",
                state, target
            ),
        )
    }

    // =========================================================================
    // TRANSITION CONDITION ERRORS
    // =========================================================================

    /// Create an ambiguous transition conditions error.
    pub fn ambiguous_conditions(state: &str, target: &str, set: usize) -> Self {
        Self::new(
            PolicyErrorKind::AmbiguousConditions,
            format!(
                "Transition from '{}' to '{}' must set exactly one condition, found {}",
                state, target, set
            ),
        )
    }

    /// Create an invalid cron expression error.
    pub fn invalid_cron(state: &str, expr: &str, cause: &str) -> Self {
        Self::new(
            PolicyErrorKind::InvalidCron,
            format!(
                "Transition in state '{}' has unparseable cron expression '{}': {}",
                state, expr, cause
            ),
        )
    }

    // =========================================================================
    // ACTION CONFIG ERRORS
    // =========================================================================

    /// Create an invalid action configuration error.
    pub fn invalid_action(state: &str, action: &str, reason: impl Into<String>) -> Self {
        Self::new(
            PolicyErrorKind::InvalidActionConfig,
            format!(
                "Action '{}' in state '{}' is impossible: {}",
                action,
                state,
                reason.into()
            ),
        )
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PolicyError {}

/// Categories of policy validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyErrorKind {
    // =========================================================================
    // Policy shape errors
    // =========================================================================
    /// Policy id is empty.
    EmptyPolicyId,
    /// Policy has no states.
    NoStates,
    /// Default state does not resolve to a declared state.
    DefaultStateNotFound,
    /// Two states share a name.
    DuplicateStateName,

    // =========================================================================
    // State shape errors
    // =========================================================================
    /// Delete action is not the last action of its state.
    DeleteNotLast,
    /// A state with a delete action declares transitions.
    TransitionsAfterDelete,
    /// Transition target state does not exist.
    DanglingTransitionTarget,

    // =========================================================================
    // Transition condition errors
    // =========================================================================
    /// Conditions object sets zero or more than one condition.
    AmbiguousConditions,
    /// Cron expression does not parse.
    InvalidCron,

    // =========================================================================
    // Action config errors
    // =========================================================================
    /// Action parameters are structurally impossible.
    InvalidActionConfig,
}
